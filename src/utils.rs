use rand::distributions::Alphanumeric;
use rand::Rng;

/// 记录错误日志并转换为 anyhow 错误
///
/// 用法: `e!(expr, "错误信息")?`
///
/// # 示例
/// ```
/// # use anyhow::Result;
/// # use jump_ssh::e;
/// # fn example() -> Result<()> {
/// let result = e!(std::fs::read_to_string("non-existent.txt"), "读取文件失败");
/// assert!(result.is_err());
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[macro_export]
macro_rules! e {
    // 基本用法: e!(表达式, "错误消息")?
    ($e:expr, $msg:expr) => {
        $e.map_err(|e| {
            ::tracing::error!("{}: {}", $msg, e);
            ::anyhow::anyhow!("{}: {}", $msg, e)
        })
    };

    // 格式化用法: e!(表达式, "格式化消息 {}", 变量)?
    ($e:expr, $fmt:expr, $($arg:tt)*) => {
        $e.map_err(|e| {
            let msg = format!($fmt, $($arg)*);
            ::tracing::error!("{}: {}", msg, e);
            ::anyhow::anyhow!("{}: {}", msg, e)
        })
    };
}

/// 灵活的错误处理宏 - 支持不同日志级别
///
/// # 示例
/// ```
/// # use anyhow::Result;
/// # use jump_ssh::try_log;
/// # fn example() -> Result<()> {
/// // 默认error级别
/// let content = try_log!(std::fs::read_to_string("file.txt"), "读取文件失败");
/// assert!(content.is_err());
///
/// // 指定warn级别并格式化
/// let file_path = "data.json";
/// let data = try_log!(std::fs::read_to_string(file_path), warn, "无法读取文件 {}", file_path);
/// assert!(data.is_err());
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[macro_export]
macro_rules! try_log {
    // 基本用法: try_log!(expr, "消息")? - 默认error级别
    ($e:expr, $msg:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                ::tracing::error!("{}: {}", $msg, e);
                Err(::anyhow::anyhow!("{}: {}", $msg, e))
            }
        }
    };

    // 指定日志级别: try_log!(expr, error|warn|debug|info, "消息")?
    ($e:expr, $level:ident, $msg:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                ::tracing::$level!("{}: {}", $msg, e);
                Err(::anyhow::anyhow!("{}: {}", $msg, e))
            }
        }
    };

    // 支持格式化: try_log!(expr, error|warn|debug|info, "格式 {}", 变量)?
    ($e:expr, $level:ident, $fmt:expr, $($arg:tt)*) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                let msg = format!($fmt, $($arg)*);
                ::tracing::$level!("{}: {}", msg, e);
                Err(::anyhow::anyhow!("{}: {}", msg, e))
            }
        }
    };
}

/// Random alphanumeric string of `size` characters.
pub fn id_generator(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// 远程主机上的临时文件路径
pub fn remote_temp_path() -> String {
    format!("/tmp/{}", id_generator(15))
}

/// Escapes `text` for use inside a double-quoted POSIX shell string.
pub fn escape_double_quoted(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Single-quotes `text` for a POSIX shell.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}
