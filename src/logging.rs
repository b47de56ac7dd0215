//! 日志系统模块，提供统一的日志初始化

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// 确保日志系统只初始化一次
static INIT: Once = Once::new();

fn directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// 日志系统初始化函数
///
/// # 参数
/// * `default_level` - 默认日志级别
/// * `app_name` - 应用名称, 用于环境变量前缀 (`<APP>_LOG`, `<APP>_JSON`)
///
/// # 示例
/// ```
/// use jump_ssh::setup_logging;
///
/// // 默认使用 INFO 级别，可通过 JUMP_SSH_LOG 环境变量覆盖
/// setup_logging(tracing::Level::INFO, "JUMP_SSH");
/// ```
pub fn setup_logging(default_level: Level, app_name: &str) {
    INIT.call_once(|| {
        let level = directive(default_level);
        // jump_ssh=debug 意味着本库使用DEBUG级别，依赖库使用默认级别
        let filter = EnvFilter::try_from_env(format!("{}_LOG", app_name))
            .unwrap_or_else(|_| EnvFilter::new(format!("{},jump_ssh={}", level, level)));

        let json = std::env::var(format!("{}_JSON", app_name)).is_ok();
        let text_layer = (!json).then(|| {
            fmt::layer()
                .with_target(true) // 显示目标模块
                .with_thread_ids(true) // 在多线程环境中显示线程ID
                .with_file(true)
                .with_line_number(true)
        });
        let json_layer = json.then(|| fmt::layer().json());

        // russh 通过 log 输出，先桥接到 tracing
        if tracing_log::LogTracer::init().is_err() {
            return;
        }
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(text_layer)
            .with(json_layer);
        // 测试中可能已经设置过
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            return;
        }

        tracing::info!(
            "日志系统初始化完成 [{} {}]",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
    });
}
