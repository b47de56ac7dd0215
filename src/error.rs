use thiserror::Error;

use crate::command::CommandResult;

/// Errors surfaced by sessions, tunnels, commands and transfers.
///
/// `host` fields always carry the session identity (`user@host:port`),
/// `command` fields only ever carry the redacted command text.
#[derive(Error, Debug)]
pub enum JumpSshError {
    #[error("无法连接到 '{host}': {reason}")]
    Connection { host: String, reason: String },

    #[error("认证失败 '{host}': {reason}")]
    Authentication { host: String, reason: String },

    #[error("隧道错误 ({via} -> {target}): {reason}")]
    Tunnel {
        via: String,
        target: String,
        reason: String,
    },

    #[error(
        "命令 ({}) 在 '{}' 上返回退出码 ({}), 期望 [{}]{}: {}",
        .0.command,
        .0.host,
        .0.exit_code,
        .0.success_exit_codes,
        retry_suffix(.0.runs),
        .0.error_text()
    )]
    CommandFailed(Box<CommandResult>),

    #[error("文件传输失败 '{host}' ({path}): {reason}")]
    Transfer {
        host: String,
        path: String,
        reason: String,
    },

    #[error("命令 ({command}) 在 '{host}' 上被中断")]
    Interrupted { host: String, command: String },

    #[error("传输通道异常 '{host}': {reason}")]
    Transport { host: String, reason: String },

    #[error("HTTP 请求失败 ({url}): {reason}")]
    Http { url: String, reason: String },

    #[error("参数无效: {0}")]
    InvalidInput(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JumpSshError>;

impl JumpSshError {
    /// Whether another attempt on the same session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JumpSshError::Connection { .. } | JumpSshError::Transport { .. }
        )
    }

    /// The command result carried by a `CommandFailed` error.
    pub fn command_result(&self) -> Option<&CommandResult> {
        match self {
            JumpSshError::CommandFailed(result) => Some(result),
            _ => None,
        }
    }
}

fn retry_suffix(runs: u32) -> String {
    if runs > 1 {
        format!(" (重试 {} 次后)", runs - 1)
    } else {
        String::new()
    }
}
