use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::JumpSshError;

/// 默认 SSH 端口
pub const SSH_PORT: u16 = 22;

/// Authentication material for one session.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    /// 私钥口令
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn private_key(path: impl Into<PathBuf>) -> Self {
        Self {
            private_key: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.private_key.is_none()
    }
}

// 不打印密码和口令
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

/// How many extra attempts an operation gets after the first one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Count(u32),
    Forever,
}

impl RetryLimit {
    /// `attempts_done` counts attempts already made, including the first.
    pub fn allows_another(&self, attempts_done: u32) -> bool {
        match self {
            RetryLimit::Count(n) => attempts_done <= *n,
            RetryLimit::Forever => true,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        RetryLimit::Count(0)
    }
}

impl From<u32> for RetryLimit {
    fn from(n: u32) -> Self {
        RetryLimit::Count(n)
    }
}

/// 服务器主机密钥校验策略，具体校验交给传输层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// 自动接受未知主机密钥
    #[default]
    AcceptAll,
    /// 使用 ~/.ssh/known_hosts 校验
    KnownHosts,
}

/// Transport-level knobs passed through to the SSH client.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

/// Parameters of one `open()` call.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub timeout: Duration,
    pub retry: RetryLimit,
    pub retry_interval: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryLimit::Count(0),
            retry_interval: Duration::from_secs(10),
        }
    }
}

impl OpenOptions {
    pub fn with_retry(mut self, retry: impl Into<RetryLimit>, interval: Duration) -> Self {
        self.retry = retry.into();
        self.retry_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Connection parameters of a session. Creating one performs no network I/O.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    pub connect: ConnectOptions,
    /// 自动重连时使用的打开参数
    pub open: OpenOptions,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: SSH_PORT,
            user: user.into(),
            credentials: Credentials::default(),
            connect: ConnectOptions::default(),
            open: OpenOptions::default(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials.password = Some(password.into());
        self
    }

    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials.private_key = Some(path.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn connect_options(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }

    pub fn open_options(mut self, open: OpenOptions) -> Self {
        self.open = open;
        self
    }

    /// `user@host:port`
    pub fn identity(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One hop of a jump chain, written as `user@host[:port]` on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl FromStr for HopSpec {
    type Err = JumpSshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (user, rest) = match s.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(JumpSshError::InvalidInput(format!("用户名为空: '{}'", s))),
            None => (None, s),
        };

        // [ipv6]:port
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| JumpSshError::InvalidInput(format!("IPv6 地址缺少 ']': '{}'", s)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => SSH_PORT,
                None => return Err(JumpSshError::InvalidInput(format!("无法解析主机: '{}'", s))),
            };
            (host.to_string(), port)
        } else {
            match rest.split_once(':') {
                Some((host, p)) => (host.to_string(), parse_port(p, s)?),
                None => (rest.to_string(), SSH_PORT),
            }
        };

        if host.is_empty() {
            return Err(JumpSshError::InvalidInput(format!("主机名为空: '{}'", s)));
        }

        Ok(HopSpec { user, host, port })
    }
}

fn parse_port(p: &str, whole: &str) -> Result<u16, JumpSshError> {
    p.parse::<u16>()
        .map_err(|_| JumpSshError::InvalidInput(format!("端口无效: '{}'", whole)))
}
