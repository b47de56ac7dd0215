use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::command::{self, CommandResult, RunOptions};
use crate::config::{ConnectOptions, Credentials, OpenOptions, SessionConfig, SSH_PORT};
use crate::error::{JumpSshError, Result};
use crate::transport::{Endpoint, RusshTransport, Transport, TransportConnection};
use crate::tunnel::{TunnelLease, TunnelRegistry};

/// Target of `get_remote_session`.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    /// 默认与父会话相同
    pub user: Option<String>,
    pub credentials: Credentials,
    pub connect: Option<ConnectOptions>,
    pub open: OpenOptions,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: SSH_PORT,
            user: None,
            credentials: Credentials::default(),
            connect: None,
            open: OpenOptions::default(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
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

    pub fn open_options(mut self, open: OpenOptions) -> Self {
        self.open = open;
        self
    }
}

// 子会话只持有父会话的弱引用，仅用于申请隧道
struct ParentLink {
    session: Weak<SessionInner>,
    lease: Mutex<Option<TunnelLease>>,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    connection: RwLock<Option<Arc<dyn TransportConnection>>>,
    // 只保护 open/close 状态切换，不阻塞命令执行
    state_lock: Mutex<()>,
    // 至少成功打开过一次
    opened: AtomicBool,
    tunnels: Arc<TunnelRegistry>,
    remote_sessions: Mutex<HashMap<String, Session>>,
    parent: Option<ParentLink>,
}

/// Logical connection to one host, possibly reached through parent sessions.
///
/// Cloning is cheap and every clone refers to the same connection. Every
/// public operation reopens the session first when it is inactive.
///
/// ```no_run
/// use jump_ssh::{RemoteTarget, RunOptions, Session, SessionConfig};
///
/// # async fn demo() -> jump_ssh::Result<()> {
/// let gateway = Session::new(SessionConfig::new("gateway.example.com", "my_user").password("pw"));
/// let remote = gateway
///     .get_remote_session(RemoteTarget::new("remote.example.com").password("other_pw"))
///     .await?;
/// let result = remote.run_cmd("hostname", RunOptions::default()).await?;
/// assert_eq!(result.output, "remote.example.com");
/// gateway.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session over the default `russh` transport. No network I/O.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_transport(config, Arc::new(RusshTransport::new()))
    }

    pub fn with_transport(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::from_parts(config, transport, None)
    }

    fn from_parts(config: SessionConfig, transport: Arc<dyn Transport>, parent: Option<ParentLink>) -> Self {
        let tunnels = Arc::new(TunnelRegistry::new(config.identity()));
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                connection: RwLock::new(None),
                state_lock: Mutex::new(()),
                opened: AtomicBool::new(false),
                tunnels,
                remote_sessions: Mutex::new(HashMap::new()),
                parent,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    pub fn user(&self) -> &str {
        &self.inner.config.user
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// `user@host:port` of this hop only.
    pub fn identity(&self) -> String {
        self.inner.config.identity()
    }

    /// The session this one is tunneled through, if it is still alive.
    pub fn parent(&self) -> Option<Session> {
        let link = self.inner.parent.as_ref()?;
        link.session.upgrade().map(|inner| Session { inner })
    }

    /// Tunnel bindings this session owns as a jump server.
    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.inner.tunnels
    }

    async fn current(&self) -> Option<Arc<dyn TransportConnection>> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Cheap local check: a connection handle is held and not closed.
    pub async fn is_active(&self) -> bool {
        self.current().await.is_some()
    }

    /// Sends a keepalive request and waits for the answer.
    pub async fn is_alive(&self) -> bool {
        match self.current().await {
            Some(connection) => connection.ping().await,
            None => false,
        }
    }

    /// Opens with the options from the session config.
    pub async fn open_default(&self) -> Result<()> {
        self.open(self.inner.config.open.clone()).await
    }

    /// Connects and authenticates. No-op when already open.
    ///
    /// Connection failures are retried per `options.retry`; rejected
    /// credentials are not.
    pub async fn open(&self, options: OpenOptions) -> Result<()> {
        let _guard = self.inner.state_lock.lock().await;
        if self.is_active().await {
            debug!("'{}' 已连接", self.identity());
            return Ok(());
        }

        let identity = self.identity();
        let mut attempts = 0u32;
        let connection = loop {
            attempts += 1;
            let endpoint = self.endpoint().await?;
            match self.connect_once(&endpoint, &options).await {
                Ok(connection) => break connection,
                Err(e @ JumpSshError::Authentication { .. }) => return Err(e),
                Err(e) if options.retry.allows_another(attempts) => {
                    warn!(
                        attempt = attempts,
                        "暂时无法连接到 '{}': {}，{:?} 后继续重试...",
                        identity, e, options.retry_interval
                    );
                    tokio::time::sleep(options.retry_interval).await;
                }
                Err(e) => {
                    let reason = match e {
                        JumpSshError::Connection { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return Err(JumpSshError::Connection { host: identity, reason });
                }
            }
        };

        // 旧连接上的隧道已经失效
        self.inner.tunnels.close_all();
        *self.inner.connection.write().await = Some(connection);
        self.inner.opened.store(true, Ordering::SeqCst);
        info!("成功连接到 '{}'", self);
        Ok(())
    }

    async fn connect_once(
        &self,
        endpoint: &Endpoint,
        options: &OpenOptions,
    ) -> Result<Arc<dyn TransportConnection>> {
        let config = &self.inner.config;
        let mut connection = self
            .inner
            .transport
            .connect(endpoint, &config.connect, options.timeout)
            .await?;

        let auth = connection.authenticate(&config.user, &config.credentials);
        match tokio::time::timeout(options.timeout, auth).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(JumpSshError::Connection {
                    host: self.identity(),
                    reason: format!("认证超时 ({}s)", options.timeout.as_secs()),
                })
            }
        }
        Ok(Arc::from(connection))
    }

    // 直连时就是 host:port，经跳板时是父会话上隧道的本地端口
    async fn endpoint(&self) -> Result<Endpoint> {
        let config = &self.inner.config;
        let Some(link) = &self.inner.parent else {
            return Ok(Endpoint::direct(&config.host, config.port));
        };

        let mut lease = link.lease.lock().await;
        if let Some(current) = lease.as_ref().filter(|l| l.is_live()) {
            return Ok(Endpoint::tunneled(current.local_port(), &config.host, config.port));
        }
        *lease = None;

        let parent = link.session.upgrade().map(|inner| Session { inner }).ok_or_else(|| {
            JumpSshError::Tunnel {
                via: "(已释放)".to_string(),
                target: format!("{}:{}", config.host, config.port),
                reason: "父会话已释放".to_string(),
            }
        })?;
        let fresh = Box::pin(parent.tunnel_to(&config.host, config.port)).await?;
        let endpoint = Endpoint::tunneled(fresh.local_port(), &config.host, config.port);
        *lease = Some(fresh);
        Ok(endpoint)
    }

    /// Live connection, reopening the session if it went inactive.
    pub(crate) async fn connection(&self) -> Result<Arc<dyn TransportConnection>> {
        if let Some(connection) = self.current().await {
            return Ok(connection);
        }
        debug!("'{}' 未连接，自动重新打开", self.identity());
        self.open_default().await?;
        self.current().await.ok_or_else(|| JumpSshError::Transport {
            host: self.identity(),
            reason: "连接在打开后立即断开".to_string(),
        })
    }

    /// Lease on a local port forwarded through this session to `host:port`.
    /// An existing live binding to the same target is reused.
    pub async fn tunnel_to(&self, host: &str, port: u16) -> Result<TunnelLease> {
        let connection = self.connection().await?;
        self.inner.tunnels.acquire(connection, host, port).await
    }

    /// Session to `target` tunneled through this one. The returned session
    /// is not opened yet; the first operation (or `open`) authenticates
    /// through the tunnel.
    pub async fn get_remote_session(&self, target: RemoteTarget) -> Result<Session> {
        let user = target.user.clone().unwrap_or_else(|| self.user().to_string());
        let key = format!("{}_{}_{}", target.host, target.port, user).to_lowercase();

        let mut cache = self.inner.remote_sessions.lock().await;
        if let Some(existing) = cache.get(&key) {
            // 尚未打开的子会话同样复用，只有打开后又断开的才重建
            if existing.is_active().await || !existing.inner.opened.load(Ordering::SeqCst) {
                return Ok(existing.clone());
            }
        }

        info!(
            "正在通过 '{}' 以用户 '{}' 连接 '{}:{}'...",
            self.host(),
            user,
            target.host,
            target.port
        );
        let lease = self.tunnel_to(&target.host, target.port).await?;

        let config = SessionConfig {
            host: target.host,
            port: target.port,
            user,
            credentials: target.credentials,
            connect: target.connect.unwrap_or_else(|| self.inner.config.connect.clone()),
            open: target.open,
        };
        let link = ParentLink {
            session: Arc::downgrade(&self.inner),
            lease: Mutex::new(Some(lease)),
        };
        let child = Session::from_parts(config, Arc::clone(&self.inner.transport), Some(link));
        // 先拿到新租约再关闭旧的缓存会话，隧道绑定得以复用
        if let Some(stale) = cache.insert(key, child.clone()) {
            stale.close_boxed().await;
        }
        Ok(child)
    }

    /// Closes remote sessions opened from this one, every tunnel it owns, and
    /// its own connection. Idempotent.
    pub async fn close(&self) {
        let children: Vec<Session> = self.inner.remote_sessions.lock().await.values().cloned().collect();
        // 先关闭子会话，避免与子会话的 open 互相等待
        join_all(children.iter().map(|child| child.close_boxed())).await;

        let _guard = self.inner.state_lock.lock().await;
        self.inner.tunnels.close_all();
        if let Some(connection) = self.inner.connection.write().await.take() {
            if !connection.is_closed() {
                debug!("正在关闭与 '{}' 的连接...", self.identity());
                if let Err(e) = connection.disconnect().await {
                    debug!("断开 '{}' 时出错: {}", self.identity(), e);
                }
            }
        }
        if let Some(link) = &self.inner.parent {
            link.lease.lock().await.take();
        }
    }

    fn close_boxed(&self) -> BoxFuture<'_, ()> {
        self.close().boxed()
    }

    /// Runs `command` on the remote host.
    pub async fn run_cmd(&self, command: &str, options: RunOptions) -> Result<CommandResult> {
        command::run(self, command, options).await
    }

    /// Output of `command`.
    pub async fn get_cmd_output(&self, command: &str, options: RunOptions) -> Result<String> {
        Ok(self.run_cmd(command, options).await?.output)
    }

    /// Exit code of `command`; never fails on a non-success exit code.
    pub async fn get_exit_code(&self, command: &str, options: RunOptions) -> Result<i32> {
        Ok(self.run_cmd(command, options.no_raise()).await?.exit_code)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{} -> ", parent)?;
        }
        write!(f, "{}", self.identity())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("user", &self.inner.config.user)
            .field("credentials", &self.inner.config.credentials)
            .field("parent", &self.parent().map(|p| p.identity()))
            .finish()
    }
}
