//! 传输通道抽象
//!
//! A `Transport` dials one SSH server and yields a `TransportConnection`;
//! the connection hands out independent channels (exec, direct-tcpip, sftp)
//! that may be opened concurrently on the same physical link.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ConnectOptions, Credentials};
use crate::error::Result;

pub mod russh_transport;

pub use russh_transport::RusshTransport;

/// Where to dial, and who we believe we are talking to.
///
/// For a tunneled session `address`/`port` point at the local end of the
/// tunnel while `host_name`/`host_port` keep the real target, used for
/// host-key checks and error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub host_name: String,
    pub host_port: u16,
}

impl Endpoint {
    pub fn direct(host: &str, port: u16) -> Self {
        Self {
            address: host.to_string(),
            port,
            host_name: host.to_string(),
            host_port: port,
        }
    }

    pub fn tunneled(local_port: u16, host: &str, port: u16) -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: local_port,
            host_name: host.to_string(),
            host_port: port,
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.address != self.host_name || self.port != self.host_port
    }
}

/// 通道上收到的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
}

/// Byte stream carried by a direct-tcpip channel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type RemoteReader = Box<dyn AsyncRead + Unpin + Send>;
pub type RemoteWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// 建立连接
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        timeout: Duration,
    ) -> Result<Box<dyn TransportConnection>>;
}

/// One live SSH connection to a single host.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Fails with `Authentication` when the server rejects the credentials.
    async fn authenticate(&mut self, user: &str, credentials: &Credentials) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// 轻量级探测 (keepalive)
    async fn ping(&self) -> bool;

    async fn open_exec(&self) -> Result<Box<dyn ExecChannel>>;

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn TunnelIo>>;

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>>;

    async fn disconnect(&self) -> Result<()>;
}

/// A session channel running one command.
#[async_trait]
pub trait ExecChannel: Send {
    async fn request_pty(&mut self) -> Result<()>;

    async fn exec(&mut self, command: &str) -> Result<()>;

    /// `None` once the channel is gone.
    async fn wait(&mut self) -> Option<ChannelEvent>;

    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// 发送中断 (SIGINT / Ctrl-C)
    async fn interrupt(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// File-transfer sub-protocol. Contents are raw bytes, never transcoded.
#[async_trait]
pub trait FileChannel: Send + Sync {
    async fn open_read(&self, path: &str) -> Result<RemoteReader>;

    /// Creates or truncates `path`.
    async fn open_write(&self, path: &str) -> Result<RemoteWriter>;

    /// `Ok(false)` only for "no such file"; other failures propagate.
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
