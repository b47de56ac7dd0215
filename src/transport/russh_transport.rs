use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tracing::{debug, trace, warn};

use super::{
    ChannelEvent, Endpoint, ExecChannel, FileChannel, RemoteReader, RemoteWriter, Transport,
    TransportConnection, TunnelIo,
};
use crate::config::{ConnectOptions, Credentials, HostKeyPolicy};
use crate::error::{JumpSshError, Result};

// ~/.ssh 下依次尝试的默认私钥
const DEFAULT_KEY_FILES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

// SSH 客户端处理程序
struct ClientHandler {
    host_name: String,
    host_port: u16,
    policy: HostKeyPolicy,
}

// 实现 russh 的客户端处理程序特质
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAll => {
                debug!("接受 {}:{} 的服务器公钥", self.host_name, self.host_port);
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => {
                match russh::keys::check_known_hosts(&self.host_name, self.host_port, server_public_key) {
                    Ok(known) => Ok(known),
                    Err(e) => {
                        warn!("校验 {}:{} 的主机密钥失败: {}", self.host_name, self.host_port, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Default transport: plain TCP to the endpoint, then `russh`.
#[derive(Debug, Default, Clone)]
pub struct RusshTransport;

impl RusshTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        timeout: Duration,
    ) -> Result<Box<dyn TransportConnection>> {
        let config = client::Config {
            keepalive_interval: options.keepalive_interval,
            inactivity_timeout: options.inactivity_timeout,
            ..Default::default()
        };
        trace!("SSH客户端配置详情: {:?}", config);

        let handler = ClientHandler {
            host_name: endpoint.host_name.clone(),
            host_port: endpoint.host_port,
            policy: options.host_key_policy,
        };

        let label = format!("{}:{}", endpoint.host_name, endpoint.host_port);
        let address = (endpoint.address.clone(), endpoint.port);
        let handle = tokio::time::timeout(timeout, client::connect(Arc::new(config), address, handler))
            .await
            .map_err(|_| JumpSshError::Connection {
                host: label.clone(),
                reason: format!("连接超时 ({}s)", timeout.as_secs()),
            })?
            .map_err(|e| JumpSshError::Connection {
                host: label.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(RusshConnection { handle, label }))
    }
}

struct RusshConnection {
    handle: Handle<ClientHandler>,
    label: String,
}

impl RusshConnection {
    fn transport_err(&self, e: impl std::fmt::Display) -> JumpSshError {
        JumpSshError::Transport {
            host: self.label.clone(),
            reason: e.to_string(),
        }
    }

    fn auth_err(&self, reason: impl Into<String>) -> JumpSshError {
        JumpSshError::Authentication {
            host: self.label.clone(),
            reason: reason.into(),
        }
    }

    async fn try_key(&mut self, user: &str, path: &Path, passphrase: Option<&str>) -> Result<bool> {
        let key = load_secret_key(path, passphrase)
            .map_err(|e| self.auth_err(format!("加载密钥 {:?} 失败: {}", path, e)))?;
        let hash_alg = self
            .handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .and_then(|alg| alg.flatten());
        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

        let result = self
            .handle
            .authenticate_publickey(user.to_string(), key_with_hash)
            .await
            .map_err(|e| JumpSshError::Connection {
                host: self.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(result.success())
    }

    async fn try_password(&mut self, user: &str, password: &str) -> Result<bool> {
        let result = self
            .handle
            .authenticate_password(user.to_string(), password.to_string())
            .await
            .map_err(|e| JumpSshError::Connection {
                host: self.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(result.success())
    }
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|p| p.is_file())
        .collect()
}

#[async_trait]
impl TransportConnection for RusshConnection {
    async fn authenticate(&mut self, user: &str, credentials: &Credentials) -> Result<()> {
        if let Some(path) = &credentials.private_key {
            debug!("使用密钥 {:?} 认证 {}", path, self.label);
            if self.try_key(user, path, credentials.passphrase.as_deref()).await? {
                return Ok(());
            }
        }

        if let Some(password) = &credentials.password {
            debug!("使用密码认证 {}", self.label);
            if self.try_password(user, password).await? {
                return Ok(());
            }
        }

        if credentials.is_empty() {
            for path in default_key_files() {
                debug!("尝试默认密钥 {:?}", path);
                // 默认密钥可能带口令或格式不支持，跳过即可
                match self.try_key(user, &path, None).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(JumpSshError::Authentication { reason, .. }) => debug!("{}", reason),
                    Err(e) => return Err(e),
                }
            }
        }

        Err(self.auth_err(format!("用户 '{}' 的认证被拒绝", user)))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn ping(&self) -> bool {
        !self.handle.is_closed() && self.handle.send_keepalive(true).await.is_ok()
    }

    async fn open_exec(&self) -> Result<Box<dyn ExecChannel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.transport_err(e))?;
        Ok(Box::new(RusshExecChannel {
            channel,
            label: self.label.clone(),
        }))
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn TunnelIo>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host.to_string(), port as u32, "127.0.0.1".to_string(), 0)
            .await
            .map_err(|e| self.transport_err(format!("direct-tcpip 到 {}:{} 被拒绝: {}", host, port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.transport_err(e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.transport_err(e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.transport_err(format!("SFTP 初始化失败: {}", e)))?;
        Ok(Box::new(RusshFileChannel {
            sftp,
            label: self.label.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| self.transport_err(e))
    }
}

struct RusshExecChannel {
    channel: Channel<client::Msg>,
    label: String,
}

impl RusshExecChannel {
    fn transport_err(&self, e: impl std::fmt::Display) -> JumpSshError {
        JumpSshError::Transport {
            host: self.label.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ExecChannel for RusshExecChannel {
    async fn request_pty(&mut self) -> Result<()> {
        self.channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| self.transport_err(e))
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| self.transport_err(e))
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { ref data } => ChannelEvent::Stdout(Bytes::copy_from_slice(data)),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    ChannelEvent::Stderr(Bytes::copy_from_slice(data))
                }
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::ExitSignal(format!("{:?}", signal_name))
                }
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Closed,
                _ => continue, // 忽略其他消息
            };
            return Some(event);
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| self.transport_err(e))
    }

    async fn interrupt(&mut self) -> Result<()> {
        // 有 PTY 时 Ctrl-C 由终端解释，否则依赖服务器支持 signal 请求
        if let Err(e) = self.channel.signal(Sig::INT).await {
            debug!("发送 SIGINT 失败: {}", e);
        }
        self.channel
            .data(&b"\x03"[..])
            .await
            .map_err(|e| self.transport_err(e))
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close().await.map_err(|e| self.transport_err(e))
    }
}

struct RusshFileChannel {
    sftp: SftpSession,
    label: String,
}

impl RusshFileChannel {
    fn sftp_err(&self, path: &str, e: SftpError) -> JumpSshError {
        let reason = match &e {
            SftpError::Status(status) if matches!(status.status_code, StatusCode::PermissionDenied) => {
                "权限不足".to_string()
            }
            SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile) => {
                "文件不存在".to_string()
            }
            other => other.to_string(),
        };
        JumpSshError::Transfer {
            host: self.label.clone(),
            path: path.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl FileChannel for RusshFileChannel {
    async fn open_read(&self, path: &str) -> Result<RemoteReader> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| self.sftp_err(path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| self.sftp_err(path, e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.sftp
            .try_exists(path)
            .await
            .map_err(|e| self.sftp_err(path, e))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| self.sftp_err(path, e))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| self.sftp_err(path, e))
    }

    async fn close(&self) -> Result<()> {
        self.sftp.close().await.map_err(|e| self.sftp_err("", e))
    }
}
