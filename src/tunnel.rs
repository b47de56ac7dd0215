//! 跳板隧道
//!
//! A parent session owns one `TunnelRegistry`. Each binding is a local port
//! on 127.0.0.1 plus one forwarding loop that relays every accepted local
//! connection through a fresh `direct-tcpip` channel of the parent's
//! connection. Bindings are reference counted through `TunnelLease`s and
//! shared between everyone who targets the same `host:port`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{JumpSshError, Result};
use crate::transport::{TransportConnection, TunnelIo};

const RELAY_BUFFER_SIZE: usize = 16384;
// accept 出错后 (如 EMFILE) 的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type TunnelKey = (String, u16);

struct Binding {
    id: u64,
    local_port: u16,
    refs: usize,
    token: CancellationToken,
}

struct RegistryState {
    // 父会话关闭时取消，所有转发循环随之退出
    root: CancellationToken,
    bindings: HashMap<TunnelKey, Binding>,
}

/// Tunnel bindings opened by one session acting as a jump server.
pub struct TunnelRegistry {
    owner: String,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    created: AtomicUsize,
}

/// Keeps a binding alive; the binding is torn down when its last lease drops.
pub struct TunnelLease {
    registry: Arc<TunnelRegistry>,
    key: TunnelKey,
    id: u64,
    local_port: u16,
    token: CancellationToken,
}

impl TunnelLease {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> (&str, u16) {
        (&self.key.0, self.key.1)
    }

    /// False once the binding was cancelled (parent closed).
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.id);
    }
}

impl std::fmt::Debug for TunnelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelLease")
            .field("target", &self.key)
            .field("local_port", &self.local_port)
            .field("live", &self.is_live())
            .finish()
    }
}

impl TunnelRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Mutex::new(RegistryState {
                root: CancellationToken::new(),
                bindings: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of bindings currently forwarding.
    pub fn active_bindings(&self) -> usize {
        self.state()
            .bindings
            .values()
            .filter(|b| !b.token.is_cancelled())
            .count()
    }

    /// Number of local ports bound over the registry's lifetime.
    pub fn bindings_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    // 已有可用绑定时直接复用
    fn reuse(self: &Arc<Self>, state: &mut RegistryState, key: &TunnelKey) -> Option<TunnelLease> {
        let binding = state.bindings.get_mut(key)?;
        if binding.token.is_cancelled() {
            state.bindings.remove(key);
            return None;
        }
        binding.refs += 1;
        debug!(
            "复用隧道 127.0.0.1:{} -> {}:{} (引用数 {})",
            binding.local_port, key.0, key.1, binding.refs
        );
        Some(TunnelLease {
            registry: Arc::clone(self),
            key: key.clone(),
            id: binding.id,
            local_port: binding.local_port,
            token: binding.token.clone(),
        })
    }

    /// Returns a lease on a binding to `host:port`, creating the binding if
    /// none is live. Fails with `Tunnel` when no local port can be bound or
    /// the parent refuses the channel; nothing is registered in that case.
    pub async fn acquire(
        self: &Arc<Self>,
        connection: Arc<dyn TransportConnection>,
        host: &str,
        port: u16,
    ) -> Result<TunnelLease> {
        let key: TunnelKey = (host.to_string(), port);
        if let Some(lease) = self.reuse(&mut self.state(), &key) {
            return Ok(lease);
        }

        let tunnel_err = |reason: String| JumpSshError::Tunnel {
            via: self.owner.clone(),
            target: format!("{}:{}", host, port),
            reason,
        };

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| tunnel_err(format!("无法绑定本地端口: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| tunnel_err(format!("无法获取本地端口: {}", e)))?
            .port();

        // 探测目标是否可达后立即关闭，通道只在本地连接到来时打开
        let mut reachable = connection
            .open_direct_tcpip(host, port)
            .await
            .map_err(|e| tunnel_err(e.to_string()))?;
        if let Err(e) = reachable.shutdown().await {
            debug!("关闭探测通道失败: {}", e);
        }
        drop(reachable);

        let mut state = self.state();
        if let Some(lease) = self.reuse(&mut state, &key) {
            // 并发创建时以先注册者为准
            return Ok(lease);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = state.root.child_token();
        state.bindings.insert(
            key.clone(),
            Binding {
                id,
                local_port,
                refs: 1,
                token: token.clone(),
            },
        );
        drop(state);
        self.created.fetch_add(1, Ordering::Relaxed);

        info!(
            "隧道已建立: 127.0.0.1:{} -> {}:{} (经由 {})",
            local_port, host, port, self.owner
        );

        tokio::spawn(forward_loop(
            listener,
            connection,
            key.clone(),
            token.clone(),
        ));

        Ok(TunnelLease {
            registry: Arc::clone(self),
            key,
            id,
            local_port,
            token,
        })
    }

    fn release(&self, key: &TunnelKey, id: u64) {
        let mut state = self.state();
        let Some(binding) = state.bindings.get_mut(key) else {
            return;
        };
        // 父会话重开后的新绑定不受旧租约影响
        if binding.id != id {
            return;
        }
        binding.refs = binding.refs.saturating_sub(1);
        if binding.refs == 0 {
            binding.token.cancel();
            let port = binding.local_port;
            state.bindings.remove(key);
            debug!("隧道 127.0.0.1:{} -> {}:{} 已释放", port, key.0, key.1);
        }
    }

    /// Cancels every forwarding loop. Used when the owning session closes.
    pub fn close_all(&self) {
        let mut state = self.state();
        if !state.bindings.is_empty() {
            debug!("关闭 {} 的 {} 个隧道", self.owner, state.bindings.len());
        }
        state.root.cancel();
        state.bindings.clear();
        state.root = CancellationToken::new();
    }
}

impl Drop for TunnelRegistry {
    fn drop(&mut self) {
        self.state().root.cancel();
    }
}

async fn forward_loop(
    listener: TcpListener,
    connection: Arc<dyn TransportConnection>,
    target: TunnelKey,
    token: CancellationToken,
) {
    let (host, port) = (target.0.as_str(), target.1);
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("接受隧道连接失败: {}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };
        debug!("隧道连接 {} -> {}:{}", peer, host, port);

        let channel = match connection.open_direct_tcpip(host, port).await {
            Ok(channel) => channel,
            Err(e) => {
                error!("打开到 {}:{} 的隧道通道失败: {}", host, port, e);
                continue;
            }
        };

        let conn_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = conn_token.cancelled() => debug!("隧道已取消，断开 {}", peer),
                _ = relay(stream, channel) => debug!("隧道连接 {} 结束", peer),
            }
        });
    }
    debug!("{}:{} 的转发循环结束", host, port);
}

// 在本地 TCP 流和隧道通道之间双向复制数据，一侧 EOF 时关闭另一侧的写端
async fn relay(local_stream: TcpStream, channel: Box<dyn TunnelIo>) {
    let (mut local_reader, mut local_writer) = local_stream.into_split();
    let (mut channel_reader, mut channel_writer) = tokio::io::split(channel);

    let remote_to_local = async {
        let mut buffer = [0u8; RELAY_BUFFER_SIZE];
        loop {
            match channel_reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = local_writer.write_all(&buffer[..n]).await {
                        debug!("写入本地连接失败: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("读取隧道通道失败: {}", e);
                    break;
                }
            }
        }
        let _ = local_writer.shutdown().await;
    };

    let local_to_remote = async {
        let mut buffer = [0u8; RELAY_BUFFER_SIZE];
        loop {
            match local_reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = channel_writer.write_all(&buffer[..n]).await {
                        debug!("写入隧道通道失败: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("读取本地连接失败: {}", e);
                    break;
                }
            }
        }
        let _ = channel_writer.shutdown().await;
    };

    tokio::join!(remote_to_local, local_to_remote);
}
