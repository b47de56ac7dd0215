//! 通过跳板会话发送 HTTP 请求
//!
//! The client keeps one tunnel lease per host:port it has talked to, so
//! repeated requests reuse the same binding; the leases go away with the
//! last clone of the client. Plain HTTP URLs are rewritten to
//! `127.0.0.1:<tunnel port>` with the original `Host` header. HTTPS URLs
//! with a domain name keep the name (and TLS SNI), pin its resolution to
//! 127.0.0.1 and dial the tunnel port.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HOST};
use reqwest::{Method, StatusCode, Url};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{JumpSshError, Result};
use crate::session::Session;
use crate::tunnel::TunnelLease;

/// Optional parts of a tunneled request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// 请求体取自本地文件
    pub local_file: Option<PathBuf>,
    /// 请求体取自远程主机上的文件
    pub remote_file: Option<String>,
    pub basic_auth: Option<(String, String)>,
    /// Verify TLS certificates.
    pub verify: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            local_file: None,
            remote_file: None,
            basic_auth: None,
            verify: true,
        }
    }
}

impl RequestOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn local_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_file = Some(path.into());
        self
    }

    pub fn remote_file(mut self, path: impl Into<String>) -> Self {
        self.remote_file = Some(path.into());
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn insecure(mut self) -> Self {
        self.verify = false;
        self
    }
}

/// Response as received from the remote service.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client whose requests leave from the session's host.
#[derive(Debug, Clone)]
pub struct RestSshClient {
    session: Session,
    leases: Arc<Mutex<HashMap<(String, u16), TunnelLease>>>,
}

impl RestSshClient {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    // 复用已有租约，父会话重开后失效的租约会被替换
    async fn tunnel_port(&self, host: &str, port: u16) -> Result<u16> {
        let mut leases = self.leases.lock().await;
        let key = (host.to_string(), port);
        if let Some(lease) = leases.get(&key).filter(|l| l.is_live()) {
            return Ok(lease.local_port());
        }
        let lease = self.session.tunnel_to(host, port).await?;
        let local_port = lease.local_port();
        leases.insert(key, lease);
        Ok(local_port)
    }

    async fn body_for(&self, url: &str, options: &RequestOptions) -> Result<Option<Bytes>> {
        let http_err = |reason: String| JumpSshError::Http {
            url: url.to_string(),
            reason,
        };

        if let Some(path) = &options.local_file {
            let is_file = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
            if !is_file {
                return Err(http_err(format!("本地文件路径无效 '{}'", path.display())));
            }
            return Ok(Some(Bytes::from(tokio::fs::read(path).await?)));
        }

        if let Some(path) = &options.remote_file {
            if !self.session.exists(path).await? {
                return Err(http_err(format!(
                    "远程文件路径无效 '{}' (主机 '{}')",
                    path,
                    self.session.host()
                )));
            }
            let channel = self.session.connection().await?.open_file_channel().await?;
            let read = async {
                let mut reader = channel.open_read(path).await?;
                let mut content = Vec::new();
                reader.read_to_end(&mut content).await?;
                Ok::<Vec<u8>, JumpSshError>(content)
            }
            .await;
            if let Err(e) = channel.close().await {
                debug!("关闭 SFTP 通道失败: {}", e);
            }
            return Ok(Some(Bytes::from(read?)));
        }

        Ok(options.body.clone())
    }

    /// Sends `method url` from the session's host and returns the response
    /// unchanged. Non-2xx statuses are not errors.
    pub async fn request(&self, method: Method, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        let http_err = |reason: String| JumpSshError::Http {
            url: url.to_string(),
            reason,
        };

        let original = Url::parse(url).map_err(|e| http_err(format!("URL 无效: {}", e)))?;
        let host = original
            .host_str()
            .ok_or_else(|| http_err("URL 缺少主机名".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = original
            .port_or_known_default()
            .ok_or_else(|| http_err("无法确定端口".to_string()))?;

        let body = self.body_for(url, &options).await?;

        let local_port = self.tunnel_port(&host, port).await?;

        let mut client = reqwest::Client::builder().no_proxy();
        if !options.verify {
            client = client.danger_accept_invalid_certs(true);
        }

        let mut target = original.clone();
        let original_host = original.host_str().unwrap_or(&host);
        let host_header = match original.port() {
            Some(port) => format!("{}:{}", original_host, port),
            None => original_host.to_string(),
        };
        let pin_domain = original.scheme() == "https" && host.parse::<IpAddr>().is_err();
        if pin_domain {
            // 域名保留给 SNI 和证书校验，解析固定到本地隧道
            client = client.resolve(&host, SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)));
        } else {
            target
                .set_ip_host(Ipv4Addr::LOCALHOST.into())
                .map_err(|_| http_err("无法改写主机".to_string()))?;
        }
        target
            .set_port(Some(local_port))
            .map_err(|_| http_err("无法改写端口".to_string()))?;

        if !options.query.is_empty() {
            target
                .query_pairs_mut()
                .extend_pairs(options.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let client = client
            .build()
            .map_err(|e| http_err(format!("无法创建 HTTP 客户端: {}", e)))?;

        let mut request = client.request(method.clone(), target).header(HOST, host_header);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &options.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(
            "经由 '{}' 发送 {} {} (本地端口 {})",
            self.session.identity(),
            method,
            url,
            local_port
        );
        let response = request.send().await.map_err(|e| http_err(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| http_err(e.to_string()))?;

        Ok(HttpResponse { status, headers, body })
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn patch(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::PATCH, url, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::DELETE, url, options).await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::HEAD, url, options).await
    }

    pub async fn options(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.request(Method::OPTIONS, url, options).await
    }
}
