//! 测试用的内存 SSH 网络
//!
//! `MockTransport` implements the transport traits against a scripted set of
//! hosts. Tunneled sessions really dial the local tunnel port and exchange a
//! tiny banner with the far end, so a working chain proves the forwarding
//! loops carry traffic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;

use jump_ssh::config::{ConnectOptions, Credentials};
use jump_ssh::transport::{
    ChannelEvent, Endpoint, ExecChannel, FileChannel, RemoteReader, RemoteWriter, Transport, TransportConnection,
    TunnelIo,
};
use jump_ssh::{JumpSshError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub owner: String,
    pub mode: u32,
}

struct MockHost {
    port: u16,
    users: HashMap<String, String>,
    // 只能经由跳板访问
    internal: bool,
    files: HashMap<String, MockFile>,
}

#[derive(Clone, Copy)]
enum Service {
    Echo,
    Http,
    // 记录收到的第一段数据后断开
    Capture,
}

#[derive(Default)]
struct NetState {
    hosts: HashMap<String, MockHost>,
    services: HashMap<(String, u16), Service>,
    refuse_connects: HashMap<String, u32>,
    drop_execs: u32,
    refused_targets: HashSet<(String, u16)>,
    connections: Vec<(String, Arc<AtomicBool>)>,
    commands: Vec<String>,
    captured: HashMap<(String, u16), Vec<u8>>,
    // 远端 sshd 等待握手的时间，超时后断开
    login_grace: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    auths: AtomicUsize,
    execs: AtomicUsize,
    direct_tcpip: AtomicUsize,
    file_channels: AtomicUsize,
    interrupts: AtomicUsize,
    disconnects: AtomicUsize,
    active_execs: AtomicUsize,
    max_active_execs: AtomicUsize,
    far_end_open: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<NetState>>,
    counters: Arc<Counters>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    fn add_host(self, name: &str, users: &[(&str, &str)], internal: bool) -> Self {
        let host = MockHost {
            port: 22,
            users: users
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
            internal,
            files: HashMap::new(),
        };
        self.state().hosts.insert(name.to_string(), host);
        self
    }

    /// Host reachable directly.
    pub fn host(self, name: &str, users: &[(&str, &str)]) -> Self {
        self.add_host(name, users, false)
    }

    /// Host reachable only through a tunnel.
    pub fn internal_host(self, name: &str, users: &[(&str, &str)]) -> Self {
        self.add_host(name, users, true)
    }

    pub fn echo_service(self, host: &str, port: u16) -> Self {
        self.state().services.insert((host.to_string(), port), Service::Echo);
        self
    }

    pub fn http_service(self, host: &str, port: u16) -> Self {
        self.state().services.insert((host.to_string(), port), Service::Http);
        self
    }

    pub fn capture_service(self, host: &str, port: u16) -> Self {
        self.state().services.insert((host.to_string(), port), Service::Capture);
        self
    }

    /// First bytes a `capture_service` received.
    pub fn captured(&self, host: &str, port: u16) -> Option<Vec<u8>> {
        self.state().captured.get(&(host.to_string(), port)).cloned()
    }

    /// Far-end sshd drops tunneled connections that stay silent this long.
    pub fn login_grace(&self, grace: Duration) {
        self.state().login_grace = Some(grace);
    }

    pub fn refuse_connects(&self, host: &str, times: u32) {
        self.state().refuse_connects.insert(host.to_string(), times);
    }

    /// The next `times` exec channels close without an exit status.
    pub fn drop_execs(&self, times: u32) {
        self.state().drop_execs = times;
    }

    pub fn refuse_target(&self, host: &str, port: u16) {
        self.state().refused_targets.insert((host.to_string(), port));
    }

    /// Marks every live connection to `host` as dropped.
    pub fn kill_connections(&self, host: &str) {
        for (h, closed) in &self.state().connections {
            if h == host {
                closed.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn add_file(&self, host: &str, path: &str, data: &[u8], owner: &str, mode: u32) {
        let mut state = self.state();
        if let Some(h) = state.hosts.get_mut(host) {
            h.files.insert(
                path.to_string(),
                MockFile {
                    data: data.to_vec(),
                    owner: owner.to_string(),
                    mode,
                },
            );
        }
    }

    pub fn file(&self, host: &str, path: &str) -> Option<MockFile> {
        self.state().hosts.get(host)?.files.get(path).cloned()
    }

    pub fn paths(&self, host: &str) -> Vec<String> {
        self.state()
            .hosts
            .get(host)
            .map(|h| h.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Commands exactly as received by exec channels.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.counters.auths.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.counters.execs.load(Ordering::SeqCst)
    }

    pub fn direct_tcpip(&self) -> usize {
        self.counters.direct_tcpip.load(Ordering::SeqCst)
    }

    pub fn file_channels(&self) -> usize {
        self.counters.file_channels.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.counters.interrupts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    pub fn max_active_execs(&self) -> usize {
        self.counters.max_active_execs.load(Ordering::SeqCst)
    }

    /// Far-end connections (sshd or service) currently open.
    pub fn far_end_open(&self) -> usize {
        self.counters.far_end_open.load(Ordering::SeqCst)
    }

    fn spawn_far_end(&self, serve: impl Future<Output = ()> + Send + 'static) {
        let counters = self.counters.clone();
        counters.far_end_open.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            serve.await;
            counters.far_end_open.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn handshake(endpoint: &Endpoint) -> Result<TcpStream> {
    let err = |reason: String| JumpSshError::Connection {
        host: format!("{}:{}", endpoint.host_name, endpoint.host_port),
        reason,
    };
    let mut stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port))
        .await
        .map_err(|e| err(e.to_string()))?;
    let hello = format!("HELLO {}:{}\n", endpoint.host_name, endpoint.host_port);
    stream
        .write_all(hello.as_bytes())
        .await
        .map_err(|e| err(e.to_string()))?;
    let mut reply = [0u8; 3];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| err(format!("banner: {}", e)))?;
    if &reply != b"OK\n" {
        return Err(err("unexpected banner".to_string()));
    }
    Ok(stream)
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _options: &ConnectOptions,
        timeout: Duration,
    ) -> Result<Box<dyn TransportConnection>> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let host = endpoint.host_name.clone();
        let label = format!("{}:{}", host, endpoint.host_port);
        let refuse = |reason: &str| JumpSshError::Connection {
            host: label.clone(),
            reason: reason.to_string(),
        };

        {
            let mut state = self.state();
            if let Some(left) = state.refuse_connects.get_mut(&host) {
                if *left > 0 {
                    *left -= 1;
                    return Err(refuse("Connection refused"));
                }
            }
            match state.hosts.get(&host) {
                None => return Err(refuse("Name or service not known")),
                Some(h) if h.internal && !endpoint.is_tunneled() => {
                    return Err(refuse("Network is unreachable"))
                }
                Some(_) => {}
            }
        }

        let link = if endpoint.is_tunneled() {
            let stream = tokio::time::timeout(timeout, handshake(endpoint))
                .await
                .map_err(|_| refuse("timed out"))??;
            Some(stream)
        } else {
            None
        };

        let closed = Arc::new(AtomicBool::new(false));
        self.state().connections.push((host.clone(), closed.clone()));
        Ok(Box::new(MockConnection {
            net: self.clone(),
            host,
            label,
            user: String::new(),
            closed,
            link: Mutex::new(link),
        }))
    }
}

struct MockConnection {
    net: MockTransport,
    host: String,
    label: String,
    user: String,
    closed: Arc<AtomicBool>,
    link: Mutex<Option<TcpStream>>,
}

impl MockConnection {
    fn gone(&self) -> JumpSshError {
        JumpSshError::Transport {
            host: self.label.clone(),
            reason: "connection closed".to_string(),
        }
    }
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn authenticate(&mut self, user: &str, credentials: &Credentials) -> Result<()> {
        self.net.counters.auths.fetch_add(1, Ordering::SeqCst);
        let expected = self
            .net
            .state()
            .hosts
            .get(&self.host)
            .and_then(|h| h.users.get(user).cloned());
        match (expected, credentials.password.as_deref()) {
            (Some(expected), Some(given)) if expected == given => {
                self.user = user.to_string();
                Ok(())
            }
            _ => Err(JumpSshError::Authentication {
                host: format!("{}@{}", user, self.label),
                reason: "所有认证方式均被拒绝".to_string(),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> bool {
        !self.is_closed()
    }

    async fn open_exec(&self) -> Result<Box<dyn ExecChannel>> {
        if self.is_closed() {
            return Err(self.gone());
        }
        self.net.counters.execs.fetch_add(1, Ordering::SeqCst);
        let dropped = {
            let mut state = self.net.state();
            if state.drop_execs > 0 {
                state.drop_execs -= 1;
                true
            } else {
                false
            }
        };
        let active = self.net.counters.active_execs.fetch_add(1, Ordering::SeqCst) + 1;
        self.net
            .counters
            .max_active_execs
            .fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(MockExecChannel {
            net: self.net.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            queue: VecDeque::new(),
            mode: Mode::Scripted,
            dropped,
        }))
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn TunnelIo>> {
        if self.is_closed() {
            return Err(self.gone());
        }
        self.net.counters.direct_tcpip.fetch_add(1, Ordering::SeqCst);
        let refused = || JumpSshError::Transport {
            host: self.label.clone(),
            reason: format!("Connect failed to {}:{}", host, port),
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let state = self.net.state();
        if state.refused_targets.contains(&(host.to_string(), port)) {
            return Err(refused());
        }
        if state.hosts.get(host).map(|h| h.port) == Some(port) {
            self.net
                .spawn_far_end(serve_ssh(server, format!("{}:{}", host, port), state.login_grace));
        } else {
            match state.services.get(&(host.to_string(), port)) {
                Some(Service::Echo) => self.net.spawn_far_end(serve_echo(server)),
                Some(Service::Http) => self
                    .net
                    .spawn_far_end(serve_http(server, format!("{}:{}", host, port))),
                Some(Service::Capture) => self.net.spawn_far_end(serve_capture(
                    server,
                    self.net.clone(),
                    (host.to_string(), port),
                )),
                None => return Err(refused()),
            }
        }
        Ok(Box::new(client))
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>> {
        if self.is_closed() {
            return Err(self.gone());
        }
        self.net.counters.file_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFileChannel {
            net: self.net.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            label: self.label.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.link.lock().unwrap().take();
        self.net.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn serve_ssh(mut io: DuplexStream, expected: String, login_grace: Option<Duration>) {
    let mut line = Vec::new();
    let read_hello = async {
        let mut byte = [0u8; 1];
        loop {
            match io.read(&mut byte).await {
                Ok(1) if byte[0] == b'\n' => return true,
                Ok(1) => line.push(byte[0]),
                _ => return false,
            }
        }
    };
    let greeted = match login_grace {
        Some(grace) => tokio::time::timeout(grace, read_hello).await.unwrap_or(false),
        None => read_hello.await,
    };
    if !greeted {
        return;
    }
    if line != format!("HELLO {}", expected).into_bytes() {
        let _ = io.write_all(b"NO\n").await;
        return;
    }
    if io.write_all(b"OK\n").await.is_err() {
        return;
    }
    let mut buffer = [0u8; 256];
    while let Ok(n) = io.read(&mut buffer).await {
        if n == 0 {
            break;
        }
    }
}

async fn serve_capture(mut io: DuplexStream, net: MockTransport, key: (String, u16)) {
    let mut buffer = vec![0u8; 16 * 1024];
    let n = io.read(&mut buffer).await.unwrap_or(0);
    if n > 0 {
        buffer.truncate(n);
        net.state().captured.insert(key, buffer);
    }
}

async fn serve_echo(io: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
}

async fn serve_http(io: DuplexStream, served_by: String) {
    let mut reader = BufReader::new(io);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.is_err() {
        return;
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) if line == "\r\n" => break,
            Ok(_) => headers.push(line.trim_end().to_string()),
        }
    }
    let header = |name: &str| {
        headers.iter().find_map(|h| {
            let (k, v) = h.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    };

    let length: usize = header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if reader.read_exact(&mut body).await.is_err() {
        return;
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    let status = if path.starts_with("/missing") {
        "404 Not Found"
    } else {
        "200 OK"
    };
    let payload = format!(
        "method={} path={} host={} auth={} body={}",
        method,
        path,
        header("host").unwrap_or_default(),
        header("authorization").is_some(),
        String::from_utf8_lossy(&body)
    );
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Served-By: {}\r\nConnection: close\r\n\r\n",
        status,
        payload.len(),
        served_by
    );
    if method != "HEAD" {
        response.push_str(&payload);
    }

    let mut io = reader.into_inner();
    let _ = io.write_all(response.as_bytes()).await;
    let _ = io.shutdown().await;
}

enum Mode {
    Scripted,
    Hang,
    AwaitInput,
    Delay(Duration),
}

struct MockExecChannel {
    net: MockTransport,
    host: String,
    user: String,
    queue: VecDeque<ChannelEvent>,
    mode: Mode,
    dropped: bool,
}

impl Drop for MockExecChannel {
    fn drop(&mut self) {
        self.net.counters.active_execs.fetch_sub(1, Ordering::SeqCst);
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Effective user and the command it runs.
pub fn unwrap_sudo(command: &str, login: &str) -> (String, String) {
    if let Some(rest) = command.strip_prefix("sudo su - ") {
        if let Some((user, tail)) = rest.split_once(' ') {
            if let Some(inner) = tail.strip_prefix("-c \"").and_then(|t| t.strip_suffix('"')) {
                return (user.to_string(), unescape(inner));
            }
        }
    }
    if let Some(rest) = command.strip_prefix("sudo ") {
        return ("root".to_string(), rest.to_string());
    }
    (login.to_string(), command.to_string())
}

/// Splits on whitespace, honouring single quotes and backslash escapes.
pub fn shell_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    }
}

fn readable(file: &MockFile, user: &str) -> bool {
    user == "root" || file.owner == user || file.mode & 0o004 != 0
}

fn writable_dir(dir: &str, user: &str) -> bool {
    user == "root" || dir == "/tmp" || dir == format!("/home/{}", user)
}

fn run_fs(files: &mut HashMap<String, MockFile>, user: &str, words: &[String]) -> (String, String, u32) {
    let ok = || (String::new(), String::new(), 0);
    let fail = |msg: String| (String::new(), msg, 1);
    let is_root = user == "root";
    let arg = |i: usize| words.get(i).cloned().unwrap_or_default();
    // Some(是否有权限)，None 表示文件不存在
    let owned = |files: &HashMap<String, MockFile>, path: &str| {
        files.get(path).map(|f| is_root || f.owner == user)
    };

    match words[0].as_str() {
        "ls" => {
            let path = arg(1);
            let prefix = format!("{}/", path);
            if files.contains_key(&path) || files.keys().any(|k| k.starts_with(&prefix)) {
                (path, String::new(), 0)
            } else {
                (
                    String::new(),
                    format!("ls: cannot access '{}': No such file or directory", path),
                    2,
                )
            }
        }
        "mv" => {
            let (src, dst) = (arg(1), arg(2));
            match owned(files, &src) {
                Some(true) => {
                    if let Some(f) = files.remove(&src) {
                        files.insert(dst, f);
                    }
                    ok()
                }
                Some(false) => fail("mv: Permission denied".to_string()),
                None => fail(format!("mv: cannot stat '{}'", src)),
            }
        }
        "cp" => {
            let (src, dst) = (arg(1), arg(2));
            match files.get(&src).cloned() {
                Some(f) if readable(&f, user) => {
                    let copy = MockFile {
                        data: f.data,
                        owner: user.to_string(),
                        mode: f.mode,
                    };
                    files.insert(dst, copy);
                    ok()
                }
                Some(_) => fail("cp: Permission denied".to_string()),
                None => fail(format!("cp: cannot stat '{}'", src)),
            }
        }
        "chmod" => {
            let (mode, path) = (arg(1), arg(2));
            match owned(files, &path) {
                Some(true) => {
                    if let Some(f) = files.get_mut(&path) {
                        if mode == "a+r" {
                            f.mode |= 0o444;
                        } else if let Ok(m) = u32::from_str_radix(&mode, 8) {
                            f.mode = m;
                        }
                    }
                    ok()
                }
                Some(false) => fail("chmod: Operation not permitted".to_string()),
                None => fail(format!("chmod: cannot access '{}'", path)),
            }
        }
        "chown" => {
            let (owner, path) = (arg(1), arg(2));
            match files.get_mut(&path) {
                Some(f) if is_root => {
                    f.owner = owner.split(':').next().unwrap_or_default().to_string();
                    ok()
                }
                Some(_) => fail("chown: Operation not permitted".to_string()),
                None => fail(format!("chown: cannot access '{}'", path)),
            }
        }
        "rm" => {
            let force = words.iter().any(|w| w == "-f");
            let path = words.last().cloned().unwrap_or_default();
            let in_own_dir = writable_dir(parent_dir(&path), user);
            match owned(files, &path) {
                Some(allowed) if allowed || in_own_dir => {
                    files.remove(&path);
                    ok()
                }
                Some(_) => fail("rm: Permission denied".to_string()),
                None if force => ok(),
                None => fail("rm: No such file".to_string()),
            }
        }
        _ => (String::new(), String::new(), 127),
    }
}

impl MockExecChannel {
    fn finish(&mut self, stdout: &str, stderr: &str, code: u32) {
        if !stdout.is_empty() {
            self.queue
                .push_back(ChannelEvent::Stdout(Bytes::from(stdout.to_string())));
        }
        if !stderr.is_empty() {
            self.queue
                .push_back(ChannelEvent::Stderr(Bytes::from(stderr.to_string())));
        }
        self.queue.push_back(ChannelEvent::ExitStatus(code));
        self.queue.push_back(ChannelEvent::Eof);
        self.queue.push_back(ChannelEvent::Closed);
    }

    fn fs_command(&mut self, user: &str, words: &[String]) {
        let (out, err, code) = {
            let net = self.net.clone();
            let mut state = net.state();
            match state.hosts.get_mut(&self.host) {
                Some(host) => run_fs(&mut host.files, user, words),
                None => (String::new(), "no host".to_string(), 1),
            }
        };
        self.finish(&out, &err, code);
    }

    fn script(&mut self, command: &str) {
        let (user, inner) = unwrap_sudo(command, &self.user);
        let words = shell_words(&inner);
        let Some(program) = words.first().cloned() else {
            return self.finish("", "", 0);
        };

        match program.as_str() {
            "echo" => {
                let text = format!("{}\n", words[1..].join(" "));
                self.finish(&text, "", 0);
            }
            "exit" => {
                let code = words.get(1).and_then(|c| c.parse().ok()).unwrap_or(0);
                self.finish("", "", code);
            }
            "fail" => self.finish("partial output", "something broke", 1),
            "hostname" => {
                let host = self.host.clone();
                self.finish(&format!("{}\n", host), "", 0);
            }
            "whoami" => self.finish(&format!("{}\n", user), "", 0),
            "hang" => self.mode = Mode::Hang,
            "exit-then-hang" => {
                self.queue.push_back(ChannelEvent::ExitStatus(0));
                self.mode = Mode::Hang;
            }
            "ask-password" => {
                self.queue
                    .push_back(ChannelEvent::Stdout(Bytes::from_static(b"Password: ")));
                self.mode = Mode::AwaitInput;
            }
            "sleep" => {
                let ms = words.get(1).and_then(|m| m.parse().ok()).unwrap_or(100);
                self.mode = Mode::Delay(Duration::from_millis(ms));
                self.finish("", "", 0);
            }
            "split-utf8" => {
                let bytes = "héllo wörld\n".as_bytes();
                self.queue
                    .push_back(ChannelEvent::Stdout(Bytes::copy_from_slice(&bytes[..2])));
                self.queue
                    .push_back(ChannelEvent::Stdout(Bytes::copy_from_slice(&bytes[2..9])));
                self.queue
                    .push_back(ChannelEvent::Stdout(Bytes::copy_from_slice(&bytes[9..])));
                self.finish("", "", 0);
            }
            "lines" => {
                for line in ["first\n", "second\n", "third\n"] {
                    self.queue
                        .push_back(ChannelEvent::Stdout(Bytes::from_static(line.as_bytes())));
                }
                self.finish("", "", 0);
            }
            "killed" => {
                self.queue
                    .push_back(ChannelEvent::ExitSignal("KILL".to_string()));
                self.queue.push_back(ChannelEvent::Closed);
            }
            "ls" | "mv" | "cp" | "chmod" | "chown" | "rm" => self.fs_command(&user, &words),
            other => self.finish("", &format!("bash: {}: command not found", other), 127),
        }
    }
}

#[async_trait]
impl ExecChannel for MockExecChannel {
    async fn request_pty(&mut self) -> Result<()> {
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<()> {
        self.net.state().commands.push(command.to_string());
        if self.dropped {
            self.queue.push_back(ChannelEvent::Closed);
            return Ok(());
        }
        self.script(command);
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        if let Mode::Delay(delay) = self.mode {
            self.mode = Mode::Scripted;
            tokio::time::sleep(delay).await;
        }
        if let Some(event) = self.queue.pop_front() {
            return Some(event);
        }
        match self.mode {
            Mode::Hang | Mode::AwaitInput => std::future::pending().await,
            _ => None,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if matches!(self.mode, Mode::AwaitInput) {
            self.mode = Mode::Scripted;
            if data == b"secret\n" {
                self.finish("accepted\n", "", 0);
            } else {
                self.finish("denied\n", "", 1);
            }
        }
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.net.counters.interrupts.fetch_add(1, Ordering::SeqCst);
        if matches!(self.mode, Mode::Hang) {
            self.mode = Mode::Scripted;
            self.queue.clear();
            self.queue.push_back(ChannelEvent::Stderr(Bytes::from_static(b"^C")));
            self.queue.push_back(ChannelEvent::ExitStatus(130));
            self.queue.push_back(ChannelEvent::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MockFileChannel {
    net: MockTransport,
    host: String,
    user: String,
    label: String,
}

impl MockFileChannel {
    fn err(&self, path: &str, reason: &str) -> JumpSshError {
        JumpSshError::Transfer {
            host: self.label.clone(),
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl FileChannel for MockFileChannel {
    async fn open_read(&self, path: &str) -> Result<RemoteReader> {
        let file = self
            .net
            .state()
            .hosts
            .get(&self.host)
            .and_then(|h| h.files.get(path).cloned());
        match file {
            Some(f) if readable(&f, &self.user) => Ok(Box::new(Cursor::new(f.data))),
            Some(_) => Err(self.err(path, "权限不足")),
            None => Err(self.err(path, "文件不存在")),
        }
    }

    async fn open_write(&self, path: &str) -> Result<RemoteWriter> {
        let existing = self.net.file(&self.host, path);
        let allowed = match &existing {
            Some(f) => f.owner == self.user,
            None => writable_dir(parent_dir(path), &self.user),
        };
        if !allowed {
            return Err(self.err(path, "权限不足"));
        }
        Ok(Box::new(MockWriter {
            net: self.net.clone(),
            host: self.host.clone(),
            path: path.to_string(),
            owner: self.user.clone(),
            mode: existing.map(|f| f.mode).unwrap_or(0o644),
            buffer: Vec::new(),
        }))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        if matches!(path, "/" | "/tmp") || path == format!("/home/{}", self.user) {
            return Ok(true);
        }
        let state = self.net.state();
        let prefix = format!("{}/", path);
        Ok(state
            .hosts
            .get(&self.host)
            .map(|h| h.files.contains_key(path) || h.files.keys().any(|k| k.starts_with(&prefix)))
            .unwrap_or(false))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        let mut state = self.net.state();
        let file = state
            .hosts
            .get_mut(&self.host)
            .and_then(|h| h.files.get_mut(path));
        match file {
            Some(f) if f.owner == self.user => {
                f.mode = mode;
                Ok(())
            }
            Some(_) => Err(self.err(path, "权限不足")),
            None => Err(self.err(path, "文件不存在")),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.net.state();
        match state.hosts.get_mut(&self.host).and_then(|h| h.files.remove(path)) {
            Some(_) => Ok(()),
            None => Err(self.err(path, "文件不存在")),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockWriter {
    net: MockTransport,
    host: String,
    path: String,
    owner: String,
    mode: u32,
    buffer: Vec<u8>,
}

impl MockWriter {
    fn commit(&self) {
        let mut state = self.net.state();
        if let Some(h) = state.hosts.get_mut(&self.host) {
            h.files.insert(
                self.path.clone(),
                MockFile {
                    data: self.buffer.clone(),
                    owner: self.owner.clone(),
                    mode: self.mode,
                },
            );
        }
    }
}

impl AsyncWrite for MockWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.commit();
        Poll::Ready(Ok(()))
    }
}

/// Collects formatted `tracing` output for log assertions.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// gateway (直连) -> remotehost (内网) -> remotehost2 (内网)
pub fn lab() -> MockTransport {
    MockTransport::new()
        .host("gateway", &[("user1", "password1"), ("user2", "password2")])
        .internal_host("remotehost", &[("user1", "password1"), ("user2", "password2")])
        .internal_host("remotehost2", &[("user1", "password1")])
        .echo_service("echo", 7)
        .http_service("restserver", 5000)
        .http_service("10.0.0.5", 8080)
        .capture_service("secure.internal", 8443)
}
