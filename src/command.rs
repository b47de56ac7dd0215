//! 远程命令执行
//!
//! Each attempt opens its own exec channel on the session's shared
//! connection, so independent commands can run concurrently on one session.
//! Attempt lifecycle: `Pending -> Running -> {Completed, Interrupted,
//! TransportFailed}`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RetryLimit;
use crate::error::{JumpSshError, Result};
use crate::session::Session;
use crate::transport::{ChannelEvent, ExecChannel, TransportConnection};
use crate::utils::escape_double_quoted;

/// 日志中替换敏感内容的文本
pub const REDACTED: &str = "XXXXXXX";

/// Exit codes treated as success. Defaults to `{0}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessCodes(Vec<i32>);

impl SuccessCodes {
    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }

    pub fn codes(&self) -> &[i32] {
        &self.0
    }
}

impl Default for SuccessCodes {
    fn default() -> Self {
        SuccessCodes(vec![0])
    }
}

impl From<i32> for SuccessCodes {
    fn from(code: i32) -> Self {
        SuccessCodes(vec![code])
    }
}

impl From<Vec<i32>> for SuccessCodes {
    fn from(mut codes: Vec<i32>) -> Self {
        codes.sort_unstable();
        codes.dedup();
        SuccessCodes(codes)
    }
}

impl From<&[i32]> for SuccessCodes {
    fn from(codes: &[i32]) -> Self {
        SuccessCodes::from(codes.to_vec())
    }
}

impl<const N: usize> From<[i32; N]> for SuccessCodes {
    fn from(codes: [i32; N]) -> Self {
        SuccessCodes::from(codes.to_vec())
    }
}

impl fmt::Display for SuccessCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", joined.join(","))
    }
}

/// What the log may see of a command.
#[derive(Debug, Clone, Default)]
pub enum Silent {
    #[default]
    Off,
    /// 完全不记录命令及其输出
    All,
    /// Every match of every pattern is replaced with `XXXXXXX` before logging.
    Patterns(Vec<Regex>),
}

impl Silent {
    pub fn patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| JumpSshError::InvalidInput(format!("silent 正则无效 '{}': {}", p.as_ref(), e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Silent::Patterns(compiled))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Silent::All)
    }

    /// Log-safe version of `command`.
    pub fn redact(&self, command: &str) -> String {
        match self {
            Silent::Off => command.to_string(),
            Silent::All => REDACTED.to_string(),
            Silent::Patterns(patterns) => patterns.iter().fold(command.to_string(), |text, re| {
                re.replace_all(&text, REDACTED).into_owned()
            }),
        }
    }
}

/// Where incrementally decoded output goes while the command runs.
#[derive(Clone)]
pub enum OutputSink {
    /// 逐行写入日志
    Log,
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
    Channel(UnboundedSender<String>),
}

impl OutputSink {
    pub fn callback(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        OutputSink::Callback(Arc::new(f))
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Log => write!(f, "Log"),
            OutputSink::Callback(_) => write!(f, "Callback"),
            OutputSink::Channel(_) => write!(f, "Channel"),
        }
    }
}

/// Per-call execution settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 以其他用户身份执行 (需要 sudo 权限)
    pub user: Option<String>,
    pub silent: Silent,
    pub success_exit_codes: SuccessCodes,
    pub raise_if_error: bool,
    pub retry: RetryLimit,
    pub retry_interval: Duration,
    pub continuous_output: bool,
    pub stdout_sink: Option<OutputSink>,
    pub stderr_sink: Option<OutputSink>,
    pub cancel: Option<CancellationToken>,
    /// 转发中断后等待远程进程退出的时间
    pub interrupt_grace: Duration,
    pub request_pty: bool,
    /// Prompt pattern and the reply line written to stdin when output matches.
    pub input_data: Vec<(Regex, String)>,
    pub keep_retry_history: bool,
    pub encoding: &'static Encoding,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            user: None,
            silent: Silent::Off,
            success_exit_codes: SuccessCodes::default(),
            raise_if_error: true,
            retry: RetryLimit::Count(0),
            retry_interval: Duration::from_secs(2),
            continuous_output: false,
            stdout_sink: None,
            stderr_sink: None,
            cancel: None,
            interrupt_grace: Duration::from_secs(2),
            request_pty: false,
            input_data: Vec::new(),
            keep_retry_history: false,
            encoding: UTF_8,
        }
    }
}

impl RunOptions {
    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn silent(mut self, silent: Silent) -> Self {
        self.silent = silent;
        self
    }

    pub fn success_exit_codes(mut self, codes: impl Into<SuccessCodes>) -> Self {
        self.success_exit_codes = codes.into();
        self
    }

    pub fn no_raise(mut self) -> Self {
        self.raise_if_error = false;
        self
    }

    pub fn retry(mut self, retry: impl Into<RetryLimit>, interval: Duration) -> Self {
        self.retry = retry.into();
        self.retry_interval = interval;
        self
    }

    pub fn continuous_output(mut self) -> Self {
        self.continuous_output = true;
        self
    }

    pub fn stdout_sink(mut self, sink: OutputSink) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn stderr_sink(mut self, sink: OutputSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_pty(mut self) -> Self {
        self.request_pty = true;
        self
    }

    pub fn respond(mut self, prompt: Regex, reply: impl Into<String>) -> Self {
        self.input_data.push((prompt, reply.into()));
        self
    }

    pub fn keep_retry_history(mut self) -> Self {
        self.keep_retry_history = true;
        self
    }

    fn sink_for(&self, explicit: &Option<OutputSink>) -> Option<OutputSink> {
        match explicit {
            Some(sink) => Some(sink.clone()),
            None if self.continuous_output && !self.silent.is_all() => Some(OutputSink::Log),
            None => None,
        }
    }
}

/// 单次执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub exit_code: i32,
    pub output: String,
    pub error: String,
}

/// Outcome of `run_cmd`. Describes the last attempt.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// 会话标识 `user@host:port`
    pub host: String,
    /// 已脱敏的命令文本
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    pub success: bool,
    pub success_exit_codes: SuccessCodes,
    pub runs: u32,
    pub history: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl CommandResult {
    /// stderr if there is any, otherwise stdout.
    pub fn error_text(&self) -> &str {
        if self.error.is_empty() {
            &self.output
        } else {
            &self.error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Interrupted,
    TransportFailed,
}

/// Wraps `command` so that it runs through a login shell of `user`.
///
/// sudo does not start a shell on its own, which breaks shell builtins such
/// as `source`.
pub fn wrap_for_user(command: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("sudo su - {} -c \"{}\"", user, escape_double_quoted(command)),
        None => command.to_string(),
    }
}

// 流式解码，未完成的多字节序列留到下一块
struct OutputCollector {
    decoder: Decoder,
    text: String,
    sink: Option<OutputSink>,
    pending_line: String,
    stream: &'static str,
    host: String,
}

impl OutputCollector {
    fn new(encoding: &'static Encoding, sink: Option<OutputSink>, stream: &'static str, host: &str) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
            text: String::new(),
            sink,
            pending_line: String::new(),
            stream,
            host: host.to_string(),
        }
    }

    fn decode(&mut self, mut src: &[u8], last: bool) -> String {
        let mut chunk = String::new();
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(src.len())
                .unwrap_or(src.len() * 3 + 4);
            chunk.reserve(needed);
            let (result, read, _had_errors) = self.decoder.decode_to_string(src, &mut chunk, last);
            src = &src[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => continue,
            }
        }
        chunk
    }

    fn push(&mut self, data: &[u8]) -> String {
        let chunk = self.decode(data, false);
        self.emit(&chunk);
        self.text.push_str(&chunk);
        chunk
    }

    fn finish(&mut self) {
        let tail = self.decode(&[], true);
        self.emit(&tail);
        self.text.push_str(&tail);
        if matches!(self.sink, Some(OutputSink::Log)) && !self.pending_line.is_empty() {
            let line = std::mem::take(&mut self.pending_line);
            info!(host = %self.host, stream = self.stream, "{}", line.trim_end_matches('\r'));
        }
    }

    fn emit(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match &self.sink {
            None => {}
            Some(OutputSink::Log) => {
                self.pending_line.push_str(chunk);
                while let Some(pos) = self.pending_line.find('\n') {
                    let line: String = self.pending_line.drain(..=pos).collect();
                    info!(host = %self.host, stream = self.stream, "{}", line.trim_end_matches(['\n', '\r']));
                }
            }
            Some(OutputSink::Callback(f)) => f(chunk),
            Some(OutputSink::Channel(tx)) => {
                // 接收端已关闭时丢弃
                let _ = tx.send(chunk.to_string());
            }
        }
    }

    fn into_text(self) -> String {
        self.text.trim().to_string()
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

struct Attempt<'a> {
    host: &'a str,
    to_send: &'a str,
    redacted: &'a str,
    options: &'a RunOptions,
}

impl Attempt<'_> {
    async fn execute(&self, connection: &dyn TransportConnection) -> Result<AttemptRecord> {
        let opts = self.options;
        let mut state = ExecutionState::Pending;
        trace!(?state, "准备执行 '{}'", self.redacted);

        let mut channel = connection.open_exec().await?;
        if opts.request_pty {
            channel.request_pty().await?;
        }
        channel.exec(self.to_send).await?;
        state = ExecutionState::Running;
        trace!(?state, "命令已发送");

        let mut stdout = OutputCollector::new(opts.encoding, opts.sink_for(&opts.stdout_sink), "stdout", self.host);
        let mut stderr = OutputCollector::new(opts.encoding, opts.sink_for(&opts.stderr_sink), "stderr", self.host);
        let mut exit_code: Option<i32> = None;

        let cancel = cancelled(opts.cancel.clone());
        tokio::pin!(cancel);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    state = ExecutionState::Interrupted;
                    trace!(?state, "收到中断信号");
                    return Err(self.interrupt(&mut channel, exit_code).await);
                }
                event = channel.wait() => match event {
                    Some(ChannelEvent::Stdout(data)) => {
                        let chunk = stdout.push(&data);
                        self.answer_prompts(&mut channel, &chunk).await;
                    }
                    Some(ChannelEvent::Stderr(data)) => {
                        let chunk = stderr.push(&data);
                        self.answer_prompts(&mut channel, &chunk).await;
                    }
                    // 退出码可能先于数据到达，继续读取直到通道关闭
                    Some(ChannelEvent::ExitStatus(code)) => exit_code = Some(code as i32),
                    Some(ChannelEvent::ExitSignal(signal)) => {
                        debug!("远程命令被信号 {} 终止", signal);
                        exit_code.get_or_insert(-1);
                    }
                    Some(ChannelEvent::Eof) => {}
                    Some(ChannelEvent::Closed) | None => break,
                }
            }
        }

        stdout.finish();
        stderr.finish();

        match exit_code {
            Some(exit_code) => {
                state = ExecutionState::Completed;
                trace!(?state, exit_code, "命令结束");
                Ok(AttemptRecord {
                    exit_code,
                    output: stdout.into_text(),
                    error: stderr.into_text(),
                })
            }
            None => {
                state = ExecutionState::TransportFailed;
                trace!(?state, "通道关闭但没有退出码");
                Err(JumpSshError::Transport {
                    host: self.host.to_string(),
                    reason: format!("执行 '{}' 时通道在返回退出码前关闭", self.redacted),
                })
            }
        }
    }

    async fn answer_prompts(&self, channel: &mut Box<dyn ExecChannel>, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        for (prompt, reply) in &self.options.input_data {
            if prompt.is_match(chunk) {
                let line = format!("{}\n", reply);
                if let Err(e) = channel.send(line.as_bytes()).await {
                    warn!("向 '{}' 发送输入失败: {}", self.host, e);
                }
            }
        }
    }

    async fn interrupt(&self, channel: &mut Box<dyn ExecChannel>, exit_code: Option<i32>) -> JumpSshError {
        match exit_code {
            Some(code) => info!("远程命令已结束，退出码 {}", code),
            None => match channel.interrupt().await {
                Ok(()) => {
                    info!("已向 '{}' 转发中断: '{}'", self.host, self.redacted);
                    let drain = async {
                        while let Some(event) = channel.wait().await {
                            if event == ChannelEvent::Closed {
                                break;
                            }
                        }
                    };
                    if tokio::time::timeout(self.options.interrupt_grace, drain).await.is_err() {
                        debug!("远程命令在 {:?} 内未退出", self.options.interrupt_grace);
                    }
                }
                Err(e) => warn!("无法终止远程命令，通道已关闭: {}", e),
            },
        }
        let _ = channel.close().await;
        JumpSshError::Interrupted {
            host: self.host.to_string(),
            command: self.redacted.to_string(),
        }
    }
}

async fn pause(interval: Duration, cancel: &Option<CancellationToken>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = cancelled(cancel.clone()) => false,
    }
}

/// Runs `command` on `session`, retrying per `options.retry`.
pub(crate) async fn run(session: &Session, command: &str, options: RunOptions) -> Result<CommandResult> {
    if command.trim().is_empty() {
        return Err(JumpSshError::InvalidInput("命令为空".to_string()));
    }

    let host = session.identity();
    let to_send = wrap_for_user(command, options.user.as_deref());
    let redacted = options.silent.redact(command);
    let run_as = options.user.clone().unwrap_or_else(|| session.user().to_string());
    if !options.silent.is_all() {
        debug!("在 '{}' 上以 {} 身份执行命令 '{}'...", host, run_as, redacted);
    }

    let attempt = Attempt {
        host: &host,
        to_send: &to_send,
        redacted: &redacted,
        options: &options,
    };

    let started = Instant::now();
    let mut history = Vec::new();
    let mut runs = 0u32;

    loop {
        runs += 1;
        let outcome = match session.connection().await {
            Ok(connection) => attempt.execute(connection.as_ref()).await,
            Err(e) => Err(e),
        };

        let retry_left = options.retry.allows_another(runs);
        match outcome {
            Ok(record) => {
                let success = options.success_exit_codes.contains(record.exit_code);
                if options.keep_retry_history {
                    history.push(record.clone());
                }
                if !success && retry_left {
                    warn!(
                        attempt = runs,
                        "'{}' 上的命令 '{}' 返回 {}，{:?} 后重试",
                        host, redacted, record.exit_code, options.retry_interval
                    );
                    if pause(options.retry_interval, &options.cancel).await {
                        continue;
                    }
                    return Err(JumpSshError::Interrupted { host, command: redacted });
                }

                let result = CommandResult {
                    host: host.clone(),
                    command: redacted.clone(),
                    exit_code: record.exit_code,
                    output: record.output,
                    error: record.error,
                    success,
                    success_exit_codes: options.success_exit_codes.clone(),
                    runs,
                    history,
                    elapsed: started.elapsed(),
                };
                if !success && options.raise_if_error {
                    return Err(JumpSshError::CommandFailed(Box::new(result)));
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && retry_left => {
                warn!(attempt = runs, "'{}' 上执行 '{}' 失败: {}，{:?} 后重试", host, redacted, e, options.retry_interval);
                if !pause(options.retry_interval, &options.cancel).await {
                    return Err(JumpSshError::Interrupted { host, command: redacted });
                }
            }
            Err(e) => return Err(e),
        }
    }
}
