use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use jump_ssh::{
    e, setup_logging, try_log, Credentials, HopSpec, JumpSshError, OpenOptions, OutputSink, RemoteTarget,
    RunOptions, Session, SessionConfig, Silent, TransferOptions,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "通过一个或多个 SSH 跳板机在远程主机上执行命令和传输文件", long_about = None)]
struct Args {
    /// 跳板机 user@host[:port]，可多次指定，按顺序连接
    #[clap(short = 'J', long = "jump")]
    jumps: Vec<HopSpec>,

    /// 目标主机 user@host[:port]
    #[clap(short = 'T', long)]
    target: HopSpec,

    /// 所有主机使用的密码
    #[clap(short = 'p', long)]
    password: Option<String>,

    /// 所有主机使用的私钥
    #[clap(short = 'k', long)]
    key: Option<PathBuf>,

    /// 连接和命令失败后的重试次数
    #[clap(short = 'r', long, default_value = "0")]
    retry: u32,

    /// 连接超时 (秒)
    #[clap(long, default_value = "30")]
    timeout: u64,

    /// 输出调试日志
    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// 执行远程命令
    Run {
        /// 以其他用户身份执行 (sudo su - USER)
        #[clap(short = 'u', long)]
        as_user: Option<String>,

        /// 日志中需要隐藏的正则
        #[clap(short = 's', long)]
        silent: Vec<String>,

        #[clap(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// 上传文件
    Put {
        local: PathBuf,
        remote: String,
        #[clap(long)]
        sudo: bool,
    },
    /// 下载文件
    Get {
        remote: String,
        local: PathBuf,
        #[clap(long)]
        sudo: bool,
    },
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

fn credentials(args: &Args) -> Credentials {
    Credentials {
        password: args.password.clone(),
        private_key: args.key.clone(),
        passphrase: None,
    }
}

/// Opens every hop in order and returns (first hop, target).
async fn connect_chain(args: &Args) -> jump_ssh::Result<(Session, Session)> {
    let open = OpenOptions::default()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_retry(args.retry, Duration::from_secs(10));

    let mut hops = args.jumps.iter().chain(std::iter::once(&args.target));
    let first = hops
        .next()
        .ok_or_else(|| JumpSshError::InvalidInput("没有指定主机".to_string()))?;
    let root = Session::new(
        SessionConfig::new(&first.host, first.user.clone().unwrap_or_else(default_user))
            .port(first.port)
            .credentials(credentials(args))
            .open_options(open.clone()),
    );
    root.open_default().await?;

    let mut current = root.clone();
    for hop in hops {
        let mut target = RemoteTarget::new(&hop.host)
            .port(hop.port)
            .open_options(open.clone());
        target.user = hop.user.clone();
        target.credentials = credentials(args);
        current = current.get_remote_session(target).await?;
        current.open_default().await?;
    }
    info!("已连接: {}", current);
    Ok((root, current))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(if args.verbose { Level::DEBUG } else { Level::INFO }, "JUMP_SSH");

    let (root, target) = e!(connect_chain(&args).await, "无法建立跳板链")?;

    let outcome = run_action(&args, &target).await;
    // 出错时同样关闭整条跳板链
    root.close().await;
    let exit_code = outcome?;
    std::process::exit(exit_code);
}

async fn run_action(args: &Args, target: &Session) -> Result<i32> {
    let exit_code = match &args.action {
        Action::Run { as_user, silent, command } => {
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });

            let mut options = RunOptions::default()
                .no_raise()
                .retry(args.retry, Duration::from_secs(2))
                .cancel_on(cancel)
                .stdout_sink(OutputSink::callback(|chunk| {
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                }))
                .stderr_sink(OutputSink::callback(|chunk| eprint!("{}", chunk)));
            if let Some(user) = as_user {
                options = options.as_user(user.clone());
            }
            if !silent.is_empty() {
                options = options.silent(try_log!(Silent::patterns(silent), "silent 参数无效")?);
            }

            match target.run_cmd(&command.join(" "), options).await {
                Ok(result) => result.exit_code,
                Err(JumpSshError::Interrupted { .. }) => {
                    println!("\n命令已中断");
                    130
                }
                Err(err) => return Err(anyhow::anyhow!("命令执行失败: {}", err)),
            }
        }
        Action::Put { local, remote, sudo } => {
            let options = if *sudo { TransferOptions::default().sudo() } else { TransferOptions::default() };
            try_log!(target.put(local, remote, options).await, "上传失败")?;
            println!("已上传 {} -> {}:{}", local.display(), target.host(), remote);
            0
        }
        Action::Get { remote, local, sudo } => {
            let options = if *sudo { TransferOptions::default().sudo() } else { TransferOptions::default() };
            let written = try_log!(target.get(remote, local, options).await, "下载失败")?;
            println!("已下载 {}:{} -> {}", target.host(), remote, written.display());
            0
        }
    };
    Ok(exit_code)
}
