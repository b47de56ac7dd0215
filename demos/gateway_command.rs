use jump_ssh::{setup_logging, RemoteTarget, RestSshClient, RequestOptions, RunOptions, Session, SessionConfig, Silent};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，使用DEBUG级别
    setup_logging(Level::DEBUG, "JUMP_SSH");

    let gateway = Session::new(SessionConfig::new("gateway.example.com", "my_user").password("my_password"));
    gateway.open_default().await?;

    // 只能从跳板机访问的主机
    let remote = gateway
        .get_remote_session(RemoteTarget::new("remote.example.com").password("other_password"))
        .await?;

    let hostname = remote.get_cmd_output("hostname", RunOptions::default()).await?;
    info!(host = %remote, "远程主机名: {}", hostname);

    // 命令中的令牌不会出现在日志里
    let silent = Silent::patterns(["token=\\S+"])?;
    let result = remote
        .run_cmd(
            "curl -s -H token=abc123 http://localhost:8080/health",
            RunOptions::default().silent(silent).no_raise(),
        )
        .await?;
    info!(exit_code = result.exit_code, "健康检查结束");

    // 远程主机上的 HTTP 服务
    let client = RestSshClient::new(remote.clone());
    let response = client.get("http://localhost:5000/", RequestOptions::default()).await?;
    info!(status = response.status_code(), "{}", response.text());

    gateway.close().await;
    Ok(())
}
