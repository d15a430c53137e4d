use anyhow::Context;
use clap::Parser;
use promptrelay::config::{Config, Transport};
use promptrelay::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "promptrelay")]
#[command(about = "把提示词转发给 Gemini 的轻量中继服务", long_about = None)]
struct Args {
    /// 配置文件路径，不指定时使用默认配置
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// 覆盖配置中的传输方式
    #[arg(short, long, value_enum)]
    transport: Option<Transport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 加载配置
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("加载配置文件失败: {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(transport) = args.transport {
        config.transport = transport;
    }

    // 缺少凭据不阻止启动，每个请求都会返回 500
    let credential = config.provider.resolve_credential();
    if credential.is_none() {
        warn!(
            "环境变量 {} 未设置，所有中继请求都将返回配置错误",
            config.provider.api_key_env
        );
    }
    info!(
        transport = ?config.transport,
        model = %config.provider.model,
        "中继配置已加载"
    );

    let state = Arc::new(AppState::from_config(&config, credential));
    server::start_server(state, args.bind)
        .await
        .context("服务器运行失败")?;

    Ok(())
}
