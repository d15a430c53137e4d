pub mod handlers;

use crate::config::Config;
use crate::relay::Relay;
use crate::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// 关闭时等待现有连接的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// accept 失败后的退避时间，避免文件描述符耗尽时空转
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 所有连接共享的只读状态
pub struct AppState {
    pub relay: Relay,
    pub route: String,
    pub cors: bool,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(relay: Relay, config: &Config) -> Self {
        Self {
            relay,
            route: config.route.clone(),
            cors: config.cors,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// 使用 Gemini provider 构建状态
    pub fn from_config(config: &Config, credential: Option<String>) -> Self {
        Self::new(Relay::from_config(config, credential), config)
    }
}

/// 启动 HTTP 服务器（带优雅关闭）
pub async fn start_server(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        "PromptRelay 服务器运行在 http://{}{}",
        listener.local_addr()?,
        state.route
    );
    serve(listener, state, shutdown_signal()).await
}

/// 在给定监听器上提供服务，直到 `shutdown` 完成
pub async fn serve<S>(listener: TcpListener, state: Arc<AppState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                let service = service_fn(move |req| {
                    handlers::handle_request(req, Arc::clone(&state))
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(%peer, "服务连接错误: {}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("收到关闭信号，停止接受新连接");
                break;
            }
        }
    }

    info!("等待现有连接处理完成...");
    tokio::select! {
        _ = graceful.shutdown() => info!("服务器已优雅关闭"),
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("等待超过 {}s，强制关闭剩余连接", SHUTDOWN_GRACE.as_secs());
        }
    }

    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("设置 Ctrl+C 信号处理失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("设置 SIGTERM 信号处理失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("收到 Ctrl+C 信号，开始优雅关闭..."),
        _ = terminate => warn!("收到 SIGTERM 信号，开始优雅关闭..."),
    }
}
