mod config;
mod directory;
mod encoder;
mod pacing;
mod placeholder;
mod reaper;
mod registry;
mod session;
mod sink;
mod source;
mod state;
#[cfg(test)]
mod testing;
mod web;

use clap::Parser;
use config::AppConfig;
use directory::FileDirectory;
use registry::SessionRegistry;
use source::HttpFrameSourceFactory;
use state::AppState;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ScoreStream - on-demand HLS channels rendered from live pages
/// 解析命令行参数，加载配置文件，启动HTTP服务及后台空闲回收
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "scorestream.yaml")]
    config: String,

    /// 覆盖配置文件中的监听地址
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统, 默认 info, 可用 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 加载配置文件, 命令行参数优先
    let mut config = AppConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);
    info!(
        "ScoreStream initialized. HLS Root: {:?}, directory: {:?}",
        config.server.hls_root, config.directory.path
    );

    let registry = SessionRegistry::new(
        config.clone(),
        Arc::new(FileDirectory::new(config.directory.path.clone())),
        Arc::new(HttpFrameSourceFactory::new(config.source.clone())),
    );
    let state = Arc::new(AppState {
        config: config.clone(),
        registry: registry.clone(),
        started_at: Instant::now(),
    });

    // 启动后台空闲回收
    tokio::spawn(reaper::start_reaper(
        registry.clone(),
        config.session.reaper_interval(),
        config.session.idle_timeout(),
    ));

    let app = web::router(state);

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前释放所有会话 (编码进程, 渲染源, 帧文件)
    info!("Shutting down, stopping {} session(s)", registry.list().len());
    registry.shutdown().await;

    Ok(())
}

/// Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to setup SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
