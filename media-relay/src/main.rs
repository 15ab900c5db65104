mod registry;
mod server;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "media-relay", version, about = "Receives avatar streams and checks continuity")]
struct Args {
    /// 监听地址
    #[arg(short, long, default_value = "127.0.0.1:7443")]
    listen: String,

    /// 统计输出间隔（秒）
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    info!("📡 Media relay starting...");

    let registry = registry::SessionRegistry::new();
    let server = server::RelayServer::bind(&args.listen, registry.clone()).await?;
    info!("✓ Listening on {}", server.local_addr()?);

    // 周期性输出活动会话统计
    let stats_registry = registry.clone();
    let interval = Duration::from_secs(args.stats_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for stats in stats_registry.active() {
                match serde_json::to_string(&stats) {
                    Ok(json) => info!("📊 Session stats: {}", json),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            }
        }
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
    }

    for stats in registry.all() {
        info!(
            "Session {}: {} audio / {} video samples, {} gaps, completed={}",
            stats.session_id,
            stats.audio.samples,
            stats.video.samples,
            stats.audio.gaps + stats.video.gaps,
            stats.completed
        );
    }
    Ok(())
}
