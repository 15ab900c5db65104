use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use avatar_streamer::audio_source::TextInput;
use avatar_streamer::clip::ClipLibrary;
use avatar_streamer::controller::CancelHandle;
use avatar_streamer::sink::TcpMediaSink;
use avatar_streamer::synthetic::{MouthRenderer, ToneSynthesizer};
use avatar_streamer::{
    Collaborators, ConfigManager, EnvConfigOverride, PipelineConfig, PipelineController,
    PipelineError, PipelineSession,
};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "avatar-streamer", version, about = "Real-time talking avatar streamer")]
struct Args {
    /// 配置文件路径，不存在时写出默认配置
    #[arg(short, long, default_value = "avatar-streamer.toml")]
    config: PathBuf,

    /// 逐行读取播报文本的文件，缺省为标准输入
    #[arg(short, long)]
    text_file: Option<PathBuf>,

    /// 覆盖媒体服务器地址
    #[arg(long)]
    sink: Option<String>,

    /// 覆盖日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 只写出默认配置然后退出
    #[arg(long)]
    write_default_config: bool,
}

async fn load_config(args: &Args) -> Result<PipelineConfig, PipelineError> {
    let mut manager = ConfigManager::new(args.config.clone());
    if args.write_default_config {
        manager.save().await?;
        return Ok(manager.into_config());
    }
    manager.load().await?;

    let mut config = manager.into_config();
    EnvConfigOverride::apply_overrides(&mut config);
    if let Some(address) = &args.sink {
        config.output.address = address.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

/// 逐行提交文本，读到结尾后请求优雅结束
///
/// 以 `@` 开头的行按名称插播预录片段。
async fn feed_lines<R>(
    reader: R,
    input: TextInput,
    clips: ClipLibrary,
    session: Arc<PipelineSession>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let submitted = match line.strip_prefix('@') {
                    Some(name) => match clips.get(name.trim()) {
                        Some(clip) => input.submit_clip(clip).await,
                        None => {
                            warn!("Unknown clip '{}', available: {:?}", name.trim(), clips.names());
                            continue;
                        }
                    },
                    None => input.submit(line).await,
                };
                if let Err(e) = submitted {
                    warn!("Text not accepted: {}", e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read text input: {}", e);
                break;
            }
        }
    }
    info!("Text input finished");
    session.begin_shutdown();
}

async fn wait_for_ctrl_c(canceller: CancelHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Ctrl+C received");
            canceller.cancel();
        }
        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("avatar-streamer: {}", e);
            std::process::exit(1);
        }
    };
    if args.write_default_config {
        println!("Default configuration written to {}", args.config.display());
        return Ok(());
    }

    // 初始化日志 - RUST_LOG 优先，其次使用配置中的级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("🎭 Avatar streamer starting...");
    info!("  Config: {}", args.config.display());
    info!("  Media server: {}", config.output.address);

    let text_file = match &args.text_file {
        Some(path) => Some(tokio::fs::File::open(path).await?),
        None => None,
    };

    let session = Arc::new(PipelineSession::new());
    let collaborators = Collaborators {
        tts: Arc::new(ToneSynthesizer::new(config.media.sample_rate)),
        renderer: Arc::new(MouthRenderer::new()),
        sink: Box::new(TcpMediaSink::new(&config, &session)),
    };
    let controller = PipelineController::start_with_session(config, session.clone(), collaborators)?;

    let input = controller.input();
    let clips = controller.clip_library().clone();
    let feeder = match text_file {
        Some(file) => tokio::spawn(feed_lines(
            BufReader::new(file),
            input,
            clips,
            session.clone(),
        )),
        None => tokio::spawn(feed_lines(
            BufReader::new(tokio::io::stdin()),
            input,
            clips,
            session.clone(),
        )),
    };
    let ctrl_c = tokio::spawn(wait_for_ctrl_c(controller.cancel_handle()));

    info!("✅ Avatar streamer ready!");
    info!("   Press Ctrl+C to stop");

    let outcome = controller.wait().await;
    feeder.abort();
    ctrl_c.abort();

    info!("Exiting with {:?}", outcome);
    std::process::exit(outcome.exit_code());
}
