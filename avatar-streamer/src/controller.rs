// 管线控制器
//
// 负责创建会话、以有界队列连接四个阶段、启动任务并监督其退出。
// 启动时加载待机片段与插播片段库，插播片段与文本共用输入队列。
// 上游致命错误时停止接收输入并让在途数据经同步器排空；投递致命错误时
// 无法再输出任何内容，直接按生产顺序取消所有阶段。

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio_source::{AudioSource, TextInput};
use crate::clip::{self, ClipLibrary, FrameCycle, MediaClip};
use crate::collaborator::{FrameSynthesizer, MediaSink, SpeechSynthesizer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::frame_renderer::FrameRenderer;
use crate::output_pusher::OutputPusher;
use crate::session::{PipelineSession, PipelineSignal, StageHealth};
use crate::synchronizer::Synchronizer;

/// 跳帧请求队列容量
const SKIP_QUEUE_CAPACITY: usize = 4;

/// 外部协作方
pub struct Collaborators {
    pub tts: Arc<dyn SpeechSynthesizer>,
    pub renderer: Arc<dyn FrameSynthesizer>,
    pub sink: Box<dyn MediaSink>,
}

/// 会话结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// 输入结束且全部样本已投递
    Completed,
    /// 操作员停止
    Cancelled,
    DeliveryFailed { reason: String },
    /// TTS/渲染持续失败或时间轴不变量被破坏
    UpstreamFailed { stage: Stage, reason: String },
}

impl PipelineOutcome {
    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed | PipelineOutcome::Cancelled => 0,
            PipelineOutcome::DeliveryFailed { .. } => 2,
            PipelineOutcome::UpstreamFailed { .. } => 3,
        }
    }
}

/// 各阶段的取消令牌，均为会话根令牌的子令牌
#[derive(Clone)]
struct StageTokens {
    tokens: [CancellationToken; 4],
}

impl StageTokens {
    fn new(root: &CancellationToken) -> Self {
        Self {
            tokens: std::array::from_fn(|_| root.child_token()),
        }
    }

    fn get(&self, stage: Stage) -> CancellationToken {
        self.tokens[stage.index()].clone()
    }

    /// 按生产顺序取消，先停源头再停出口
    fn cancel_in_order(&self) {
        for stage in Stage::PRODUCTION_ORDER {
            debug!("Cancelling {}", stage);
            self.tokens[stage.index()].cancel();
        }
    }
}

/// 可在其他任务中触发操作员停止的句柄
#[derive(Clone)]
pub struct CancelHandle {
    session: Arc<PipelineSession>,
    tokens: StageTokens,
}

impl CancelHandle {
    /// 按生产顺序取消所有阶段
    pub fn cancel(&self) {
        info!("🛑 Pipeline cancel requested");
        self.session.begin_shutdown();
        self.tokens.cancel_in_order();
        self.session.cancel_token().cancel();
    }
}

pub struct PipelineController {
    session: Arc<PipelineSession>,
    input: TextInput,
    clips: ClipLibrary,
    resolution: common::Resolution,
    canceller: CancelHandle,
    supervisor: JoinHandle<PipelineOutcome>,
    reporter: JoinHandle<()>,
}

impl PipelineController {
    /// 校验配置并在新会话上启动全部阶段
    pub fn start(
        config: PipelineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        Self::start_with_session(config, Arc::new(PipelineSession::new()), collaborators)
    }

    /// 在已创建的会话上启动，便于协作方预先绑定会话标识
    pub fn start_with_session(
        config: PipelineConfig,
        session: Arc<PipelineSession>,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let config = Arc::new(config);
        let tokens = StageTokens::new(session.cancel_token());
        let drain = CancellationToken::new();

        let audio_capacity = config.audio_queue_capacity();
        let video_capacity = config.video_queue_capacity();
        let (text_tx, text_rx) = mpsc::channel(config.tts.max_pending_utterances);
        let (render_tx, render_rx) = mpsc::channel(audio_capacity);
        let (sync_audio_tx, sync_audio_rx) = mpsc::channel(audio_capacity);
        let (video_tx, video_rx) = mpsc::channel(video_capacity);
        let (skip_tx, skip_rx) = mpsc::channel(SKIP_QUEUE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(audio_capacity + video_capacity);

        let Collaborators {
            tts,
            renderer,
            sink,
        } = collaborators;
        let resolution = config.media.resolution();
        let idle = match &config.render.idle_clip_dir {
            Some(dir) => FrameCycle::new(clip::load_frames(dir, resolution)?)?,
            None => {
                let frames = renderer.idle_clip(resolution);
                if let Some(bad) = frames.iter().find(|f| f.len() != resolution.frame_bytes()) {
                    return Err(PipelineError::Config {
                        message: format!(
                            "Idle clip frame is {} bytes, expected {}",
                            bad.len(),
                            resolution.frame_bytes()
                        ),
                    });
                }
                FrameCycle::new(frames)?
            }
        };
        let clips = ClipLibrary::load(&config.clips, resolution)?;
        debug!("Idle clip has {} frames", idle.len());

        info!(
            "🚀 Starting pipeline session {} ({}fps, {}Hz, {}x{})",
            session.id(),
            config.media.frame_rate,
            config.media.sample_rate,
            config.media.width,
            config.media.height
        );

        let source = AudioSource::new(
            config.clone(),
            tts,
            session.clone(),
            text_rx,
            render_tx,
            sync_audio_tx,
            tokens.get(Stage::AudioSource),
        );
        let frame_renderer = FrameRenderer::new(
            config.clone(),
            renderer,
            session.clone(),
            render_rx,
            skip_rx,
            video_tx,
            tokens.get(Stage::FrameRenderer),
        );
        let synchronizer = Synchronizer::new(
            &config,
            idle,
            session.clone(),
            sync_audio_rx,
            video_rx,
            skip_tx,
            output_tx,
            drain.clone(),
            tokens.get(Stage::Synchronizer),
        );
        let pusher = OutputPusher::new(
            config.clone(),
            sink,
            session.clone(),
            output_rx,
            tokens.get(Stage::OutputPusher),
        );

        let handles = vec![
            (Stage::AudioSource, tokio::spawn(source.run())),
            (Stage::FrameRenderer, tokio::spawn(frame_renderer.run())),
            (Stage::Synchronizer, tokio::spawn(synchronizer.run())),
            (Stage::OutputPusher, tokio::spawn(pusher.run())),
        ];

        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(report_stats(
            session.clone(),
            config.session.stats_interval,
            reporter_stop.clone(),
        ));
        let supervisor = tokio::spawn(supervise(
            session.clone(),
            tokens.clone(),
            drain,
            handles,
            reporter_stop,
        ));

        Ok(Self {
            input: TextInput::new(text_tx, session.clone()),
            clips,
            resolution,
            canceller: CancelHandle {
                session: session.clone(),
                tokens,
            },
            session,
            supervisor,
            reporter,
        })
    }

    pub fn session(&self) -> &Arc<PipelineSession> {
        &self.session
    }

    /// 可克隆的文本输入句柄
    pub fn input(&self) -> TextInput {
        self.input.clone()
    }

    pub async fn submit(&self, text: impl Into<String>) -> Result<(), PipelineError> {
        self.input.submit(text).await
    }

    /// 按名称插播配置中的预录片段，片段音频播完后回到静音
    pub async fn play_clip(&self, name: &str) -> Result<(), PipelineError> {
        let clip = self.clips.get(name).ok_or_else(|| PipelineError::UnknownClip {
            name: name.to_string(),
        })?;
        self.input.submit_clip(clip).await
    }

    /// 插播临时提供的片段
    pub async fn play_media_clip(&self, clip: MediaClip) -> Result<(), PipelineError> {
        clip.validate(self.resolution)?;
        self.input.submit_clip(Arc::new(clip)).await
    }

    /// 已配置的片段名称
    pub fn clip_names(&self) -> Vec<String> {
        self.clips.names()
    }

    pub fn clip_library(&self) -> &ClipLibrary {
        &self.clips
    }

    /// 打断当前及已排队的播报
    pub fn interrupt(&self) -> u64 {
        let epoch = self.session.interrupt();
        info!("Interrupted, epoch {}", epoch);
        epoch
    }

    /// 优雅结束：不再接收文本，已排队的文本播完后关闭推流
    pub fn shutdown(&self) {
        info!("Graceful shutdown requested");
        self.session.begin_shutdown();
    }

    /// 操作员停止
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.canceller.clone()
    }

    /// 等待会话结束
    pub async fn wait(self) -> PipelineOutcome {
        let outcome = match self.supervisor.await {
            Ok(outcome) => outcome,
            Err(e) => PipelineOutcome::UpstreamFailed {
                stage: Stage::Synchronizer,
                reason: format!("supervisor panicked: {}", e),
            },
        };
        let _ = self.reporter.await;
        info!(
            "Session {} finished: {:?}, stats: {}",
            self.session.id(),
            outcome,
            serde_json::to_string(&self.session.snapshot()).unwrap_or_default()
        );
        outcome
    }
}

/// 收集各阶段退出结果并决定会话结局
async fn supervise(
    session: Arc<PipelineSession>,
    tokens: StageTokens,
    drain: CancellationToken,
    handles: Vec<(Stage, JoinHandle<Result<(), PipelineError>>)>,
    reporter_stop: CancellationToken,
) -> PipelineOutcome {
    let mut running: FuturesUnordered<_> = handles
        .into_iter()
        .map(|(stage, handle)| async move { (stage, handle.await) })
        .collect();
    let mut outcome: Option<PipelineOutcome> = None;

    while let Some((stage, joined)) = running.next().await {
        let result = joined.unwrap_or_else(|e| {
            Err(PipelineError::SessionFatal {
                stage,
                reason: format!("task panicked: {}", e),
            })
        });

        let error = match result {
            Ok(()) => {
                debug!("{} exited", stage);
                continue;
            }
            Err(e) => e,
        };

        error!("❌ {} failed: {}", stage, error);
        session.set_stage_health(stage, StageHealth::Failed);
        session.signal(PipelineSignal::StageFailed {
            stage,
            reason: error.to_string(),
        });
        if outcome.is_some() {
            continue;
        }

        if error.is_delivery() {
            // 已无法投递，不再排空
            session.begin_shutdown();
            tokens.cancel_in_order();
            outcome = Some(PipelineOutcome::DeliveryFailed {
                reason: error.to_string(),
            });
        } else {
            warn!("Stopping input and draining in-flight media");
            session.begin_shutdown();
            tokens.get(Stage::AudioSource).cancel();
            drain.cancel();
            let stage = match &error {
                PipelineError::SessionFatal { stage, .. } => *stage,
                _ => stage,
            };
            outcome = Some(PipelineOutcome::UpstreamFailed {
                stage,
                reason: error.to_string(),
            });
        }
    }

    reporter_stop.cancel();
    outcome.unwrap_or_else(|| {
        if session.is_cancelled() {
            PipelineOutcome::Cancelled
        } else {
            PipelineOutcome::Completed
        }
    })
}

/// 周期性输出统计快照
async fn report_stats(
    session: Arc<PipelineSession>,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 第一次 tick 立即完成
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match serde_json::to_string(&session.snapshot()) {
                    Ok(json) => info!("📊 Pipeline stats: {}", json),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            }
        }
    }
}
