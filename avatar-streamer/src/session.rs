// 推流会话状态
//
// 每条直播流只有一个 `PipelineSession`，以 `Arc` 形式传给各阶段。
// 时间轴位置只由同步器写入；健康标记与统计计数均为原子量，热路径上无锁。

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::Stage;
use crate::synchronizer::SyncState;

/// 信号总线容量
const SIGNAL_CAPACITY: usize = 256;

/// 阶段健康状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageHealth {
    Starting,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl StageHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StageHealth::Starting,
            1 => StageHealth::Running,
            2 => StageHealth::Degraded,
            3 => StageHealth::Stopped,
            _ => StageHealth::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StageHealth::Starting => 0,
            StageHealth::Running => 1,
            StageHealth::Degraded => 2,
            StageHealth::Stopped => 3,
            StageHealth::Failed => 4,
        }
    }
}

/// 管线信号
///
/// 可恢复的异常和状态变化通过广播总线通知订阅者（控制器日志、测试断言等）。
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineSignal {
    /// TTS 不可用，以静音替代
    TtsUnavailable { utterance_id: u64, reason: String },
    /// 渲染失败，以冻结帧替代
    RenderDegraded { frame_ts_us: u64, reason: String },
    /// 输出缓冲溢出
    SamplesDropped { video: u64, audio: u64 },
    /// 请求渲染器跳过一帧
    SkipRequested { drift_us: i64 },
    /// 推流连接断开，准备重连
    DeliveryInterrupted { reason: String },
    /// 重连成功
    Reconnected { attempts: u32 },
    /// 同步器状态变化
    SyncStateChanged { state: SyncState },
    /// 打断当前播报
    Interrupted { epoch: u64 },
    /// 阶段出现不可恢复错误
    StageFailed { stage: Stage, reason: String },
}

/// 会话统计
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub utterances_synthesized: AtomicU64,
    pub tts_failures: AtomicU64,
    pub clips_played: AtomicU64,
    pub audio_chunks_produced: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub frames_frozen: AtomicU64,
    pub clip_frames: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub audio_emitted: AtomicU64,
    pub video_emitted: AtomicU64,
    pub silence_fillers: AtomicU64,
    pub held_fillers: AtomicU64,
    pub repeated_frames: AtomicU64,
    pub late_frames_dropped: AtomicU64,
    pub skip_requests: AtomicU64,
    pub samples_delivered: AtomicU64,
    pub bytes_delivered: AtomicU64,
    pub video_dropped: AtomicU64,
    pub audio_dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub utterances_synthesized: u64,
    pub tts_failures: u64,
    pub clips_played: u64,
    pub audio_chunks_produced: u64,
    pub frames_rendered: u64,
    pub frames_frozen: u64,
    pub clip_frames: u64,
    pub frames_skipped: u64,
    pub audio_emitted: u64,
    pub video_emitted: u64,
    pub silence_fillers: u64,
    pub held_fillers: u64,
    pub repeated_frames: u64,
    pub late_frames_dropped: u64,
    pub skip_requests: u64,
    pub samples_delivered: u64,
    pub bytes_delivered: u64,
    pub video_dropped: u64,
    pub audio_dropped: u64,
    pub reconnects: u64,
    pub timeline_position_us: u64,
}

impl PipelineMetrics {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            utterances_synthesized: load(&self.utterances_synthesized),
            tts_failures: load(&self.tts_failures),
            clips_played: load(&self.clips_played),
            audio_chunks_produced: load(&self.audio_chunks_produced),
            frames_rendered: load(&self.frames_rendered),
            frames_frozen: load(&self.frames_frozen),
            clip_frames: load(&self.clip_frames),
            frames_skipped: load(&self.frames_skipped),
            audio_emitted: load(&self.audio_emitted),
            video_emitted: load(&self.video_emitted),
            silence_fillers: load(&self.silence_fillers),
            held_fillers: load(&self.held_fillers),
            repeated_frames: load(&self.repeated_frames),
            late_frames_dropped: load(&self.late_frames_dropped),
            skip_requests: load(&self.skip_requests),
            samples_delivered: load(&self.samples_delivered),
            bytes_delivered: load(&self.bytes_delivered),
            video_dropped: load(&self.video_dropped),
            audio_dropped: load(&self.audio_dropped),
            reconnects: load(&self.reconnects),
            timeline_position_us: 0,
        }
    }
}

/// 推流会话
pub struct PipelineSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    position_us: AtomicU64,
    interrupt_epoch: AtomicU64,
    health: [AtomicU8; 4],
    metrics: PipelineMetrics,
    signals: broadcast::Sender<PipelineSignal>,
}

impl PipelineSession {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            position_us: AtomicU64::new(0),
            interrupt_epoch: AtomicU64::new(0),
            health: Default::default(),
            metrics: PipelineMetrics::default(),
            signals,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 会话根取消令牌，各阶段持有其子令牌
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 停止接收新的文本输入
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 等待停止接收输入
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await
    }

    /// 当前时间轴位置（仅同步器写入）
    pub fn timeline_position_us(&self) -> u64 {
        self.position_us.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeline_position(&self, position_us: u64) {
        self.position_us.fetch_max(position_us, Ordering::AcqRel);
    }

    pub fn interrupt_epoch(&self) -> u64 {
        self.interrupt_epoch.load(Ordering::Acquire)
    }

    /// 打断当前播报，返回新的纪元号
    pub fn interrupt(&self) -> u64 {
        let epoch = self.interrupt_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.signal(PipelineSignal::Interrupted { epoch });
        epoch
    }

    pub fn stage_health(&self, stage: Stage) -> StageHealth {
        StageHealth::from_u8(self.health[stage.index()].load(Ordering::Acquire))
    }

    pub fn set_stage_health(&self, stage: Stage, health: StageHealth) {
        self.health[stage.index()].store(health.as_u8(), Ordering::Release);
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.timeline_position_us = self.timeline_position_us();
        snapshot
    }

    /// 广播信号；没有订阅者时直接丢弃
    pub fn signal(&self, signal: PipelineSignal) {
        debug!("Pipeline signal: {:?}", signal);
        let _ = self.signals.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.signals.subscribe()
    }
}

impl Default for PipelineSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_health_tracking() {
        let session = PipelineSession::new();
        assert_eq!(session.stage_health(Stage::FrameRenderer), StageHealth::Starting);

        session.set_stage_health(Stage::FrameRenderer, StageHealth::Degraded);
        assert_eq!(session.stage_health(Stage::FrameRenderer), StageHealth::Degraded);
        assert_eq!(session.stage_health(Stage::AudioSource), StageHealth::Starting);
    }

    #[test]
    fn test_timeline_position_never_decreases() {
        let session = PipelineSession::new();
        session.set_timeline_position(80_000);
        session.set_timeline_position(40_000);
        assert_eq!(session.timeline_position_us(), 80_000);
    }

    #[tokio::test]
    async fn test_interrupt_bumps_epoch_and_signals() {
        let session = PipelineSession::new();
        let mut signals = session.subscribe();

        assert_eq!(session.interrupt(), 1);
        assert_eq!(session.interrupt(), 2);
        assert_eq!(session.interrupt_epoch(), 2);
        assert_eq!(
            signals.recv().await.unwrap(),
            PipelineSignal::Interrupted { epoch: 1 }
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let session = PipelineSession::new();
        PipelineMetrics::incr(&session.metrics().silence_fillers);
        PipelineMetrics::add(&session.metrics().bytes_delivered, 640);
        session.set_timeline_position(20_000);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.silence_fillers, 1);
        assert_eq!(snapshot.timeline_position_us, 20_000);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"bytes_delivered\":640"));
    }
}
