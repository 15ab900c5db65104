// 音视频同步器
//
// 将音频源与渲染器两条独立节奏的序列合并到同一条呈现时间轴上：
// 按实时节奏输出、以音频为基准纠正视频漂移、在源停顿时插入填充样本。
//
// 合并逻辑集中在纯函数式的 `SyncCore` 中，由外部传入墙钟时间驱动，
// 便于确定性测试；`Synchronizer` 负责读取队列、定时唤醒并转发输出。

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use common::{AudioChunk, FrameOrigin, MediaKind, MediaPayload, MuxedSample, VideoFrame};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clip::FrameCycle;
use crate::clock::MediaClock;
use crate::config::{FillerVideo, MediaConfig, PipelineConfig};
use crate::error::{PipelineError, Stage};
use crate::session::{PipelineMetrics, PipelineSession, PipelineSignal, StageHealth};
use crate::timeline::PresentationTimeline;

/// 同步器状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    /// 首次输出前建立抖动缓冲
    Warmup,
    Streaming,
    /// 至少一个源超过停顿容忍时长，正在输出对应类型的填充样本
    Stalled { audio: bool, video: bool },
    /// 会话结束，按序冲刷剩余样本
    Draining,
    Closed,
}

/// 跳帧请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipRequest {
    pub drift_us: i64,
}

/// `SyncCore::poll` 的输出
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Emit(MuxedSample),
    /// 视频落后超过阈值，请求渲染器少产出一帧
    RequestSkip(SkipRequest),
    /// 缓冲中已过期的视频帧被丢弃
    LateFramesDropped(u64),
    StateChanged(SyncState),
}

/// 同步核心
pub struct SyncCore {
    media: MediaConfig,
    tolerance_us: u64,
    threshold_us: i64,
    jitter_us: u64,
    filler_video: FillerVideo,
    audio_limit: usize,
    video_limit: usize,
    timeline: PresentationTimeline,
    sequence: u64,
    reported: SyncState,
    started_at_us: Option<u64>,
    anchor_us: Option<u64>,
    last_now_us: u64,
    drain_requested: bool,
    closed: bool,

    // 音频通道
    audio_buf: VecDeque<AudioChunk>,
    audio_buffered_us: u64,
    audio_clock_us: u64,
    audio_ended: bool,
    audio_stalled: bool,
    audio_input_end_us: Option<u64>,
    /// 已输出的真实音频在内容时钟上的结束位置
    audio_content_cursor_us: u64,
    /// (内容起点, 呈现时间 - 内容时间) 映射历史
    shift_history: VecDeque<(u64, i64)>,

    // 视频通道
    video_buf: VecDeque<VideoFrame>,
    video_slot: u64,
    video_ended: bool,
    video_stalled: bool,
    video_input_end_us: Option<u64>,
    last_pixels: Bytes,
    has_real_frame: bool,
    /// 待机片段，尚无真实画面或静默填充时往返播放
    idle: FrameCycle,
    skip_outstanding: bool,
}

enum Lane {
    Audio,
    Video,
}

impl SyncCore {
    pub fn new(config: &PipelineConfig, idle: FrameCycle) -> Self {
        let media = config.media.clone();
        let horizon_us = (config.sync.jitter_buffer + config.sync.queue_capacity).as_micros() as u64;
        let audio_limit = horizon_us.div_ceil(media.audio_chunk_us().max(1)).max(1) as usize;
        let video_limit = horizon_us.div_ceil(media.nominal_frame_us().max(1)) as usize + 1;

        Self {
            media,
            tolerance_us: config.sync.stall_tolerance_us(),
            threshold_us: config.sync.drift_threshold_us() as i64,
            jitter_us: config.sync.jitter_buffer_us(),
            filler_video: config.sync.filler_video,
            audio_limit,
            video_limit,
            timeline: PresentationTimeline::new(),
            sequence: 0,
            reported: SyncState::Warmup,
            started_at_us: None,
            anchor_us: None,
            last_now_us: 0,
            drain_requested: false,
            closed: false,
            audio_buf: VecDeque::new(),
            audio_buffered_us: 0,
            audio_clock_us: 0,
            audio_ended: false,
            audio_stalled: false,
            audio_input_end_us: None,
            audio_content_cursor_us: 0,
            shift_history: VecDeque::new(),
            video_buf: VecDeque::new(),
            video_slot: 0,
            video_ended: false,
            video_stalled: false,
            video_input_end_us: None,
            last_pixels: Bytes::new(),
            has_real_frame: false,
            idle,
            skip_outstanding: false,
        }
    }

    pub fn state(&self) -> SyncState {
        if self.closed {
            SyncState::Closed
        } else if self.is_draining() {
            SyncState::Draining
        } else if self.anchor_us.is_none() {
            SyncState::Warmup
        } else if self.audio_stalled || self.video_stalled {
            SyncState::Stalled {
                audio: self.audio_stalled,
                video: self.video_stalled,
            }
        } else {
            SyncState::Streaming
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_draining(&self) -> bool {
        self.drain_requested || self.audio_ended
    }

    pub fn audio_has_room(&self) -> bool {
        self.audio_buf.len() < self.audio_limit
    }

    pub fn video_has_room(&self) -> bool {
        self.video_buf.len() < self.video_limit
    }

    /// 时间轴当前位置
    pub fn position_us(&self) -> u64 {
        self.timeline.position_us()
    }

    /// 呈现时间 0 对应的墙钟时间，预热结束后才确定
    pub fn anchor_us(&self) -> Option<u64> {
        self.anchor_us
    }

    pub fn lane_end_us(&self, kind: MediaKind) -> u64 {
        self.timeline.end_of(kind).unwrap_or(0)
    }

    pub fn push_audio(&mut self, chunk: AudioChunk) -> Result<(), PipelineError> {
        if let Some(last_end_us) = self.audio_input_end_us {
            if chunk.ts_us < last_end_us {
                return Err(PipelineError::TimelineViolation {
                    kind: MediaKind::Audio,
                    pts_us: chunk.ts_us,
                    last_end_us,
                });
            }
        }
        self.audio_input_end_us = Some(chunk.end_us());
        self.audio_buffered_us += chunk.duration_us;
        self.audio_buf.push_back(chunk);
        Ok(())
    }

    pub fn push_video(&mut self, frame: VideoFrame) -> Result<(), PipelineError> {
        if let Some(last_end_us) = self.video_input_end_us {
            if frame.ts_us < last_end_us {
                return Err(PipelineError::TimelineViolation {
                    kind: MediaKind::Video,
                    pts_us: frame.ts_us,
                    last_end_us,
                });
            }
        }
        self.video_input_end_us = Some(frame.end_us());
        self.video_buf.push_back(frame);
        Ok(())
    }

    /// 音频输入结束，同步器进入冲刷阶段
    pub fn audio_ended(&mut self) {
        self.audio_ended = true;
    }

    pub fn video_ended(&mut self) {
        self.video_ended = true;
    }

    /// 跳帧请求未能送达渲染器，允许下次重新请求
    pub fn skip_rejected(&mut self) {
        self.skip_outstanding = false;
    }

    /// 停止插入填充样本，输出剩余缓冲后关闭
    pub fn begin_drain(&mut self) {
        self.drain_requested = true;
    }

    /// 下一次需要调用 `poll` 的墙钟时间
    pub fn next_deadline(&self) -> Option<u64> {
        if self.closed {
            return None;
        }

        let anchor = match self.anchor_us {
            Some(anchor) => anchor,
            None => {
                if self.warmup_satisfied() {
                    return Some(self.last_now_us);
                }
                return Some(self.started_at_us.unwrap_or(0) + self.tolerance_us);
            }
        };

        let audio_due = anchor + self.audio_clock_us;
        let audio = if !self.audio_buf.is_empty() {
            Some(audio_due)
        } else if self.audio_fill_allowed() {
            Some(if self.audio_stalled {
                audio_due
            } else {
                audio_due + self.tolerance_us
            })
        } else {
            None
        };

        let video_due = anchor + self.media.frame_start_us(self.video_slot);
        let video = if !self.video_buf.is_empty() {
            Some(video_due)
        } else if self.video_fill_allowed() {
            Some(if self.video_stalled {
                video_due
            } else {
                video_due + self.tolerance_us
            })
        } else {
            None
        };

        match (audio, video) {
            (Some(a), Some(v)) => Some(a.min(v)),
            (a, v) => a.or(v),
        }
    }

    /// 推进到墙钟时间 `now_us`，返回期间产生的全部动作
    pub fn poll(&mut self, now_us: u64) -> Result<Vec<SyncAction>, PipelineError> {
        if now_us < self.last_now_us {
            return Err(PipelineError::ClockRegressed {
                now_us,
                last_us: self.last_now_us,
            });
        }
        self.last_now_us = now_us;
        let mut actions = Vec::new();

        if self.closed {
            return Ok(actions);
        }

        let started_at = *self.started_at_us.get_or_insert(now_us);
        if self.anchor_us.is_none() {
            if self.warmup_satisfied() || now_us >= started_at + self.tolerance_us {
                debug!(
                    "Warmup finished at {}us with {}us of audio buffered",
                    now_us, self.audio_buffered_us
                );
                self.anchor_us = Some(now_us);
            } else {
                return Ok(actions);
            }
        }

        loop {
            let audio_pts = self.audio_ready(now_us).then_some(self.audio_clock_us);
            let video_pts = self
                .video_ready(now_us)
                .then(|| self.media.frame_start_us(self.video_slot));

            let lane = match (audio_pts, video_pts) {
                (Some(a), Some(v)) if v < a => Lane::Video,
                (Some(_), _) => Lane::Audio,
                (None, Some(_)) => Lane::Video,
                (None, None) => break,
            };

            match lane {
                Lane::Audio => self.emit_audio(&mut actions)?,
                Lane::Video => self.emit_video(&mut actions)?,
            }
        }

        if self.is_draining()
            && self.audio_ended
            && self.audio_buf.is_empty()
            && self.video_ended
            && self.video_buf.is_empty()
        {
            self.closed = true;
        }

        let state = self.state();
        if state != self.reported {
            self.reported = state;
            actions.push(SyncAction::StateChanged(state));
        }

        Ok(actions)
    }

    fn warmup_satisfied(&self) -> bool {
        self.audio_buffered_us >= self.jitter_us || self.audio_ended || self.drain_requested
    }

    fn audio_fill_allowed(&self) -> bool {
        !self.audio_ended && !self.is_draining()
    }

    fn video_fill_allowed(&self) -> bool {
        !self.video_ended && !self.is_draining()
    }

    fn audio_ready(&self, now_us: u64) -> bool {
        let Some(anchor) = self.anchor_us else {
            return false;
        };
        let due = anchor + self.audio_clock_us;
        if due > now_us {
            return false;
        }
        if !self.audio_buf.is_empty() {
            return true;
        }
        self.audio_fill_allowed() && (self.audio_stalled || due + self.tolerance_us <= now_us)
    }

    fn video_ready(&self, now_us: u64) -> bool {
        let Some(anchor) = self.anchor_us else {
            return false;
        };
        let due = anchor + self.media.frame_start_us(self.video_slot);
        if due > now_us {
            return false;
        }
        if !self.video_buf.is_empty() {
            return true;
        }
        self.video_fill_allowed() && (self.video_stalled || due + self.tolerance_us <= now_us)
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn emit_audio(&mut self, actions: &mut Vec<SyncAction>) -> Result<(), PipelineError> {
        let pts_us = self.audio_clock_us;
        let (chunk, filler) = match self.audio_buf.pop_front() {
            Some(chunk) => {
                self.audio_buffered_us -= chunk.duration_us;
                let shift = pts_us as i64 - chunk.ts_us as i64;
                if self.shift_history.back().map(|(_, s)| *s) != Some(shift) {
                    self.shift_history.push_back((chunk.ts_us, shift));
                }
                self.audio_content_cursor_us = chunk.end_us();
                self.audio_stalled = false;
                (chunk, false)
            }
            None => {
                if !self.audio_stalled {
                    warn!("Audio source stalled at pts {}us, inserting silence", pts_us);
                }
                self.audio_stalled = true;
                let chunk = AudioChunk::silence(
                    0,
                    self.media.sample_rate,
                    pts_us,
                    self.media.chunk_samples(),
                );
                (chunk, true)
            }
        };

        self.timeline
            .record(MediaKind::Audio, pts_us, chunk.duration_us)?;
        self.audio_clock_us += chunk.duration_us;
        self.prune_shift_history();

        let sequence = self.next_sequence();
        actions.push(SyncAction::Emit(MuxedSample {
            sequence,
            pts_us,
            filler,
            payload: MediaPayload::Audio(chunk),
        }));
        Ok(())
    }

    /// 某内容时间对应的呈现偏移
    fn shift_for(&self, content_us: u64) -> i64 {
        if content_us >= self.audio_content_cursor_us {
            // 对应音频尚未输出，偏移包含已插入的填充
            return self.audio_clock_us as i64 - self.audio_content_cursor_us as i64;
        }
        self.shift_history
            .iter()
            .rev()
            .find(|(start, _)| *start <= content_us)
            .or_else(|| self.shift_history.front())
            .map(|(_, shift)| *shift)
            .unwrap_or(0)
    }

    /// 丢弃不会再被查询的映射，仅保留查询下界处仍然生效的一条
    fn prune_shift_history(&mut self) {
        let oldest_video_us = self
            .video_buf
            .front()
            .map(|f| f.ts_us)
            .or(self.video_input_end_us)
            .unwrap_or(0);
        let floor_us = oldest_video_us.min(self.audio_content_cursor_us);
        while self.shift_history.len() > 1 {
            match self.shift_history.get(1) {
                Some((start, _)) if *start <= floor_us => {
                    self.shift_history.pop_front();
                }
                _ => break,
            }
        }
    }

    fn drift_of(&self, frame: &VideoFrame, slot_pts_us: u64) -> i64 {
        slot_pts_us as i64 - (frame.ts_us as i64 + self.shift_for(frame.ts_us))
    }

    fn emit_video(&mut self, actions: &mut Vec<SyncAction>) -> Result<(), PipelineError> {
        let pts_us = self.media.frame_start_us(self.video_slot);
        let duration_us = self.media.frame_duration_us(self.video_slot);

        // 缓冲中还有后续帧时，直接丢弃已经过期的帧
        let mut dropped = 0;
        while self.video_buf.len() > 1 {
            let Some(front) = self.video_buf.front() else {
                break;
            };
            if self.drift_of(front, pts_us) <= self.threshold_us {
                break;
            }
            if let Some(stale) = self.video_buf.pop_front() {
                if stale.resynced {
                    self.skip_outstanding = false;
                }
                self.last_pixels = stale.pixels;
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Dropped {} late video frames before slot {}", dropped, self.video_slot);
            actions.push(SyncAction::LateFramesDropped(dropped));
        }

        let drift = self.video_buf.front().map(|f| self.drift_of(f, pts_us));
        let (frame, filler) = match drift {
            Some(drift) if drift < -self.threshold_us => {
                // 视频超前，重复上一帧等待音频
                (self.held_frame(pts_us, duration_us, false), false)
            }
            Some(drift) => match self.video_buf.pop_front() {
                Some(mut frame) => {
                    if frame.resynced {
                        self.skip_outstanding = false;
                    }
                    if drift > self.threshold_us && !self.skip_outstanding {
                        self.skip_outstanding = true;
                        actions.push(SyncAction::RequestSkip(SkipRequest { drift_us: drift }));
                    }
                    self.last_pixels = frame.pixels.clone();
                    self.has_real_frame = true;
                    self.video_stalled = false;
                    frame.duration_us = duration_us;
                    (frame, false)
                }
                None => (self.held_frame(pts_us, duration_us, false), false),
            },
            None => {
                if !self.video_stalled {
                    warn!("Video source stalled at pts {}us, holding last frame", pts_us);
                }
                self.video_stalled = true;
                (self.held_frame(pts_us, duration_us, true), true)
            }
        };

        self.timeline.record(MediaKind::Video, pts_us, duration_us)?;
        self.video_slot += 1;
        self.prune_shift_history();

        let sequence = self.next_sequence();
        actions.push(SyncAction::Emit(MuxedSample {
            sequence,
            pts_us,
            filler,
            payload: MediaPayload::Video(frame),
        }));
        Ok(())
    }

    /// 重复上一帧；尚无真实画面，或音频也在填充静音且配置为待机片段时，取待机片段的下一帧
    fn held_frame(&mut self, pts_us: u64, duration_us: u64, filler: bool) -> VideoFrame {
        let silent_filler =
            filler && self.audio_stalled && self.filler_video == FillerVideo::IdleClip;
        let (pixels, origin) = if !self.has_real_frame || silent_filler {
            (self.idle.next_frame(), FrameOrigin::Idle)
        } else {
            (self.last_pixels.clone(), FrameOrigin::Held)
        };
        VideoFrame {
            pixels,
            resolution: self.media.resolution(),
            ts_us: pts_us,
            duration_us,
            origin,
            resynced: false,
        }
    }
}

/// 同步器工作任务
pub struct Synchronizer {
    core: SyncCore,
    session: Arc<PipelineSession>,
    audio_rx: mpsc::Receiver<AudioChunk>,
    video_rx: mpsc::Receiver<VideoFrame>,
    skip_tx: mpsc::Sender<SkipRequest>,
    output: mpsc::Sender<MuxedSample>,
    drain: CancellationToken,
    cancel: CancellationToken,
}

impl Synchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &PipelineConfig,
        idle: FrameCycle,
        session: Arc<PipelineSession>,
        audio_rx: mpsc::Receiver<AudioChunk>,
        video_rx: mpsc::Receiver<VideoFrame>,
        skip_tx: mpsc::Sender<SkipRequest>,
        output: mpsc::Sender<MuxedSample>,
        drain: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core: SyncCore::new(config, idle),
            session,
            audio_rx,
            video_rx,
            skip_tx,
            output,
            drain,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        let Synchronizer {
            mut core,
            session,
            mut audio_rx,
            mut video_rx,
            skip_tx,
            output,
            drain,
            cancel,
        } = self;

        let clock = MediaClock::start();
        let mut audio_open = true;
        let mut video_open = true;
        let mut drain_seen = false;

        session.set_stage_health(Stage::Synchronizer, StageHealth::Running);
        info!("🎬 Synchronizer started");

        loop {
            let actions = core.poll(clock.now_us())?;
            for action in actions {
                match action {
                    SyncAction::Emit(sample) => {
                        record_emission(&session, &sample);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                info!("Synchronizer cancelled");
                                session.set_stage_health(Stage::Synchronizer, StageHealth::Stopped);
                                return Ok(());
                            }
                            sent = output.send(sample) => {
                                if sent.is_err() {
                                    warn!("Output channel closed, synchronizer stopping");
                                    session.set_stage_health(Stage::Synchronizer, StageHealth::Stopped);
                                    return Ok(());
                                }
                            }
                        }
                    }
                    SyncAction::RequestSkip(request) => {
                        debug!("Requesting frame skip, drift={}us", request.drift_us);
                        PipelineMetrics::incr(&session.metrics().skip_requests);
                        session.signal(PipelineSignal::SkipRequested {
                            drift_us: request.drift_us,
                        });
                        if skip_tx.try_send(request).is_err() {
                            core.skip_rejected();
                        }
                    }
                    SyncAction::LateFramesDropped(count) => {
                        PipelineMetrics::add(&session.metrics().late_frames_dropped, count);
                    }
                    SyncAction::StateChanged(state) => {
                        info!("Synchronizer state -> {:?}", state);
                        session.signal(PipelineSignal::SyncStateChanged { state });
                    }
                }
            }

            if core.is_closed() {
                break;
            }

            let deadline = core.next_deadline();
            let wake_at = clock.instant_at(deadline.unwrap_or(0));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Synchronizer cancelled");
                    session.set_stage_health(Stage::Synchronizer, StageHealth::Stopped);
                    return Ok(());
                }
                _ = drain.cancelled(), if !drain_seen => {
                    info!("Synchronizer draining");
                    drain_seen = true;
                    core.begin_drain();
                }
                chunk = audio_rx.recv(), if audio_open && core.audio_has_room() => {
                    match chunk {
                        Some(chunk) => core.push_audio(chunk)?,
                        None => {
                            debug!("Audio input closed");
                            audio_open = false;
                            core.audio_ended();
                        }
                    }
                }
                frame = video_rx.recv(), if video_open && core.video_has_room() => {
                    match frame {
                        Some(frame) => core.push_video(frame)?,
                        None => {
                            debug!("Video input closed");
                            video_open = false;
                            core.video_ended();
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {}
            }
        }

        session.set_stage_health(Stage::Synchronizer, StageHealth::Stopped);
        info!(
            "✓ Synchronizer closed at timeline position {}us",
            core.position_us()
        );
        Ok(())
    }
}

fn record_emission(session: &PipelineSession, sample: &MuxedSample) {
    let metrics = session.metrics();
    session.set_timeline_position(sample.end_us());
    match &sample.payload {
        MediaPayload::Audio(_) => {
            PipelineMetrics::incr(&metrics.audio_emitted);
            if sample.filler {
                PipelineMetrics::incr(&metrics.silence_fillers);
            }
        }
        MediaPayload::Video(frame) => {
            PipelineMetrics::incr(&metrics.video_emitted);
            if sample.filler {
                PipelineMetrics::incr(&metrics.held_fillers);
            } else if frame.origin == FrameOrigin::Held {
                PipelineMetrics::incr(&metrics.repeated_frames);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AudioOrigin, Resolution};
    use proptest::prelude::*;
    use std::time::Duration;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.media.width = 4;
        config.media.height = 4;
        config
    }

    fn chunk(ts_ms: u64) -> AudioChunk {
        let mut chunk = AudioChunk::silence(1, 16_000, ts_ms * 1000, 320);
        chunk.origin = AudioOrigin::Speech;
        chunk
    }

    fn frame(ts_ms: u64) -> VideoFrame {
        VideoFrame {
            pixels: Bytes::from(vec![(ts_ms / 40) as u8; 48]),
            resolution: Resolution::new(4, 4),
            ts_us: ts_ms * 1000,
            duration_us: 40_000,
            origin: FrameOrigin::Rendered,
            resynced: false,
        }
    }

    fn still_idle() -> FrameCycle {
        FrameCycle::still(Bytes::from(vec![0u8; 48]))
    }

    /// 三帧待机片段，像素值分别为 100、101、102
    fn breathing_idle() -> FrameCycle {
        FrameCycle::new((100..103u8).map(|v| Bytes::from(vec![v; 48])).collect()).unwrap()
    }

    fn core() -> SyncCore {
        SyncCore::new(&test_config(), still_idle())
    }

    fn samples(actions: &[SyncAction]) -> Vec<MuxedSample> {
        actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::Emit(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn of_kind(samples: &[MuxedSample], kind: MediaKind) -> Vec<MuxedSample> {
        samples.iter().filter(|s| s.kind() == kind).cloned().collect()
    }

    fn assert_contiguous(samples: &[MuxedSample]) {
        for pair in samples.windows(2) {
            assert_eq!(pair[1].pts_us, pair[0].end_us(), "gap or overlap at {:?}", pair[1]);
        }
    }

    fn video_frame(sample: &MuxedSample) -> &VideoFrame {
        match &sample.payload {
            MediaPayload::Video(frame) => frame,
            other => panic!("expected video, got {:?}", other),
        }
    }

    #[test]
    fn test_warmup_waits_for_jitter_buffer() {
        let mut core = core();
        for i in 0..4 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        assert!(core.poll(0).unwrap().is_empty());
        assert_eq!(core.state(), SyncState::Warmup);

        core.push_audio(chunk(80)).unwrap();
        let actions = core.poll(10_000).unwrap();
        let out = samples(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts_us, 0);
        assert_eq!(core.anchor_us(), Some(10_000));
        assert_eq!(
            actions.last(),
            Some(&SyncAction::StateChanged(SyncState::Streaming))
        );
    }

    #[test]
    fn test_warmup_times_out_without_input() {
        let mut core = core();
        assert!(core.poll(0).unwrap().is_empty());
        assert_eq!(core.next_deadline(), Some(200_000));
        core.poll(200_000).unwrap();
        assert_eq!(core.anchor_us(), Some(200_000));
        // 启动后无输入，容忍时长过后开始输出填充
        assert_eq!(core.next_deadline(), Some(400_000));
    }

    #[test]
    fn test_tts_stall_emits_expected_fillers() {
        let mut core = core();
        for i in 0..10 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        for i in 0..5 {
            core.push_video(frame(i * 40)).unwrap();
        }

        let mut actions = Vec::new();
        let mut t = 0;
        while t <= 780_000 {
            if t == 600_000 {
                for i in 10..20 {
                    core.push_audio(chunk(i * 20)).unwrap();
                }
                for i in 5..10 {
                    core.push_video(frame(i * 40)).unwrap();
                }
            }
            actions.extend(core.poll(t).unwrap());
            t += 10_000;
        }

        let out = samples(&actions);
        let audio = of_kind(&out, MediaKind::Audio);
        let video = of_kind(&out, MediaKind::Video);
        assert_contiguous(&audio);
        assert_contiguous(&video);

        assert_eq!(audio.len(), 40);
        let silence: Vec<u64> = audio.iter().filter(|s| s.filler).map(|s| s.pts_us).collect();
        assert_eq!(silence.len(), 20);
        assert_eq!(silence.first(), Some(&200_000));
        assert_eq!(silence.last(), Some(&580_000));

        assert_eq!(video.len(), 20);
        let held: Vec<&MuxedSample> = video.iter().filter(|s| s.filler).collect();
        assert_eq!(held.len(), 10);
        assert_eq!(held[0].pts_us, 200_000);
        assert_eq!(held[9].pts_us, 560_000);
        // 填充帧沿用停顿前最后一帧画面
        assert_eq!(video_frame(held[0]).pixels, frame(160).pixels);
        assert_eq!(video_frame(held[0]).origin, FrameOrigin::Held);

        // 恢复后内容 200ms 处的音视频落在同一呈现时间
        let resumed_audio = audio.iter().find(|s| !s.filler && s.pts_us >= 600_000).unwrap();
        let resumed_video = video.iter().find(|s| !s.filler && s.pts_us >= 600_000).unwrap();
        assert_eq!(resumed_audio.pts_us, 600_000);
        assert_eq!(resumed_video.pts_us, 600_000);
        assert_eq!(video_frame(resumed_video).ts_us, 200_000);

        let states: Vec<SyncState> = actions
            .iter()
            .filter_map(|a| match a {
                SyncAction::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SyncState::Streaming,
                SyncState::Stalled {
                    audio: true,
                    video: true
                },
                SyncState::Streaming,
            ]
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SyncAction::RequestSkip(_) | SyncAction::LateFramesDropped(_))));
    }

    #[test]
    fn test_identical_schedule_is_deterministic() {
        let run = || {
            let mut core = core();
            let mut pts = Vec::new();
            for t in (0..=500_000).step_by(10_000) {
                if t % 40_000 == 0 && t < 300_000 {
                    core.push_audio(chunk(t / 1000)).unwrap();
                    core.push_audio(chunk(t / 1000 + 20)).unwrap();
                    core.push_video(frame(t / 1000)).unwrap();
                }
                for s in samples(&core.poll(t).unwrap()) {
                    pts.push((s.kind(), s.pts_us, s.filler));
                }
            }
            pts
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_buffered_late_frames_dropped() {
        let mut core = core();
        for i in 0..20 {
            core.push_audio(chunk(i * 20)).unwrap();
        }

        let mut actions = Vec::new();
        for t in (0..=240_000).step_by(10_000) {
            actions.extend(core.poll(t).unwrap());
        }
        // 视频 0-200ms 的槽位已被待机帧填充
        let idle = of_kind(&samples(&actions), MediaKind::Video);
        assert_eq!(idle.len(), 7);
        assert!(idle.iter().all(|s| video_frame(s).origin == FrameOrigin::Idle));

        for i in 0..10 {
            core.push_video(frame(i * 40)).unwrap();
        }
        let actions = core.poll(280_000).unwrap();
        assert!(actions.contains(&SyncAction::LateFramesDropped(6)));
        let video = of_kind(&samples(&actions), MediaKind::Video);
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].pts_us, 280_000);
        assert_eq!(video_frame(&video[0]).ts_us, 240_000);
        assert!(!video[0].filler);
        assert!(!actions.iter().any(|a| matches!(a, SyncAction::RequestSkip(_))));
    }

    #[test]
    fn test_lagging_video_requests_single_skip() {
        let mut core = core();
        for i in 0..30 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        // 视频前 7 个槽位停顿，由填充帧占用
        for t in (0..=240_000).step_by(10_000) {
            core.poll(t).unwrap();
        }

        // 之后每个槽位到期时只有一帧可用，且落后两帧
        let mut skips = Vec::new();
        for slot in 7..10u64 {
            core.push_video(frame((slot - 2) * 40)).unwrap();
            for action in core.poll(slot * 40_000).unwrap() {
                if let SyncAction::RequestSkip(request) = action {
                    skips.push(request.drift_us);
                }
            }
        }
        assert_eq!(skips, vec![80_000]);

        // 渲染器跳过一帧后，下一帧标记为重新同步
        let mut resynced = frame(9 * 40);
        resynced.resynced = true;
        core.push_video(resynced).unwrap();
        let actions = core.poll(10 * 40_000).unwrap();
        assert!(!actions.iter().any(|a| matches!(a, SyncAction::RequestSkip(_))));
        let video = of_kind(&samples(&actions), MediaKind::Video);
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].pts_us, 400_000);
        assert_eq!(video_frame(&video[0]).ts_us, 360_000);
    }

    #[test]
    fn test_leading_video_repeats_frame() {
        let mut core = core();
        for i in 0..10 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        core.push_video(frame(80)).unwrap();

        let first = samples(&core.poll(0).unwrap());
        let video = of_kind(&first, MediaKind::Video);
        assert_eq!(video.len(), 1);
        assert!(!video[0].filler);
        assert_eq!(video_frame(&video[0]).origin, FrameOrigin::Idle);

        let second = of_kind(&samples(&core.poll(40_000).unwrap()), MediaKind::Video);
        assert_eq!(video_frame(&second[0]).ts_us, 80_000);
        assert_eq!(video_frame(&second[0]).origin, FrameOrigin::Rendered);
    }

    #[test]
    fn test_drain_flushes_then_closes() {
        let mut core = core();
        for i in 0..10 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        for i in 0..4 {
            core.push_video(frame(i * 40)).unwrap();
        }
        core.audio_ended();
        core.video_ended();

        let mut actions = Vec::new();
        for t in (0..=300_000).step_by(10_000) {
            actions.extend(core.poll(t).unwrap());
        }

        let out = samples(&actions);
        assert_eq!(of_kind(&out, MediaKind::Audio).len(), 10);
        assert_eq!(of_kind(&out, MediaKind::Video).len(), 4);
        assert!(out.iter().all(|s| !s.filler));
        assert!(core.is_closed());
        assert_eq!(core.next_deadline(), None);
        assert_eq!(
            actions.first(),
            Some(&SyncAction::Emit(out[0].clone()))
        );
        assert_eq!(
            actions.last(),
            Some(&SyncAction::StateChanged(SyncState::Closed))
        );
    }

    #[test]
    fn test_begin_drain_stops_fillers() {
        let mut core = core();
        for i in 0..5 {
            core.push_audio(chunk(i * 20)).unwrap();
        }
        core.poll(0).unwrap();
        core.begin_drain();
        let mut out = Vec::new();
        for t in (10_000..=600_000).step_by(10_000) {
            out.extend(samples(&core.poll(t).unwrap()));
        }
        assert!(out.iter().all(|s| !s.filler));
        assert_eq!(core.state(), SyncState::Draining);
    }

    #[test]
    fn test_clock_regression_is_fatal() {
        let mut core = core();
        core.poll(100_000).unwrap();
        assert!(matches!(
            core.poll(50_000),
            Err(PipelineError::ClockRegressed { .. })
        ));
    }

    #[test]
    fn test_input_regression_is_fatal() {
        let mut core = core();
        core.push_audio(chunk(20)).unwrap();
        assert!(matches!(
            core.push_audio(chunk(0)),
            Err(PipelineError::TimelineViolation {
                kind: MediaKind::Audio,
                ..
            })
        ));
    }

    #[test]
    fn test_shift_history_stays_bounded_over_repeated_stalls() {
        let mut core = core();
        let mut t = 0;
        let mut longest = 0;
        for cycle in 0..1000u64 {
            // 每轮 200ms 语音，随后 300ms 无输入
            let content_ms = cycle * 200;
            for i in 0..10 {
                core.push_audio(chunk(content_ms + i * 20)).unwrap();
            }
            for i in 0..5 {
                core.push_video(frame(content_ms + i * 40)).unwrap();
            }
            for _ in 0..50 {
                core.poll(t).unwrap();
                t += 10_000;
            }
            longest = longest.max(core.shift_history.len());
        }

        assert!(core.audio_content_cursor_us > 0);
        assert!(longest <= 3, "shift history grew to {}", longest);
    }

    #[test]
    fn test_idle_clip_plays_before_first_frame() {
        let mut core = SyncCore::new(&test_config(), breathing_idle());
        for i in 0..20 {
            core.push_audio(chunk(i * 20)).unwrap();
        }

        let mut actions = Vec::new();
        for t in (0..=240_000).step_by(10_000) {
            actions.extend(core.poll(t).unwrap());
        }
        let video = of_kind(&samples(&actions), MediaKind::Video);
        assert_eq!(video.len(), 7);
        assert!(video.iter().all(|s| video_frame(s).origin == FrameOrigin::Idle));
        let order: Vec<u8> = video.iter().map(|s| video_frame(s).pixels[0]).collect();
        assert_eq!(order, vec![100, 101, 102, 102, 101, 100, 100]);
    }

    #[test]
    fn test_filler_video_follows_configured_mode() {
        let run = |filler_video: FillerVideo, audio_ms: u64| {
            let mut config = test_config();
            config.sync.filler_video = filler_video;
            let mut core = SyncCore::new(&config, breathing_idle());
            for i in 0..audio_ms / 20 {
                core.push_audio(chunk(i * 20)).unwrap();
            }
            for i in 0..5 {
                core.push_video(frame(i * 40)).unwrap();
            }
            let mut actions = Vec::new();
            for t in (0..=560_000).step_by(10_000) {
                actions.extend(core.poll(t).unwrap());
            }
            of_kind(&samples(&actions), MediaKind::Video)
                .into_iter()
                .filter(|s| s.filler)
                .collect::<Vec<_>>()
        };

        // 音视频同时停顿：静默期间播放待机片段
        let silent = run(FillerVideo::IdleClip, 200);
        assert_eq!(silent.len(), 10);
        assert!(silent.iter().all(|s| video_frame(s).origin == FrameOrigin::Idle));
        let order: Vec<u8> = silent.iter().map(|s| video_frame(s).pixels[0]).collect();
        assert_eq!(order, vec![100, 101, 102, 102, 101, 100, 100, 101, 102, 102]);

        // 语音仍在播放、仅视频停顿时保持最后一帧
        let speaking = run(FillerVideo::IdleClip, 1000);
        assert!(!speaking.is_empty());
        assert_eq!(video_frame(&speaking[0]).origin, FrameOrigin::Held);
        assert_eq!(video_frame(&speaking[0]).pixels, frame(160).pixels);

        // 默认保持最后一帧
        let held = run(FillerVideo::Hold, 200);
        assert_eq!(held.len(), 10);
        assert!(held.iter().all(|s| video_frame(s).pixels == frame(160).pixels));
    }

    proptest! {
        #[test]
        fn prop_timeline_contiguous_and_bounded(
            audio_bursts in proptest::collection::vec(0usize..4, 1..80),
            video_bursts in proptest::collection::vec(0usize..3, 1..80),
        ) {
            let config = test_config();
            let tolerance_us = config.sync.stall_tolerance_us();
            let mut core = SyncCore::new(&config, still_idle());
            let mut next_chunk = 0u64;
            let mut next_frame = 0u64;
            let mut out = Vec::new();

            let steps = audio_bursts.len().max(video_bursts.len());
            for step in 0..steps {
                let t = step as u64 * 10_000;
                for _ in 0..audio_bursts.get(step).copied().unwrap_or(0) {
                    if core.audio_has_room() {
                        core.push_audio(chunk(next_chunk * 20)).unwrap();
                        next_chunk += 1;
                    }
                }
                for _ in 0..video_bursts.get(step).copied().unwrap_or(0) {
                    if core.video_has_room() {
                        core.push_video(frame(next_frame * 40)).unwrap();
                        next_frame += 1;
                    }
                }
                out.extend(samples(&core.poll(t).unwrap()));

                if let Some(anchor) = core.anchor_us() {
                    let elapsed = t - anchor;
                    prop_assert!(core.lane_end_us(MediaKind::Audio) + tolerance_us >= elapsed);
                    prop_assert!(core.lane_end_us(MediaKind::Video) + tolerance_us >= elapsed);
                    // 不早于实时输出
                    for s in out.iter().rev().take(8) {
                        prop_assert!(s.pts_us <= elapsed);
                    }
                }
            }

            for kind in [MediaKind::Audio, MediaKind::Video] {
                let lane = of_kind(&out, kind);
                for pair in lane.windows(2) {
                    prop_assert_eq!(pair[1].pts_us, pair[0].end_us());
                }
            }
            for pair in out.windows(2) {
                prop_assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_paces_output_in_real_time() {
        let config = test_config();
        let session = Arc::new(PipelineSession::new());
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (video_tx, video_rx) = mpsc::channel(64);
        let (skip_tx, _skip_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        for i in 0..25 {
            audio_tx.send(chunk(i * 20)).await.unwrap();
        }
        for i in 0..12 {
            video_tx.send(frame(i * 40)).await.unwrap();
        }
        drop(audio_tx);
        drop(video_tx);

        let sync = Synchronizer::new(
            &config,
            still_idle(),
            session.clone(),
            audio_rx,
            video_rx,
            skip_tx,
            out_tx,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(sync.run());

        let mut received = Vec::new();
        while let Some(sample) = out_rx.recv().await {
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_micros(sample.pts_us));
            assert!(elapsed <= Duration::from_micros(sample.pts_us) + Duration::from_millis(10));
            received.push(sample);
        }
        handle.await.unwrap().unwrap();

        assert_eq!(of_kind(&received, MediaKind::Audio).len(), 25);
        assert_eq!(of_kind(&received, MediaKind::Video).len(), 12);
        assert!(received.iter().all(|s| !s.filler));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.audio_emitted, 25);
        assert_eq!(snapshot.video_emitted, 12);
        assert_eq!(snapshot.timeline_position_us, 500_000);
        assert_eq!(
            session.stage_health(Stage::Synchronizer),
            StageHealth::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_stops_on_cancel() {
        let config = test_config();
        let session = Arc::new(PipelineSession::new());
        let (_audio_tx, audio_rx) = mpsc::channel::<AudioChunk>(4);
        let (_video_tx, video_rx) = mpsc::channel::<VideoFrame>(4);
        let (skip_tx, _skip_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let sync = Synchronizer::new(
            &config,
            still_idle(),
            session,
            audio_rx,
            video_rx,
            skip_tx,
            out_tx,
            CancellationToken::new(),
            cancel.clone(),
        );
        let handle = tokio::spawn(sync.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
