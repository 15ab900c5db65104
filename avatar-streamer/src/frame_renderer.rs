// 帧渲染器
//
// 按帧率将音频切分为带上下文的窗口，调用渲染模型产出视频帧。
// 渲染失败或超时时输出冻结帧，保证每个帧位都有画面。
// 预录片段播放期间不调用模型，按帧位往返取片段画面。

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use common::{pcm, FrameOrigin, Resolution, VideoFrame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio_source::AudioEvent;
use crate::clip::MediaClip;
use crate::collaborator::{call_with_timeout, AudioWindow, FrameSynthesizer};
use crate::config::{MediaConfig, PipelineConfig};
use crate::error::{CollaboratorError, PipelineError, Stage};
use crate::session::{PipelineMetrics, PipelineSession, PipelineSignal, StageHealth};
use crate::synchronizer::SkipRequest;

/// 按帧切分的音频滑动窗口
///
/// 所有位置均为内容时钟上的绝对采样点序号。
#[derive(Debug)]
pub struct FrameWindow {
    media: MediaConfig,
    samples: VecDeque<i16>,
    /// `samples[0]` 的绝对序号
    base: u64,
    received: u64,
    next_frame: u64,
    left: u64,
    right: u64,
}

impl FrameWindow {
    pub fn new(media: MediaConfig, left: u64, right: u64) -> Self {
        Self {
            media,
            samples: VecDeque::new(),
            base: 0,
            received: 0,
            next_frame: 0,
            left,
            right,
        }
    }

    pub fn push(&mut self, samples: &[i16]) {
        self.samples.extend(samples.iter().copied());
        self.received += samples.len() as u64;
    }

    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    fn frame_start(&self, index: u64) -> u64 {
        self.media.frame_start_sample(index)
    }

    /// 下一帧及其右侧上下文的音频都已到达
    pub fn ready(&self) -> bool {
        self.received >= self.frame_start(self.next_frame + 1) + self.right
    }

    /// 冲刷时下一帧是否还有音频
    pub fn flushable(&self) -> bool {
        self.frame_start(self.next_frame) < self.received
    }

    /// 取出下一帧的音频窗口，缺失部分以零填充
    pub fn take_window(&mut self, resolution: Resolution) -> AudioWindow {
        let index = self.next_frame;
        let start = self.frame_start(index);
        let end = self.frame_start(index + 1);
        let from = start.saturating_sub(self.left);
        let to = end + self.right;

        // 帧起点之前不足左上下文的部分补零
        let lead = (self.left - (start - from)) as usize;
        let mut window = vec![0i16; lead];
        window.extend((from..to).map(|pos| self.sample_at(pos)));

        self.advance();
        AudioWindow {
            frame_index: index,
            ts_us: self.media.frame_start_us(index),
            sample_rate: self.media.sample_rate,
            samples: window.into(),
            frame_offset: self.left as usize,
            frame_len: (end - start) as usize,
            resolution,
        }
    }

    /// 跳过下一帧
    pub fn skip_frame(&mut self) {
        self.advance();
    }

    fn sample_at(&self, pos: u64) -> i16 {
        if pos < self.base || pos >= self.received {
            return 0;
        }
        self.samples
            .get((pos - self.base) as usize)
            .copied()
            .unwrap_or(0)
    }

    fn advance(&mut self) {
        self.next_frame += 1;
        let keep_from = self
            .frame_start(self.next_frame)
            .saturating_sub(self.left)
            .min(self.received);
        while self.base < keep_from && self.samples.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// 正在播放的预录片段
struct ClipPlayback {
    utterance_id: u64,
    clip: Arc<MediaClip>,
    start_us: u64,
    /// 片段第一帧的帧序号
    first_frame: Option<u64>,
}

pub struct FrameRenderer {
    config: Arc<PipelineConfig>,
    renderer: Arc<dyn FrameSynthesizer>,
    session: Arc<PipelineSession>,
    input: mpsc::Receiver<AudioEvent>,
    skip_rx: mpsc::Receiver<SkipRequest>,
    output: mpsc::Sender<VideoFrame>,
    cancel: CancellationToken,
    window: FrameWindow,
    resolution: Resolution,
    idle_pixels: Bytes,
    last_valid: Option<Bytes>,
    clip: Option<ClipPlayback>,
    pending_skips: u64,
    resync_next: bool,
    failing_since: Option<Instant>,
}

impl FrameRenderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PipelineConfig>,
        renderer: Arc<dyn FrameSynthesizer>,
        session: Arc<PipelineSession>,
        input: mpsc::Receiver<AudioEvent>,
        skip_rx: mpsc::Receiver<SkipRequest>,
        output: mpsc::Sender<VideoFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let media = config.media.clone();
        let sample_rate = media.sample_rate;
        let left = pcm::us_to_samples(config.render.context_left.as_micros() as u64, sample_rate);
        let right = pcm::us_to_samples(config.render.context_right.as_micros() as u64, sample_rate);
        let resolution = media.resolution();
        let idle_pixels = renderer.idle_frame(resolution);

        Self {
            config,
            renderer,
            session,
            input,
            skip_rx,
            output,
            cancel,
            window: FrameWindow::new(media, left, right),
            resolution,
            idle_pixels,
            last_valid: None,
            clip: None,
            pending_skips: 0,
            resync_next: false,
            failing_since: None,
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        self.session
            .set_stage_health(Stage::FrameRenderer, StageHealth::Running);
        info!("🎨 Frame renderer started");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Frame renderer cancelled");
                    break;
                }
                event = self.input.recv() => event,
            };

            let keep_going = match event {
                Some(AudioEvent::Chunk(chunk)) => {
                    self.window.push(&pcm::decode_samples(&chunk.pcm));
                    self.render_ready(false).await?
                }
                Some(AudioEvent::ClipStarted {
                    utterance_id,
                    clip,
                    start_us,
                }) => {
                    debug!("Clip '{}' starts at {}us", clip.name, start_us);
                    self.clip = Some(ClipPlayback {
                        utterance_id,
                        clip,
                        start_us,
                        first_frame: None,
                    });
                    true
                }
                Some(AudioEvent::EndOfUtterance { utterance_id }) => {
                    debug!("Flushing frames for utterance {}", utterance_id);
                    let keep_going = self.render_ready(true).await?;
                    if self
                        .clip
                        .as_ref()
                        .is_some_and(|playback| playback.utterance_id == utterance_id)
                    {
                        debug!("Clip finished, back to model rendering");
                        self.clip = None;
                    }
                    keep_going
                }
                None => {
                    debug!("Audio input closed, flushing remaining frames");
                    self.render_ready(true).await?;
                    break;
                }
            };
            if !keep_going {
                break;
            }
        }

        self.session
            .set_stage_health(Stage::FrameRenderer, StageHealth::Stopped);
        info!(
            "✓ Frame renderer finished after {} frames",
            self.window.next_frame()
        );
        Ok(())
    }

    /// 渲染所有已就绪的帧，下游关闭或取消时返回 false
    async fn render_ready(&mut self, flush: bool) -> Result<bool, PipelineError> {
        loop {
            let available = if flush {
                self.window.flushable()
            } else {
                self.window.ready()
            };
            if !available {
                return Ok(true);
            }

            while let Ok(request) = self.skip_rx.try_recv() {
                debug!("Skip requested, drift={}us", request.drift_us);
                self.pending_skips += 1;
            }
            if self.pending_skips > 0 {
                self.pending_skips -= 1;
                self.window.skip_frame();
                self.resync_next = true;
                PipelineMetrics::incr(&self.session.metrics().frames_skipped);
                continue;
            }

            let window = self.window.take_window(self.resolution);
            let frame = match self.clip_frame(&window) {
                Some(frame) => Some(frame),
                None => self.render(window).await?,
            };
            let Some(frame) = frame else {
                return Ok(false);
            };

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = self.output.send(frame) => {
                    if sent.is_err() {
                        warn!("Video output closed, frame renderer stopping");
                    }
                    sent.is_ok()
                }
            };
            if !sent {
                return Ok(false);
            }
        }
    }

    /// 帧起点落在片段音频内时取片段画面
    fn clip_frame(&mut self, window: &AudioWindow) -> Option<VideoFrame> {
        let playback = self.clip.as_mut()?;
        if window.ts_us < playback.start_us {
            return None;
        }
        let first = *playback.first_frame.get_or_insert(window.frame_index);
        let pixels = playback
            .clip
            .frame_at(window.frame_index.saturating_sub(first))?
            .clone();

        PipelineMetrics::incr(&self.session.metrics().clip_frames);
        self.last_valid = Some(pixels.clone());
        Some(VideoFrame {
            pixels,
            resolution: self.resolution,
            ts_us: window.ts_us,
            duration_us: self.config.media.frame_duration_us(window.frame_index),
            origin: FrameOrigin::Clip,
            resynced: std::mem::take(&mut self.resync_next),
        })
    }

    /// 渲染单帧，失败时返回冻结帧；取消时返回 None
    async fn render(&mut self, window: AudioWindow) -> Result<Option<VideoFrame>, PipelineError> {
        let index = window.frame_index;
        let ts_us = window.ts_us;
        let duration_us = self.config.media.frame_duration_us(index);
        let started = Instant::now();

        let call = call_with_timeout(
            self.config.render.render_timeout,
            self.renderer.render_frame(&window),
        );
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            result = call => result,
        };

        let expected = self.resolution.frame_bytes();
        let result = result.and_then(|pixels| {
            if pixels.len() == expected {
                Ok(pixels)
            } else {
                Err(CollaboratorError::ModelError {
                    reason: format!("frame size {} != {}", pixels.len(), expected),
                })
            }
        });

        let resynced = std::mem::take(&mut self.resync_next);
        match result {
            Ok(pixels) => {
                if self.failing_since.take().is_some() {
                    info!("✓ Renderer recovered at frame {}", index);
                    self.session
                        .set_stage_health(Stage::FrameRenderer, StageHealth::Running);
                }
                PipelineMetrics::incr(&self.session.metrics().frames_rendered);
                self.last_valid = Some(pixels.clone());
                Ok(Some(VideoFrame {
                    pixels,
                    resolution: self.resolution,
                    ts_us,
                    duration_us,
                    origin: FrameOrigin::Rendered,
                    resynced,
                }))
            }
            Err(e) => {
                let since = *self.failing_since.get_or_insert(started);
                if since.elapsed() > self.config.session.long_stall_ceiling {
                    return Err(PipelineError::SessionFatal {
                        stage: Stage::FrameRenderer,
                        reason: format!("renderer failing for {:?}: {}", since.elapsed(), e),
                    });
                }

                warn!("Frame {} render failed, freezing: {}", index, e);
                PipelineMetrics::incr(&self.session.metrics().frames_frozen);
                self.session
                    .set_stage_health(Stage::FrameRenderer, StageHealth::Degraded);
                self.session.signal(PipelineSignal::RenderDegraded {
                    frame_ts_us: ts_us,
                    reason: e.to_string(),
                });

                let pixels = self
                    .last_valid
                    .clone()
                    .unwrap_or_else(|| self.idle_pixels.clone());
                Ok(Some(VideoFrame {
                    pixels,
                    resolution: self.resolution,
                    ts_us,
                    duration_us,
                    origin: FrameOrigin::Frozen,
                    resynced,
                }))
            }
        }
    }
}
