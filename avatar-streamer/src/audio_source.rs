// 音频源
//
// 逐条调用 TTS 合成文本，切分为定长音频块并按内容时钟打时间戳。
// 预录片段与文本共用同一队列，跳过 TTS 直接播放片段音频。
// 每个音频块先送往渲染器再送往同步器，保证渲染器拿到的音频不少于同步器。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use common::{pcm, AudioChunk, AudioOrigin};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clip::MediaClip;
use crate::collaborator::{call_with_timeout, SpeechSynthesizer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Stage};
use crate::session::{PipelineMetrics, PipelineSession, PipelineSignal, StageHealth};

/// 待播内容
#[derive(Debug, Clone, PartialEq)]
pub enum Speech {
    Text(String),
    Clip(Arc<MediaClip>),
}

impl fmt::Display for Speech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speech::Text(text) => write!(f, "{:?}", text),
            Speech::Clip(clip) => write!(f, "clip '{}'", clip.name),
        }
    }
}

/// 排队待播的一段内容
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub speech: Speech,
    /// 提交时的打断纪元，早于当前纪元的内容被丢弃
    pub epoch: u64,
}

/// 送往渲染器的音频事件
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Chunk(AudioChunk),
    /// 片段开始，内容时间 `start_us` 起的帧取自片段画面
    ClipStarted {
        utterance_id: u64,
        clip: Arc<MediaClip>,
        start_us: u64,
    },
    /// 一段语音结束，渲染器应冲刷剩余帧
    EndOfUtterance { utterance_id: u64 },
}

/// 文本输入句柄
#[derive(Clone)]
pub struct TextInput {
    tx: mpsc::Sender<Utterance>,
    session: Arc<PipelineSession>,
}

impl TextInput {
    pub fn new(tx: mpsc::Sender<Utterance>, session: Arc<PipelineSession>) -> Self {
        Self { tx, session }
    }

    /// 提交一段文本，队列满时等待
    pub async fn submit(&self, text: impl Into<String>) -> Result<(), PipelineError> {
        self.enqueue(Speech::Text(text.into())).await
    }

    /// 提交一段预录片段，排在已提交的文本之后播放
    pub async fn submit_clip(&self, clip: Arc<MediaClip>) -> Result<(), PipelineError> {
        self.enqueue(Speech::Clip(clip)).await
    }

    async fn enqueue(&self, speech: Speech) -> Result<(), PipelineError> {
        if self.session.is_shutting_down() {
            return Err(PipelineError::ShuttingDown);
        }
        let utterance = Utterance {
            speech,
            epoch: self.session.interrupt_epoch(),
        };
        self.tx
            .send(utterance)
            .await
            .map_err(|_| PipelineError::ShuttingDown)
    }
}

enum Synthesis {
    Audio(Vec<i16>, AudioOrigin),
    Cancelled,
}

pub struct AudioSource {
    config: Arc<PipelineConfig>,
    tts: Arc<dyn SpeechSynthesizer>,
    session: Arc<PipelineSession>,
    text_rx: mpsc::Receiver<Utterance>,
    render_tx: mpsc::Sender<AudioEvent>,
    sync_tx: mpsc::Sender<AudioChunk>,
    cancel: CancellationToken,
    next_utterance_id: u64,
    /// 已产出的采样点总数，即内容时钟
    content_samples: u64,
    failing_since: Option<Instant>,
}

impl AudioSource {
    pub fn new(
        config: Arc<PipelineConfig>,
        tts: Arc<dyn SpeechSynthesizer>,
        session: Arc<PipelineSession>,
        text_rx: mpsc::Receiver<Utterance>,
        render_tx: mpsc::Sender<AudioEvent>,
        sync_tx: mpsc::Sender<AudioChunk>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            tts,
            session,
            text_rx,
            render_tx,
            sync_tx,
            cancel,
            next_utterance_id: 1,
            content_samples: 0,
            failing_since: None,
        }
    }

    pub async fn run(mut self) -> Result<(), PipelineError> {
        self.session
            .set_stage_health(Stage::AudioSource, StageHealth::Running);
        info!("🎙️ Audio source started");

        let mut input_closed = false;
        loop {
            let utterance = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Audio source cancelled");
                    break;
                }
                _ = self.session.shutdown_requested(), if !input_closed => {
                    // 已排队的文本仍会合成
                    debug!("Shutdown requested, closing text input");
                    self.text_rx.close();
                    input_closed = true;
                    continue;
                }
                next = self.text_rx.recv() => match next {
                    Some(utterance) => utterance,
                    None => {
                        debug!("Text input closed");
                        break;
                    }
                },
            };

            if utterance.epoch < self.session.interrupt_epoch() {
                debug!("Discarding interrupted utterance: {}", utterance.speech);
                continue;
            }
            if let Speech::Text(text) = &utterance.speech {
                if text.trim().is_empty() {
                    continue;
                }
            }

            let utterance_id = self.next_utterance_id;
            self.next_utterance_id += 1;

            let (samples, origin, clip) = match &utterance.speech {
                Speech::Text(text) => match self.synthesize(utterance_id, text.trim()).await? {
                    Synthesis::Audio(samples, origin) => (samples, origin, None),
                    Synthesis::Cancelled => break,
                },
                Speech::Clip(clip) => {
                    info!("▶️ Playing clip '{}' as utterance {}", clip.name, utterance_id);
                    PipelineMetrics::incr(&self.session.metrics().clips_played);
                    let samples = self.to_pipeline_rate(utterance_id, &clip.pcm, clip.sample_rate);
                    (samples, AudioOrigin::Clip, Some(clip.clone()))
                }
            };

            if utterance.epoch < self.session.interrupt_epoch() {
                debug!("Utterance {} interrupted during synthesis", utterance_id);
                continue;
            }

            if !self
                .emit_utterance(utterance_id, &samples, origin, utterance.epoch, clip)
                .await
            {
                break;
            }
        }

        self.session
            .set_stage_health(Stage::AudioSource, StageHealth::Stopped);
        info!(
            "✓ Audio source finished at content position {}us",
            pcm::samples_to_us(self.content_samples, self.config.media.sample_rate)
        );
        Ok(())
    }

    /// 调用 TTS，失败或超时时以静音兜底
    async fn synthesize(
        &mut self,
        utterance_id: u64,
        text: &str,
    ) -> Result<Synthesis, PipelineError> {
        let sample_rate = self.config.media.sample_rate;
        let started = Instant::now();
        let call = call_with_timeout(
            self.config.tts.synth_timeout,
            self.tts.synthesize(text, &self.config.tts.voice_ref),
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Synthesis::Cancelled),
            result = call => result,
        };

        match result {
            Ok(audio) => {
                if self.failing_since.take().is_some() {
                    info!("✓ TTS backend recovered");
                    self.session
                        .set_stage_health(Stage::AudioSource, StageHealth::Running);
                }
                PipelineMetrics::incr(&self.session.metrics().utterances_synthesized);

                let samples = self.to_pipeline_rate(utterance_id, &audio.pcm, audio.sample_rate);
                debug!(
                    "Utterance {} synthesized: {} samples",
                    utterance_id,
                    samples.len()
                );
                Ok(Synthesis::Audio(samples, AudioOrigin::Speech))
            }
            Err(e) => {
                warn!("TTS failed for utterance {}: {}", utterance_id, e);
                PipelineMetrics::incr(&self.session.metrics().tts_failures);
                self.session
                    .set_stage_health(Stage::AudioSource, StageHealth::Degraded);
                self.session.signal(PipelineSignal::TtsUnavailable {
                    utterance_id,
                    reason: e.to_string(),
                });

                let since = *self.failing_since.get_or_insert(started);
                if since.elapsed() > self.config.session.long_stall_ceiling {
                    return Err(PipelineError::SessionFatal {
                        stage: Stage::AudioSource,
                        reason: format!(
                            "TTS unavailable for {:?}: {}",
                            since.elapsed(),
                            e
                        ),
                    });
                }

                let fallback = pcm::us_to_samples(
                    self.config.tts.fallback_silence.as_micros() as u64,
                    sample_rate,
                ) as usize;
                Ok(Synthesis::Audio(vec![0; fallback], AudioOrigin::Silence))
            }
        }
    }

    /// 解码并重采样到管线采样率
    fn to_pipeline_rate(&self, utterance_id: u64, audio: &Bytes, from_rate: u32) -> Vec<i16> {
        let sample_rate = self.config.media.sample_rate;
        let decoded = pcm::decode_samples(audio);
        if from_rate != sample_rate && from_rate > 0 {
            debug!(
                "Resampling utterance {} from {}Hz to {}Hz",
                utterance_id, from_rate, sample_rate
            );
            pcm::resample_linear(&decoded, from_rate, sample_rate)
        } else {
            decoded
        }
    }

    /// 切分并发送一段语音，下游关闭或取消时返回 false
    async fn emit_utterance(
        &mut self,
        utterance_id: u64,
        samples: &[i16],
        origin: AudioOrigin,
        epoch: u64,
        clip: Option<Arc<MediaClip>>,
    ) -> bool {
        let sample_rate = self.config.media.sample_rate;
        let chunk_samples = self.config.media.chunk_samples();

        if let Some(clip) = clip {
            let event = AudioEvent::ClipStarted {
                utterance_id,
                clip,
                start_us: pcm::samples_to_us(self.content_samples, sample_rate),
            };
            if !self.send_render(event).await {
                return false;
            }
        }

        for piece in samples.chunks(chunk_samples) {
            if epoch < self.session.interrupt_epoch() {
                debug!("Utterance {} interrupted, abandoning remaining audio", utterance_id);
                break;
            }

            // 最后一块不足时补零
            let mut padded;
            let piece = if piece.len() < chunk_samples {
                padded = piece.to_vec();
                padded.resize(chunk_samples, 0);
                padded.as_slice()
            } else {
                piece
            };

            let chunk = AudioChunk {
                utterance_id,
                pcm: pcm::encode_samples(piece),
                sample_rate,
                ts_us: pcm::samples_to_us(self.content_samples, sample_rate),
                duration_us: pcm::samples_to_us(chunk_samples as u64, sample_rate),
                origin,
            };
            self.content_samples += chunk_samples as u64;
            PipelineMetrics::incr(&self.session.metrics().audio_chunks_produced);

            if !self.send_render(AudioEvent::Chunk(chunk.clone())).await {
                return false;
            }
            let delivered = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = self.sync_tx.send(chunk) => sent.is_ok(),
            };
            if !delivered {
                return false;
            }
        }

        self.send_render(AudioEvent::EndOfUtterance { utterance_id })
            .await
    }

    async fn send_render(&self, event: AudioEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.render_tx.send(event) => {
                if sent.is_err() {
                    warn!("Renderer input closed, audio source stopping");
                }
                sent.is_ok()
            }
        }
    }
}
