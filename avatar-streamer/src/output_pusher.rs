// 推流器
//
// 管理任务持有按媒体时长计量的输出缓冲，投递任务独占媒体服务器连接。
// 两者之间只有容量为 1 的通道，连接中断时缓冲继续吸收上游输出；
// 缓冲持续满载超过 `max_block` 后优先丢弃最旧的视频帧。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::{MediaKind, MuxedSample};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborator::MediaSink;
use crate::config::PipelineConfig;
use crate::error::{ErrorRecoveryPolicy, PipelineError, SinkError, Stage};
use crate::session::{PipelineMetrics, PipelineSession, PipelineSignal, StageHealth};

/// 输出缓冲
#[derive(Debug)]
pub struct OutputBuffer {
    samples: VecDeque<MuxedSample>,
    buffered_us: u64,
    capacity_us: u64,
    /// 丢弃后保留的上限
    evict_to_us: u64,
}

impl OutputBuffer {
    pub fn new(capacity: Duration, max_block: Duration) -> Self {
        let capacity_us = capacity.as_micros() as u64;
        Self {
            samples: VecDeque::new(),
            buffered_us: 0,
            capacity_us,
            evict_to_us: capacity_us.saturating_sub(max_block.as_micros() as u64),
        }
    }

    pub fn push(&mut self, sample: MuxedSample) {
        self.buffered_us += sample.duration_us();
        self.samples.push_back(sample);
    }

    pub fn pop(&mut self) -> Option<MuxedSample> {
        let sample = self.samples.pop_front()?;
        self.buffered_us = self.buffered_us.saturating_sub(sample.duration_us());
        Some(sample)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffered_us >= self.capacity_us
    }

    pub fn buffered_us(&self) -> u64 {
        self.buffered_us
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// 丢弃最旧的样本直到降回阈值，先视频后音频，返回 (视频, 音频) 丢弃数
    pub fn evict(&mut self) -> (u64, u64) {
        let video = self.evict_kind(MediaKind::Video);
        let audio = self.evict_kind(MediaKind::Audio);
        (video, audio)
    }

    fn evict_kind(&mut self, kind: MediaKind) -> u64 {
        let mut dropped = 0;
        while self.buffered_us > self.evict_to_us {
            let Some(pos) = self.samples.iter().position(|s| s.kind() == kind) else {
                break;
            };
            if let Some(sample) = self.samples.remove(pos) {
                self.buffered_us = self.buffered_us.saturating_sub(sample.duration_us());
                dropped += 1;
            }
        }
        dropped
    }
}

pub struct OutputPusher {
    config: Arc<PipelineConfig>,
    sink: Box<dyn MediaSink>,
    session: Arc<PipelineSession>,
    input: mpsc::Receiver<MuxedSample>,
    cancel: CancellationToken,
}

impl OutputPusher {
    pub fn new(
        config: Arc<PipelineConfig>,
        sink: Box<dyn MediaSink>,
        session: Arc<PipelineSession>,
        input: mpsc::Receiver<MuxedSample>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sink,
            session,
            input,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        let OutputPusher {
            config,
            sink,
            session,
            mut input,
            cancel,
        } = self;

        let max_block = config.output.max_block;
        let mut buffer = OutputBuffer::new(config.output.buffer, max_block);
        let (deliver_tx, deliver_rx) = mpsc::channel::<MuxedSample>(1);
        let delivery = Delivery {
            sink,
            policy: config.recovery_policy(),
            send_timeout: config.output.send_timeout,
            connect_timeout: config.output.connect_timeout,
            session: session.clone(),
            cancel: cancel.clone(),
        };
        let mut delivery_handle: JoinHandle<Result<(), PipelineError>> =
            tokio::spawn(delivery.run(deliver_rx));

        session.set_stage_health(Stage::OutputPusher, StageHealth::Running);
        info!("📡 Output pusher started");

        let mut input_open = true;
        let mut cancelled = false;
        let mut full_since: Option<Instant> = None;

        while input_open || !buffer.is_empty() {
            let block_deadline = full_since.map(|since| since + max_block);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Output pusher cancelled with {} samples buffered", buffer.len());
                    cancelled = true;
                    break;
                }
                joined = &mut delivery_handle => {
                    return Err(delivery_exit(&session, joined));
                }
                permit = deliver_tx.reserve(), if !buffer.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(sample) = buffer.pop() {
                                permit.send(sample);
                            }
                        }
                        Err(_) => {
                            let joined = (&mut delivery_handle).await;
                            return Err(delivery_exit(&session, joined));
                        }
                    }
                }
                sample = input.recv(), if input_open && !buffer.is_full() => {
                    match sample {
                        Some(sample) => buffer.push(sample),
                        None => {
                            debug!("Synchronizer output closed, flushing {} samples", buffer.len());
                            input_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep_until(block_deadline.unwrap_or_else(Instant::now)),
                    if block_deadline.is_some() =>
                {
                    let (video, audio) = buffer.evict();
                    warn!(
                        "Output buffer full for {:?}, dropped {} video and {} audio samples",
                        max_block, video, audio
                    );
                    let metrics = session.metrics();
                    PipelineMetrics::add(&metrics.video_dropped, video);
                    PipelineMetrics::add(&metrics.audio_dropped, audio);
                    session.signal(PipelineSignal::SamplesDropped { video, audio });
                }
            }

            if buffer.is_full() {
                full_since.get_or_insert_with(Instant::now);
            } else {
                full_since = None;
            }
        }

        drop(deliver_tx);
        if cancelled {
            let _ = delivery_handle.await;
            session.set_stage_health(Stage::OutputPusher, StageHealth::Stopped);
            return Ok(());
        }

        let result = match delivery_handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::SessionFatal {
                stage: Stage::OutputPusher,
                reason: format!("delivery task panicked: {}", e),
            }),
        };
        let health = if result.is_ok() {
            StageHealth::Stopped
        } else {
            StageHealth::Failed
        };
        session.set_stage_health(Stage::OutputPusher, health);
        if result.is_ok() {
            info!("✓ Output pusher flushed and closed");
        }
        result
    }
}

/// 投递任务提前结束时的错误
fn delivery_exit(
    session: &PipelineSession,
    joined: Result<Result<(), PipelineError>, tokio::task::JoinError>,
) -> PipelineError {
    session.set_stage_health(Stage::OutputPusher, StageHealth::Failed);
    match joined {
        Ok(Err(e)) => e,
        Ok(Ok(())) => PipelineError::DeliveryFailed {
            attempts: 0,
            reason: "delivery stopped unexpectedly".to_string(),
        },
        Err(e) => PipelineError::SessionFatal {
            stage: Stage::OutputPusher,
            reason: format!("delivery task panicked: {}", e),
        },
    }
}

/// 投递任务，独占媒体服务器连接
struct Delivery {
    sink: Box<dyn MediaSink>,
    policy: ErrorRecoveryPolicy,
    send_timeout: Duration,
    connect_timeout: Duration,
    session: Arc<PipelineSession>,
    cancel: CancellationToken,
}

impl Delivery {
    async fn run(mut self, mut rx: mpsc::Receiver<MuxedSample>) -> Result<(), PipelineError> {
        let result = self.serve(&mut rx).await;
        if let Err(e) = self.sink.close().await {
            debug!("Sink close failed: {}", e);
        }
        if let Err(e) = &result {
            error!("❌ Delivery failed: {}", e);
        }
        result
    }

    async fn serve(&mut self, rx: &mut mpsc::Receiver<MuxedSample>) -> Result<(), PipelineError> {
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(self.connect_timeout, self.sink.connect()) => result,
        };
        match connected {
            Ok(Ok(())) => info!("✓ Connected to media server"),
            Ok(Err(e)) => {
                warn!("Initial connect failed: {}", e);
                if !self.reconnect(e).await? {
                    return Ok(());
                }
            }
            Err(_) => {
                let e = SinkError::Timeout {
                    after: self.connect_timeout,
                };
                warn!("Initial connect failed: {}", e);
                if !self.reconnect(e).await? {
                    return Ok(());
                }
            }
        }

        loop {
            let sample = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                sample = rx.recv() => match sample {
                    Some(sample) => sample,
                    None => return Ok(()),
                },
            };
            if !self.deliver(&sample).await? {
                return Ok(());
            }
        }
    }

    /// 发送单个样本，失败时重连并重发；取消时返回 false
    async fn deliver(&mut self, sample: &MuxedSample) -> Result<bool, PipelineError> {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                result = tokio::time::timeout(self.send_timeout, self.sink.send(sample)) => result,
            };
            let error = match result {
                Ok(Ok(())) => {
                    let metrics = self.session.metrics();
                    PipelineMetrics::incr(&metrics.samples_delivered);
                    PipelineMetrics::add(&metrics.bytes_delivered, sample.payload_len() as u64);
                    return Ok(true);
                }
                Ok(Err(e)) => e,
                Err(_) => SinkError::Timeout {
                    after: self.send_timeout,
                },
            };

            if !error.is_retryable() {
                return Err(PipelineError::DeliveryFailed {
                    attempts: 0,
                    reason: error.to_string(),
                });
            }

            warn!(
                "Delivery of sample #{} interrupted: {}",
                sample.sequence, error
            );
            self.session
                .set_stage_health(Stage::OutputPusher, StageHealth::Degraded);
            self.session.signal(PipelineSignal::DeliveryInterrupted {
                reason: error.to_string(),
            });
            if !self.reconnect(error).await? {
                return Ok(false);
            }
        }
    }

    /// 按退避策略重连，次数耗尽后返回 `DeliveryFailed`；取消时返回 false
    async fn reconnect(&mut self, cause: SinkError) -> Result<bool, PipelineError> {
        let mut reason = cause.to_string();
        let mut attempt = 0;

        while self.policy.should_retry(attempt) {
            let delay = self.policy.calculate_delay(attempt);
            attempt += 1;
            debug!("Reconnect attempt {} in {:?}", attempt, delay);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                result = tokio::time::timeout(self.connect_timeout, self.sink.connect()) => result,
            };

            match result {
                Ok(Ok(())) => {
                    info!("✓ Reconnected after {} attempts", attempt);
                    PipelineMetrics::incr(&self.session.metrics().reconnects);
                    self.session
                        .set_stage_health(Stage::OutputPusher, StageHealth::Running);
                    self.session
                        .signal(PipelineSignal::Reconnected { attempts: attempt });
                    return Ok(true);
                }
                Ok(Err(e)) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    reason = e.to_string();
                }
                Err(_) => {
                    warn!("Reconnect attempt {} timed out", attempt);
                    reason = format!("connect timed out after {:?}", self.connect_timeout);
                }
            }
        }

        Err(PipelineError::DeliveryFailed {
            attempts: attempt,
            reason,
        })
    }
}
