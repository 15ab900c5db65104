// 可脚本化的协作方桩实现
//
// 输出完全确定，耗时通过 tokio 定时器控制，配合暂停时间可以精确复现
// 停顿、失败、重连等场景。

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{pcm, MuxedSample};
use tokio::sync::Mutex;

use crate::collaborator::{
    AudioWindow, FrameSynthesizer, MediaSink, SpeechSynthesizer, SynthesizedAudio,
};
use crate::error::{CollaboratorError, SinkError};

/// TTS 脚本步骤
#[derive(Debug, Clone)]
pub enum TtsStep {
    /// 立即返回指定时长的语音
    Speak { duration: Duration },
    /// 延迟后返回语音
    SpeakAfter { delay: Duration, duration: Duration },
    /// 以其他采样率返回语音
    SpeakAt { sample_rate: u32, duration: Duration },
    /// 立即失败
    Fail,
    /// 延迟后失败
    FailAfter { delay: Duration },
    /// 永不返回，由调用方超时
    Hang,
}

/// 按脚本响应的 TTS
pub struct ScriptedTts {
    sample_rate: u32,
    script: Mutex<VecDeque<TtsStep>>,
    calls: AtomicU64,
}

impl ScriptedTts {
    /// 脚本耗尽后每个词返回 200ms 语音
    pub fn new(sample_rate: u32) -> Self {
        Self::with_script(sample_rate, Vec::new())
    }

    pub fn with_script(sample_rate: u32, steps: Vec<TtsStep>) -> Self {
        Self {
            sample_rate,
            script: Mutex::new(steps.into()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn speech(&self, sample_rate: u32, duration: Duration) -> SynthesizedAudio {
        let count = pcm::us_to_samples(duration.as_micros() as u64, sample_rate) as usize;
        let samples: Vec<i16> = (0..count).map(|i| ((i % 32) as i16 - 16) * 512).collect();
        SynthesizedAudio {
            pcm: pcm::encode_samples(&samples),
            sample_rate,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice_ref: &str,
    ) -> Result<SynthesizedAudio, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().await.pop_front();
        let words = text.split_whitespace().count().max(1) as u64;

        match step.unwrap_or(TtsStep::Speak {
            duration: Duration::from_millis(200 * words),
        }) {
            TtsStep::Speak { duration } => Ok(self.speech(self.sample_rate, duration)),
            TtsStep::SpeakAfter { delay, duration } => {
                tokio::time::sleep(delay).await;
                Ok(self.speech(self.sample_rate, duration))
            }
            TtsStep::SpeakAt {
                sample_rate,
                duration,
            } => Ok(self.speech(sample_rate, duration)),
            TtsStep::Fail => Err(CollaboratorError::Unavailable {
                reason: "scripted failure".to_string(),
            }),
            TtsStep::FailAfter { delay } => {
                tokio::time::sleep(delay).await;
                Err(CollaboratorError::Unavailable {
                    reason: "scripted failure".to_string(),
                })
            }
            TtsStep::Hang => {
                std::future::pending::<()>().await;
                Err(CollaboratorError::Unavailable {
                    reason: "unreachable".to_string(),
                })
            }
        }
    }
}

/// 按帧序号注入失败的渲染器
pub struct ScriptedRenderer {
    failing: HashSet<u64>,
    fail_all: bool,
    delay: Duration,
    calls: AtomicU64,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            fail_all: false,
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    /// 指定帧序号渲染失败
    pub fn failing_frames(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.failing.extend(frames);
        self
    }

    pub fn failing_always(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// 每次渲染耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// 第 `frame_index` 帧的画面
    pub fn pixels_for(frame_index: u64, frame_bytes: usize) -> Bytes {
        Bytes::from(vec![(frame_index % 251) as u8 + 1; frame_bytes])
    }
}

impl Default for ScriptedRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSynthesizer for ScriptedRenderer {
    async fn render_frame(&self, window: &AudioWindow) -> Result<Bytes, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_all || self.failing.contains(&window.frame_index) {
            return Err(CollaboratorError::ModelError {
                reason: format!("scripted failure at frame {}", window.frame_index),
            });
        }
        Ok(Self::pixels_for(
            window.frame_index,
            window.resolution.frame_bytes(),
        ))
    }
}

#[derive(Debug, Default)]
struct MockSinkState {
    /// 依次消费的建连结果，耗尽后总是成功
    connect_script: VecDeque<bool>,
    /// 发送到这些序号时断开一次
    fail_on_sequence: HashSet<u64>,
    /// 断开后所有发送都失败，直到重新建连
    connected: bool,
    send_delay: Duration,
    connect_attempts: u32,
    rejected: u32,
    delivered: Vec<MuxedSample>,
    closed: bool,
}

/// 记录投递结果的媒体服务器桩
pub struct MockSink {
    state: Arc<Mutex<MockSinkState>>,
}

/// 测试侧查看 `MockSink` 状态
#[derive(Clone)]
pub struct MockSinkHandle {
    state: Arc<Mutex<MockSinkState>>,
}

impl MockSink {
    pub fn new() -> (Self, MockSinkHandle) {
        let state = Arc::new(Mutex::new(MockSinkState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockSinkHandle { state },
        )
    }
}

impl MockSinkHandle {
    /// 追加建连结果脚本（false 表示拒绝）
    pub async fn script_connects(&self, results: impl IntoIterator<Item = bool>) {
        self.state.lock().await.connect_script.extend(results);
    }

    /// 发送到指定序号时连接断开
    pub async fn drop_connection_at(&self, sequence: u64) {
        self.state.lock().await.fail_on_sequence.insert(sequence);
    }

    pub async fn set_send_delay(&self, delay: Duration) {
        self.state.lock().await.send_delay = delay;
    }

    pub async fn delivered(&self) -> Vec<MuxedSample> {
        self.state.lock().await.delivered.clone()
    }

    pub async fn connect_attempts(&self) -> u32 {
        self.state.lock().await.connect_attempts
    }

    pub async fn rejected(&self) -> u32 {
        self.state.lock().await.rejected
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl MediaSink for MockSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.connect_attempts += 1;
        if state.connect_script.pop_front().unwrap_or(true) {
            state.connected = true;
            Ok(())
        } else {
            state.rejected += 1;
            Err(SinkError::Rejected {
                reason: "scripted rejection".to_string(),
            })
        }
    }

    async fn send(&mut self, sample: &MuxedSample) -> Result<(), SinkError> {
        let delay = self.state.lock().await.send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(SinkError::NotConnected);
        }
        if state.fail_on_sequence.remove(&sample.sequence) {
            state.connected = false;
            return Err(SinkError::ConnectionLost {
                reason: "scripted disconnect".to_string(),
            });
        }
        state.delivered.push(sample.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.closed = true;
        Ok(())
    }
}
