// 数字人推流管线 - 错误类型定义
//
// 本模块定义了管线各阶段可能出现的错误，以及投递失败时的重连退避策略。
// 可恢复的错误以信号形式广播并计数，只有重试耗尽或时间轴不变量被破坏
// 才会导致会话终止。

use std::io;
use std::time::Duration;

use common::{MediaError, MediaKind};
use serde::Serialize;
use thiserror::Error;

/// 管线阶段
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AudioSource,
    FrameRenderer,
    Synchronizer,
    OutputPusher,
}

impl Stage {
    /// 按生产顺序排列，取消时依此顺序逐级退出
    pub const PRODUCTION_ORDER: [Stage; 4] = [
        Stage::AudioSource,
        Stage::FrameRenderer,
        Stage::Synchronizer,
        Stage::OutputPusher,
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::AudioSource => 0,
            Stage::FrameRenderer => 1,
            Stage::Synchronizer => 2,
            Stage::OutputPusher => 3,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::AudioSource => "audio-source",
            Stage::FrameRenderer => "frame-renderer",
            Stage::Synchronizer => "synchronizer",
            Stage::OutputPusher => "output-pusher",
        };
        f.write_str(name)
    }
}

/// 外部协作方（TTS、渲染模型）调用错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Call timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Model error: {reason}")]
    ModelError { reason: String },
}

/// 媒体服务器连接错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Connection rejected: {reason}")]
    Rejected { reason: String },

    #[error("Sink not connected")]
    NotConnected,

    #[error("Send timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl SinkError {
    /// 重新建连后是否值得重发
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::Encode(_))
    }
}

impl From<io::Error> for SinkError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => SinkError::Rejected {
                reason: error.to_string(),
            },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SinkError::ConnectionLost {
                reason: error.to_string(),
            },
            io::ErrorKind::TimedOut => SinkError::Timeout {
                after: Duration::ZERO,
            },
            _ => SinkError::Io(error.to_string()),
        }
    }
}

impl From<MediaError> for SinkError {
    fn from(error: MediaError) -> Self {
        match error {
            MediaError::IoError(e) => e.into(),
            other => SinkError::Encode(other.to_string()),
        }
    }
}

/// 管线错误
///
/// 可恢复的降级（TTS 不可用、冻结帧、缓冲丢弃）只以 `PipelineSignal` 广播并计数，
/// 不会作为错误返回。
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    // ========== 投递错误 ==========
    /// 重连次数耗尽
    #[error("Delivery failed after {attempts} reconnect attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    // ========== 致命错误 ==========
    #[error("Session fatal in {stage}: {reason}")]
    SessionFatal { stage: Stage, reason: String },

    /// 同一媒体类型的时间戳重叠或倒退
    #[error("Timeline violation on {kind:?}: pts {pts_us}us before previous end {last_end_us}us")]
    TimelineViolation {
        kind: MediaKind,
        pts_us: u64,
        last_end_us: u64,
    },

    /// 墙钟倒退
    #[error("Clock went backwards: {now_us}us < {last_us}us")]
    ClockRegressed { now_us: u64, last_us: u64 },

    // ========== 其他错误 ==========
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown clip: {name}")]
    UnknownClip { name: String },

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// 是否为投递类致命错误（与上游失败区分退出码）
    pub fn is_delivery(&self) -> bool {
        matches!(self, PipelineError::DeliveryFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// 错误恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// 立即重试
    Immediate,
    /// 指数退避
    ExponentialBackoff,
    /// 线性退避
    LinearBackoff,
}

/// 重连策略配置
#[derive(Debug, Clone)]
pub struct ErrorRecoveryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试策略
    pub retry_strategy: RetryStrategy,
    /// 基础退避时间
    pub backoff_base: Duration,
    /// 最大退避时间
    pub backoff_max: Duration,
    /// 抖动系数（0.0 - 1.0）
    pub jitter_factor: f64,
}

impl Default for ErrorRecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl ErrorRecoveryPolicy {
    /// 计算重试延迟（`attempt` 从 0 开始）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self.retry_strategy {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::LinearBackoff => self.backoff_base.saturating_mul(attempt + 1),
            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2u32.saturating_pow(attempt.min(31));
                self.backoff_base.saturating_mul(multiplier)
            }
        }
        .min(self.backoff_max);

        if self.jitter_factor > 0.0 && !delay.is_zero() {
            let jitter = delay.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
            delay + Duration::from_secs_f64(jitter)
        } else {
            delay
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
