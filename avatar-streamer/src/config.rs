use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorRecoveryPolicy, PipelineError, RetryStrategy};

/// 管线配置
///
/// 会话期间保持不变，不支持中途重新协商。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// 媒体格式
    pub media: MediaConfig,

    /// 同步器参数
    pub sync: SyncConfig,

    /// 渲染参数
    pub render: RenderConfig,

    /// TTS 参数
    pub tts: TtsConfig,

    /// 推流参数
    pub output: OutputConfig,

    /// 会话级参数
    pub session: SessionConfig,

    /// 日志配置
    pub logging: LoggingConfig,

    /// 可按名称插播的预录片段
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clips: Vec<ClipConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// 目标帧率
    pub frame_rate: u32,

    /// 管线统一采样率
    pub sample_rate: u32,

    /// 音频块时长
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub audio_chunk: Duration,

    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// 首次输出前缓冲的音频时长
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub jitter_buffer: Duration,

    /// 源停顿超过该时长后插入填充样本
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub stall_tolerance: Duration,

    /// 音视频漂移纠正阈值
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub drift_threshold: Duration,

    /// 阶段间队列容量（按媒体时长计）
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub queue_capacity: Duration,

    /// 视频停顿时填充帧的画面
    pub filler_video: FillerVideo,
}

/// 视频填充帧画面
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillerVideo {
    /// 保持停顿前最后一帧
    Hold,
    /// 音频同时停顿时播放待机片段
    IdleClip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// 每帧音频窗口左侧上下文
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub context_left: Duration,

    /// 每帧音频窗口右侧上下文
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub context_right: Duration,

    /// 单帧渲染超时，超时后使用冻结帧
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub render_timeout: Duration,

    /// 待机片段目录，未设置时使用渲染器自带的待机画面
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_clip_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    /// 音色标识
    pub voice_ref: String,

    /// 单次合成超时
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub synth_timeout: Duration,

    /// TTS 失败时替代的静音时长
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub fallback_silence: Duration,

    /// 待合成文本队列上限
    pub max_pending_utterances: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// 媒体服务器地址
    pub address: String,

    /// 输出缓冲容量（按媒体时长计）
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub buffer: Duration,

    /// 缓冲满时阻塞上游的最长时间
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub max_block: Duration,

    /// 单个样本发送超时
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub send_timeout: Duration,

    /// 建连超时
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub connect_timeout: Duration,

    /// 最大重连次数
    pub max_reconnect_attempts: u32,

    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub backoff_base: Duration,

    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub backoff_max: Duration,

    /// 退避抖动系数
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// TTS/渲染持续失败超过该时长视为上游致命错误
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub long_stall_ceiling: Duration,

    /// 统计日志输出间隔
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub stats_interval: Duration,
}

/// 预录片段
///
/// 画面目录下为按数字命名的 `.rgb` 文件（如 `0.rgb`、`1.rgb`），每个文件是一帧
/// 原始 RGB24 像素；音频为 16 位小端单声道 PCM。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClipConfig {
    pub name: String,
    pub frames_dir: PathBuf,
    pub audio_path: PathBuf,
    #[serde(default = "default_clip_sample_rate")]
    pub sample_rate: u32,
}

fn default_clip_sample_rate() -> u32 {
    16_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 未设置时生效）
    pub level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            media: MediaConfig::default(),
            sync: SyncConfig::default(),
            render: RenderConfig::default(),
            tts: TtsConfig::default(),
            output: OutputConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
            clips: Vec::new(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            frame_rate: 25,
            sample_rate: 16_000,
            audio_chunk: Duration::from_millis(20),
            width: 256,
            height: 256,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            jitter_buffer: Duration::from_millis(100),
            stall_tolerance: Duration::from_millis(200),
            drift_threshold: Duration::from_millis(40),
            queue_capacity: Duration::from_millis(300),
            filler_video: FillerVideo::Hold,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            context_left: Duration::from_millis(80),
            context_right: Duration::from_millis(80),
            render_timeout: Duration::from_millis(200),
            idle_clip_dir: None,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_ref: "default".to_string(),
            synth_timeout: Duration::from_secs(5),
            fallback_silence: Duration::from_millis(500),
            max_pending_utterances: 64,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7443".to_string(),
            buffer: Duration::from_millis(1500),
            max_block: Duration::from_millis(200),
            send_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            long_stall_ceiling: Duration::from_secs(30),
            stats_interval: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MediaConfig {
    pub fn audio_chunk_us(&self) -> u64 {
        self.audio_chunk.as_micros() as u64
    }

    /// 每个音频块的采样点数
    pub fn chunk_samples(&self) -> usize {
        (self.audio_chunk_us() * self.sample_rate as u64 / 1_000_000) as usize
    }

    /// 第 `index` 帧的起始时间（微秒），按整数运算避免非整数帧间隔的累积误差
    pub fn frame_start_us(&self, index: u64) -> u64 {
        index * 1_000_000 / self.frame_rate as u64
    }

    /// 第 `index` 帧的时长
    pub fn frame_duration_us(&self, index: u64) -> u64 {
        self.frame_start_us(index + 1) - self.frame_start_us(index)
    }

    /// 第 `index` 帧的起始采样点
    pub fn frame_start_sample(&self, index: u64) -> u64 {
        index * self.sample_rate as u64 / self.frame_rate as u64
    }

    /// 名义帧间隔（向上取整）
    pub fn nominal_frame_us(&self) -> u64 {
        (1_000_000 + self.frame_rate as u64 - 1) / self.frame_rate as u64
    }

    pub fn resolution(&self) -> common::Resolution {
        common::Resolution::new(self.width, self.height)
    }
}

impl SyncConfig {
    pub fn stall_tolerance_us(&self) -> u64 {
        self.stall_tolerance.as_micros() as u64
    }

    pub fn drift_threshold_us(&self) -> u64 {
        self.drift_threshold.as_micros() as u64
    }

    pub fn jitter_buffer_us(&self) -> u64 {
        self.jitter_buffer.as_micros() as u64
    }
}

impl PipelineConfig {
    /// 音频队列容量（块数）
    pub fn audio_queue_capacity(&self) -> usize {
        let chunk_us = self.media.audio_chunk_us().max(1);
        ((self.sync.queue_capacity.as_micros() as u64).div_ceil(chunk_us)).max(1) as usize
    }

    /// 视频队列容量（帧数）
    pub fn video_queue_capacity(&self) -> usize {
        let frame_us = self.media.nominal_frame_us().max(1);
        ((self.sync.queue_capacity.as_micros() as u64).div_ceil(frame_us)).max(1) as usize
    }

    /// 推流重连策略
    pub fn recovery_policy(&self) -> ErrorRecoveryPolicy {
        ErrorRecoveryPolicy {
            max_retries: self.output.max_reconnect_attempts,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            backoff_base: self.output.backoff_base,
            backoff_max: self.output.backoff_max,
            jitter_factor: self.output.jitter_factor,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), PipelineError> {
        let media = &self.media;
        if media.frame_rate == 0 || media.frame_rate > 120 {
            return Err(config_error("Frame rate must be between 1 and 120"));
        }

        if media.sample_rate == 0 {
            return Err(config_error("Sample rate must be greater than 0"));
        }

        if media.width == 0 || media.height == 0 {
            return Err(config_error("Resolution must be non-zero"));
        }

        if media.audio_chunk.is_zero() {
            return Err(config_error("Audio chunk duration must be greater than 0"));
        }

        // 每块采样点数必须为整数，时间戳才能与采样点严格对应
        if (media.audio_chunk_us() * media.sample_rate as u64) % 1_000_000 != 0 {
            return Err(config_error(
                "Audio chunk duration must cover a whole number of samples",
            ));
        }

        if self.sync.stall_tolerance.is_zero() {
            return Err(config_error("Stall tolerance must be greater than 0"));
        }

        // 阈值小于半帧时，一次跳帧就会越过反向阈值，纠偏来回振荡
        if self.sync.drift_threshold_us() * 2 < media.nominal_frame_us() {
            return Err(config_error(
                "Drift threshold must be at least half a frame interval",
            ));
        }

        if self.sync.queue_capacity < media.audio_chunk {
            return Err(config_error("Queue capacity must hold at least one audio chunk"));
        }

        if self.output.buffer.as_micros() < media.nominal_frame_us() as u128 {
            return Err(config_error("Output buffer must hold at least one frame"));
        }

        if self.output.send_timeout.is_zero() || self.output.connect_timeout.is_zero() {
            return Err(config_error("Network timeouts must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.output.jitter_factor) {
            return Err(config_error("Jitter factor must be between 0 and 1"));
        }

        if self.render.render_timeout.is_zero() || self.tts.synth_timeout.is_zero() {
            return Err(config_error("Collaborator timeouts must be greater than 0"));
        }

        if self.tts.max_pending_utterances == 0 {
            return Err(config_error("Pending utterance limit must be greater than 0"));
        }

        if self.session.stats_interval.is_zero() {
            return Err(config_error("Stats interval must be greater than 0"));
        }

        let mut names = std::collections::HashSet::new();
        for clip in &self.clips {
            if clip.name.trim().is_empty() || clip.sample_rate == 0 {
                return Err(config_error("Clips need a name and a sample rate"));
            }
            if !names.insert(clip.name.as_str()) {
                return Err(PipelineError::Config {
                    message: format!("Duplicate clip name: {}", clip.name),
                });
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> PipelineError {
    PipelineError::Config {
        message: message.to_string(),
    }
}

/// 配置文件管理
pub struct ConfigManager {
    config_path: PathBuf,
    config: PipelineConfig,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            config: PipelineConfig::default(),
        }
    }

    /// 从文件加载配置，文件不存在时写出默认配置
    pub async fn load(&mut self) -> Result<(), PipelineError> {
        if !self.config_path.exists() {
            self.save().await?;
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| PipelineError::Config {
                message: format!("Failed to read config file: {}", e),
            })?;

        self.config = toml::from_str(&content).map_err(|e| PipelineError::Config {
            message: format!("Failed to parse config file: {}", e),
        })?;

        self.config.validate()
    }

    pub async fn save(&self) -> Result<(), PipelineError> {
        let content = toml::to_string_pretty(&self.config).map_err(|e| PipelineError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PipelineError::Config {
                        message: format!("Failed to create config directory: {}", e),
                    })?;
            }
        }

        tokio::fs::write(&self.config_path, content)
            .await
            .map_err(|e| PipelineError::Config {
                message: format!("Failed to write config file: {}", e),
            })
    }

    pub fn get_config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn get_config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    pub fn into_config(self) -> PipelineConfig {
        self.config
    }
}

/// 环境变量覆盖
pub struct EnvConfigOverride;

impl EnvConfigOverride {
    pub const PREFIX: &'static str = "AVATAR_STREAMER_";

    pub fn apply_overrides(config: &mut PipelineConfig) {
        Self::apply_with(config, |key| std::env::var(key).ok());
    }

    /// 以给定的查找函数应用覆盖，便于测试
    pub fn apply_with<F>(config: &mut PipelineConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", Self::PREFIX, name));
        let get_u32 = |name: &str| get(name).and_then(|v| v.parse::<u32>().ok());
        let get_ms = |name: &str| {
            get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        // 媒体
        if let Some(fps) = get_u32("FRAME_RATE") {
            config.media.frame_rate = fps;
        }
        if let Some(rate) = get_u32("SAMPLE_RATE") {
            config.media.sample_rate = rate;
        }
        if let Some(chunk) = get_ms("AUDIO_CHUNK_MS") {
            config.media.audio_chunk = chunk;
        }

        // 同步
        if let Some(jitter) = get_ms("JITTER_BUFFER_MS") {
            config.sync.jitter_buffer = jitter;
        }
        if let Some(tolerance) = get_ms("STALL_TOLERANCE_MS") {
            config.sync.stall_tolerance = tolerance;
        }
        if let Some(threshold) = get_ms("DRIFT_THRESHOLD_MS") {
            config.sync.drift_threshold = threshold;
        }

        // 推流
        if let Some(address) = get("OUTPUT_ADDRESS") {
            config.output.address = address;
        }
        if let Some(attempts) = get_u32("MAX_RECONNECT_ATTEMPTS") {
            config.output.max_reconnect_attempts = attempts;
        }

        // TTS
        if let Some(voice) = get("VOICE_REF") {
            config.tts.voice_ref = voice;
        }

        // 日志
        if let Some(level) = get("LOG_LEVEL") {
            config.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.media.chunk_samples(), 320);
        assert_eq!(config.media.frame_duration_us(0), 40_000);
        assert_eq!(config.audio_queue_capacity(), 15);
        assert_eq!(config.video_queue_capacity(), 8);
    }

    #[test]
    fn test_fractional_frame_interval() {
        let mut config = PipelineConfig::default();
        config.media.frame_rate = 30;
        assert_eq!(config.media.frame_start_us(1), 33_333);
        assert_eq!(config.media.frame_start_us(3), 100_000);
        let total: u64 = (0..30).map(|i| config.media.frame_duration_us(i)).sum();
        assert_eq!(total, 1_000_000);
        assert_eq!(config.media.frame_start_sample(1), 533);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.media.frame_rate = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.sync.drift_threshold = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.media.sample_rate = 44_100;
        config.media.audio_chunk = Duration::from_millis(15);
        // 44.1kHz 下 15ms 为 661.5 个采样点
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.output.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let clip = ClipConfig {
            name: "greeting".to_string(),
            frames_dir: PathBuf::from("clips/greeting"),
            audio_path: PathBuf::from("clips/greeting.pcm"),
            sample_rate: 16_000,
        };
        let mut config = PipelineConfig::default();
        config.clips = vec![clip.clone(), clip];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clip_section_parses() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [render]
            idle_clip_dir = "assets/idle"

            [sync]
            filler_video = "idle_clip"

            [[clips]]
            name = "greeting"
            frames_dir = "assets/greeting"
            audio_path = "assets/greeting.pcm"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.sync.filler_video, FillerVideo::IdleClip);
        assert_eq!(config.render.idle_clip_dir, Some(PathBuf::from("assets/idle")));
        assert_eq!(config.clips.len(), 1);
        assert_eq!(config.clips[0].sample_rate, 16_000);

        // 写回后仍可读取
        let text = toml::to_string_pretty(&config).unwrap();
        let reparsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("AVATAR_STREAMER_FRAME_RATE", "30"),
            ("AVATAR_STREAMER_STALL_TOLERANCE_MS", "350"),
            ("AVATAR_STREAMER_OUTPUT_ADDRESS", "10.0.0.2:9000"),
            ("AVATAR_STREAMER_MAX_RECONNECT_ATTEMPTS", "not-a-number"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = PipelineConfig::default();
        EnvConfigOverride::apply_with(&mut config, |key| vars.get(key).cloned());

        assert_eq!(config.media.frame_rate, 30);
        assert_eq!(config.sync.stall_tolerance, Duration::from_millis(350));
        assert_eq!(config.output.address, "10.0.0.2:9000");
        // 无法解析的值保持默认
        assert_eq!(config.output.max_reconnect_attempts, 5);
    }

    #[tokio::test]
    async fn test_load_writes_default_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("streamer.toml");

        let mut manager = ConfigManager::new(path.clone());
        manager.load().await.unwrap();
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let patched = content.replace("frame_rate = 25", "frame_rate = 50");
        std::fs::write(&path, patched).unwrap();

        let mut manager = ConfigManager::new(path);
        manager.load().await.unwrap();
        assert_eq!(manager.get_config().media.frame_rate, 50);
        assert_eq!(manager.get_config().sync.stall_tolerance, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[sync]\ndrift_threshold = 60\n").unwrap();

        let mut manager = ConfigManager::new(path);
        manager.load().await.unwrap();
        let config = manager.into_config();
        assert_eq!(config.sync.drift_threshold, Duration::from_millis(60));
        assert_eq!(config.sync.jitter_buffer, Duration::from_millis(100));
        assert_eq!(config.media.sample_rate, 16_000);
    }

    #[tokio::test]
    async fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[media]\nframe_rate = 0\n").unwrap();

        let mut manager = ConfigManager::new(path);
        assert!(matches!(
            manager.load().await,
            Err(PipelineError::Config { .. })
        ));
    }
}
