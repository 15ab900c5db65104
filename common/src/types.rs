use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::pcm;

/// 媒体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// 数组下标，便于按媒体类型分别记录状态
    pub fn index(self) -> usize {
        match self {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
        }
    }
}

/// 音频来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioOrigin {
    /// TTS 合成的语音
    Speech,
    /// 静音（TTS 失败兜底或同步器填充）
    Silence,
    /// 预录片段的音频
    Clip,
}

/// 音频块
///
/// 16 位小端单声道 PCM。`ts_us` 为内容时钟上的起始时间（微秒），
/// 由同步器映射到呈现时间轴。
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub utterance_id: u64,
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub ts_us: u64,
    pub duration_us: u64,
    pub origin: AudioOrigin,
}

impl AudioChunk {
    /// 创建一段静音音频块
    pub fn silence(utterance_id: u64, sample_rate: u32, ts_us: u64, samples: usize) -> Self {
        Self {
            utterance_id,
            pcm: pcm::silence(samples),
            sample_rate,
            ts_us,
            duration_us: pcm::samples_to_us(samples as u64, sample_rate),
            origin: AudioOrigin::Silence,
        }
    }

    /// 采样点数量
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / pcm::BYTES_PER_SAMPLE
    }

    pub fn end_us(&self) -> u64 {
        self.ts_us + self.duration_us
    }
}

/// 分辨率
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// RGB24 像素缓冲区的字节数
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// 视频帧来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameOrigin {
    /// 渲染模型正常输出
    Rendered,
    /// 渲染失败，重复上一帧有效画面
    Frozen,
    /// 同步器填充或纠偏时保持的上一帧
    Held,
    /// 待机片段中的画面
    Idle,
    /// 预录片段中的画面
    Clip,
}

/// 视频帧
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub pixels: Bytes,
    pub resolution: Resolution,
    pub ts_us: u64,
    pub duration_us: u64,
    pub origin: FrameOrigin,
    /// 响应跳帧请求后产出的第一帧
    pub resynced: bool,
}

impl VideoFrame {
    pub fn end_us(&self) -> u64 {
        self.ts_us + self.duration_us
    }

    /// 以同一画面生成一帧新的保持帧
    pub fn hold(&self, ts_us: u64, duration_us: u64) -> Self {
        Self {
            pixels: self.pixels.clone(),
            resolution: self.resolution,
            ts_us,
            duration_us,
            origin: FrameOrigin::Held,
            resynced: false,
        }
    }
}

/// 复用后的媒体负载
#[derive(Debug, Clone, PartialEq)]
pub enum MediaPayload {
    Audio(AudioChunk),
    Video(VideoFrame),
}

/// 同步器输出、推流器消费的样本
#[derive(Debug, Clone, PartialEq)]
pub struct MuxedSample {
    /// 会话内递增序号
    pub sequence: u64,
    /// 呈现时间戳（微秒）
    pub pts_us: u64,
    /// 是否为同步器插入的填充样本
    pub filler: bool,
    pub payload: MediaPayload,
}

impl MuxedSample {
    pub fn kind(&self) -> MediaKind {
        match self.payload {
            MediaPayload::Audio(_) => MediaKind::Audio,
            MediaPayload::Video(_) => MediaKind::Video,
        }
    }

    pub fn duration_us(&self) -> u64 {
        match &self.payload {
            MediaPayload::Audio(chunk) => chunk.duration_us,
            MediaPayload::Video(frame) => frame.duration_us,
        }
    }

    pub fn end_us(&self) -> u64 {
        self.pts_us + self.duration_us()
    }

    pub fn payload_len(&self) -> usize {
        match &self.payload {
            MediaPayload::Audio(chunk) => chunk.pcm.len(),
            MediaPayload::Video(frame) => frame.pixels.len(),
        }
    }
}
