use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MediaError, Result};
use crate::types::{MediaKind, MediaPayload, MuxedSample};

/// 单个封包的最大长度
pub const MAX_ENVELOPE_LEN: usize = 8 * 1024 * 1024;

/// 长度前缀字节数（u32 大端）
pub const LENGTH_PREFIX_LEN: usize = 4;

/// 推流连接上的消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamMessage {
    /// 每次（重新）建立连接后发送的第一条消息
    Hello(StreamHello),
    Sample(SampleEnvelope),
    /// 正常结束推流
    Goodbye { session_id: Uuid, last_sequence: u64 },
}

/// 流参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamHello {
    pub session_id: Uuid,
    pub started_at_ms: i64,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub width: u32,
    pub height: u32,
}

/// 样本封包
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleEnvelope {
    pub session_id: Uuid,
    pub sequence: u64,
    pub kind: MediaKind,
    pub pts_us: u64,
    pub duration_us: u64,
    pub filler: bool,
    pub payload: Vec<u8>,
}

impl SampleEnvelope {
    pub fn from_sample(session_id: Uuid, sample: &MuxedSample) -> Self {
        let payload = match &sample.payload {
            MediaPayload::Audio(chunk) => chunk.pcm.to_vec(),
            MediaPayload::Video(frame) => frame.pixels.to_vec(),
        };
        Self {
            session_id,
            sequence: sample.sequence,
            kind: sample.kind(),
            pts_us: sample.pts_us,
            duration_us: sample.duration_us(),
            filler: sample.filler,
            payload,
        }
    }

    pub fn end_us(&self) -> u64 {
        self.pts_us + self.duration_us
    }
}

/// 编码为带长度前缀的帧
pub fn encode_message(message: &StreamMessage) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_ENVELOPE_LEN {
        return Err(MediaError::EnvelopeTooLarge {
            len: body.len(),
            max: MAX_ENVELOPE_LEN,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// 解析长度前缀并校验上限
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_ENVELOPE_LEN {
        return Err(MediaError::EnvelopeTooLarge {
            len,
            max: MAX_ENVELOPE_LEN,
        });
    }
    if len == 0 {
        return Err(MediaError::ProtocolError("empty envelope".to_string()));
    }
    Ok(len)
}

pub fn decode_message(body: &[u8]) -> Result<StreamMessage> {
    Ok(bincode::deserialize(body)?)
}
