// 外部协作方接口
//
// TTS 引擎、渲染模型和媒体服务器都被视为不透明的能力接口，
// 所有调用统一经过 `call_with_timeout`。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{MuxedSample, Resolution};

use crate::error::{CollaboratorError, SinkError};

/// TTS 合成结果
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// 16 位小端单声道 PCM
    pub pcm: Bytes,
    pub sample_rate: u32,
}

/// 渲染一帧所需的音频窗口
#[derive(Debug, Clone)]
pub struct AudioWindow {
    /// 帧序号（会话内）
    pub frame_index: u64,
    /// 帧在内容时钟上的起始时间
    pub ts_us: u64,
    pub sample_rate: u32,
    /// 左上下文 + 本帧 + 右上下文，越界部分以零填充
    pub samples: Arc<[i16]>,
    /// 本帧音频在 `samples` 中的范围
    pub frame_offset: usize,
    pub frame_len: usize,
    pub resolution: Resolution,
}

impl AudioWindow {
    /// 本帧对应的音频
    pub fn frame_samples(&self) -> &[i16] {
        let end = (self.frame_offset + self.frame_len).min(self.samples.len());
        &self.samples[self.frame_offset.min(end)..end]
    }
}

/// TTS 协作方
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_ref: &str,
    ) -> Result<SynthesizedAudio, CollaboratorError>;
}

/// 渲染协作方
#[async_trait]
pub trait FrameSynthesizer: Send + Sync {
    /// 根据音频窗口渲染一帧 RGB24 画面
    async fn render_frame(&self, window: &AudioWindow) -> Result<Bytes, CollaboratorError>;

    /// 尚无有效渲染结果时使用的待机画面
    fn idle_frame(&self, resolution: Resolution) -> Bytes {
        Bytes::from(vec![0u8; resolution.frame_bytes()])
    }

    /// 待机片段，往返循环播放；默认只有待机画面一帧
    fn idle_clip(&self, resolution: Resolution) -> Vec<Bytes> {
        vec![self.idle_frame(resolution)]
    }
}

/// 媒体服务器协作方
#[async_trait]
pub trait MediaSink: Send {
    /// 建立（或重新建立）连接
    async fn connect(&mut self) -> Result<(), SinkError>;

    async fn send(&mut self, sample: &MuxedSample) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// 带超时调用协作方
pub async fn call_with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout { after: limit }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout_expires() {
        let result: Result<(), _> = call_with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(CollaboratorError::Timeout {
                after: Duration::from_millis(50)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout_passes_through() {
        let result = call_with_timeout(Duration::from_millis(50), async {
            Err::<(), _>(CollaboratorError::ModelError {
                reason: "nan".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(CollaboratorError::ModelError { .. })));

        let ok = call_with_timeout(Duration::from_millis(50), async { Ok(5u32) }).await;
        assert_eq!(ok, Ok(5));
    }

    #[test]
    fn test_window_frame_samples() {
        let window = AudioWindow {
            frame_index: 0,
            ts_us: 0,
            sample_rate: 16_000,
            samples: Arc::from(vec![1i16, 2, 3, 4, 5, 6]),
            frame_offset: 2,
            frame_len: 2,
            resolution: Resolution::new(1, 1),
        };
        assert_eq!(window.frame_samples(), &[3, 4]);
    }
}
