// 合成协作方
//
// 不依赖模型的 TTS 与渲染实现：按词生成正弦音，按音频电平画嘴型。
// 用于本地端到端运行和联调媒体服务器。

use std::f64::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use common::{pcm, Resolution};

use crate::collaborator::{AudioWindow, FrameSynthesizer, SpeechSynthesizer, SynthesizedAudio};
use crate::error::CollaboratorError;

/// 每个词的发声时长
const WORD_DURATION_MS: u64 = 200;
/// 词尾静音
const WORD_GAP_MS: u64 = 40;
/// 待机呼吸动画的帧数
const BREATH_FRAMES: i64 = 6;

/// 正弦音 TTS
pub struct ToneSynthesizer {
    sample_rate: u32,
    latency: Duration,
}

impl ToneSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            latency: Duration::ZERO,
        }
    }

    /// 模拟合成耗时
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn tone(&self, text: &str) -> Vec<i16> {
        let rate = self.sample_rate as u64;
        let word_samples = (WORD_DURATION_MS * rate / 1000) as usize;
        let voiced = ((WORD_DURATION_MS - WORD_GAP_MS) * rate / 1000) as usize;

        let mut samples = Vec::new();
        for (n, word) in text.split_whitespace().enumerate() {
            // 音高随词长变化，听感上区分不同的词
            let freq = 180.0 + 20.0 * ((word.len() + n) % 8) as f64;
            samples.extend((0..word_samples).map(|i| {
                if i >= voiced {
                    return 0;
                }
                let t = i as f64 / self.sample_rate as f64;
                let envelope = (PI * i as f64 / voiced as f64).sin();
                (envelope * 0.4 * (2.0 * PI * freq * t).sin() * i16::MAX as f64) as i16
            }));
        }
        samples
    }
}

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice_ref: &str,
    ) -> Result<SynthesizedAudio, CollaboratorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(SynthesizedAudio {
            pcm: pcm::encode_samples(&self.tone(text)),
            sample_rate: self.sample_rate,
        })
    }
}

/// 按本帧音频电平绘制嘴型的渲染器
#[derive(Debug, Default)]
pub struct MouthRenderer;

const BACKGROUND: [u8; 3] = [32, 36, 48];
const FACE: [u8; 3] = [224, 184, 152];
const MOUTH: [u8; 3] = [120, 24, 32];

impl MouthRenderer {
    pub fn new() -> Self {
        Self
    }

    /// `lift` 为整张脸上移的像素数
    fn draw(resolution: Resolution, openness: f64, lift: i64) -> Bytes {
        let (w, h) = (resolution.width as i64, resolution.height as i64);
        let (cx, cy) = (w / 2, h / 2 - lift);
        let radius = w.min(h) * 2 / 5;
        let mouth_half_width = radius / 2;
        let mouth_half_height = ((radius as f64 / 3.0) * openness.clamp(0.0, 1.0)) as i64;
        let mouth_y = cy + radius / 2;

        let mut buf = BytesMut::with_capacity(resolution.frame_bytes());
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = (x - cx, y - cy);
                let in_face = dx * dx + dy * dy <= radius * radius;
                let in_mouth = dx.abs() <= mouth_half_width
                    && (y - mouth_y).abs() <= mouth_half_height.max(1);
                let color = match (in_face, in_mouth) {
                    (true, true) => MOUTH,
                    (true, false) => FACE,
                    _ => BACKGROUND,
                };
                buf.put_slice(&color);
            }
        }
        buf.freeze()
    }
}

#[async_trait]
impl FrameSynthesizer for MouthRenderer {
    async fn render_frame(&self, window: &AudioWindow) -> Result<Bytes, CollaboratorError> {
        // 电平 0.3 左右即视为完全张嘴
        let level = pcm::rms(window.frame_samples()) / 0.3;
        Ok(Self::draw(window.resolution, level, 0))
    }

    fn idle_frame(&self, resolution: Resolution) -> Bytes {
        Self::draw(resolution, 0.0, 0)
    }

    /// 闭嘴微微起伏，往返播放即为一呼一吸
    fn idle_clip(&self, resolution: Resolution) -> Vec<Bytes> {
        let amplitude = (resolution.height as i64 / 32).max(1);
        (0..BREATH_FRAMES)
            .map(|i| Self::draw(resolution, 0.0, amplitude * i / (BREATH_FRAMES - 1)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn window(samples: Vec<i16>, resolution: Resolution) -> AudioWindow {
        let len = samples.len();
        AudioWindow {
            frame_index: 0,
            ts_us: 0,
            sample_rate: 16_000,
            samples: Arc::from(samples),
            frame_offset: 0,
            frame_len: len,
            resolution,
        }
    }

    #[tokio::test]
    async fn test_tone_length_follows_word_count() {
        let tts = ToneSynthesizer::new(16_000);
        let audio = tts.synthesize("hello there world", "default").await.unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(pcm::decode_samples(&audio.pcm).len(), 3 * 3200);

        let empty = tts.synthesize("   ", "default").await.unwrap();
        assert!(empty.pcm.is_empty());
    }

    #[test]
    fn test_mouth_opens_with_level() {
        let renderer = MouthRenderer::new();
        let resolution = Resolution::new(32, 32);

        let quiet =
            tokio_test::block_on(renderer.render_frame(&window(vec![0; 640], resolution))).unwrap();
        let loud = tokio_test::block_on(
            renderer.render_frame(&window(vec![12_000; 640], resolution)),
        )
        .unwrap();

        assert_eq!(quiet.len(), resolution.frame_bytes());
        assert_eq!(quiet, renderer.idle_frame(resolution));
        let mouth_pixels = |frame: &Bytes| frame.chunks(3).filter(|p| *p == MOUTH).count();
        assert!(mouth_pixels(&loud) > mouth_pixels(&quiet));
    }

    #[test]
    fn test_idle_clip_starts_at_rest_and_moves() {
        let renderer = MouthRenderer::new();
        let resolution = Resolution::new(64, 64);
        let clip = renderer.idle_clip(resolution);

        assert_eq!(clip.len(), BREATH_FRAMES as usize);
        assert_eq!(clip[0], renderer.idle_frame(resolution));
        assert!(clip.iter().all(|f| f.len() == resolution.frame_bytes()));
        assert_ne!(clip[0], clip[clip.len() - 1]);
    }
}
