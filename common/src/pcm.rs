// PCM 工具函数
//
// 全链路统一使用 16 位小端单声道 PCM。

use bytes::{BufMut, Bytes, BytesMut};

pub const BYTES_PER_SAMPLE: usize = 2;

/// 采样点数换算为微秒（向下取整）
pub fn samples_to_us(samples: u64, sample_rate: u32) -> u64 {
    samples * 1_000_000 / sample_rate as u64
}

/// 微秒换算为采样点数（向下取整）
pub fn us_to_samples(us: u64, sample_rate: u32) -> u64 {
    us * sample_rate as u64 / 1_000_000
}

/// 生成指定采样点数的静音
pub fn silence(samples: usize) -> Bytes {
    Bytes::from(vec![0u8; samples * BYTES_PER_SAMPLE])
}

pub fn encode_samples(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        buf.put_i16_le(*sample);
    }
    buf.freeze()
}

/// 解码 PCM 字节，末尾不足一个采样点的字节被忽略
pub fn decode_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// 线性插值重采样
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// 均方根电平，范围 0.0 - 1.0
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| {
            let v = *s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversion() {
        assert_eq!(samples_to_us(320, 16_000), 20_000);
        assert_eq!(us_to_samples(40_000, 16_000), 640);
        // 44.1kHz 下 1 个采样点不足 23 微秒
        assert_eq!(samples_to_us(1, 44_100), 22);
    }

    #[test]
    fn test_encode_decode() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = encode_samples(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_samples(&bytes), samples);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<i16> = (0..100).map(|i| i as i16 * 10).collect();
        let out = resample_linear(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0], 0);
        assert_eq!(out[10], 200);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let out = resample_linear(&[0, 100], 8_000, 16_000);
        assert_eq!(out, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_rms_of_silence() {
        assert_eq!(rms(&[0; 64]), 0.0);
        assert!(rms(&[i16::MAX; 8]) > 0.99);
    }
}
