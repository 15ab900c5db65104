// 预录片段
//
// 待机片段与插播片段都是一组画面，按往返顺序循环播放，首尾衔接处画面连续。
// 插播片段另带一段音频，音频播完即回到静音。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use common::{pcm, Resolution};
use tracing::{debug, info};

use crate::config::ClipConfig;
use crate::error::PipelineError;

/// 往返播放时第 `index` 次取到的帧序号
///
/// 长度为 3 时依次为 0, 1, 2, 2, 1, 0, 0, 1, ...
pub fn mirror_index(len: usize, index: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let len_u64 = len as u64;
    let turn = index / len_u64;
    let offset = (index % len_u64) as usize;
    if turn % 2 == 0 {
        offset
    } else {
        len - offset - 1
    }
}

/// 往返循环的画面序列
#[derive(Debug, Clone)]
pub struct FrameCycle {
    frames: Arc<[Bytes]>,
    next: u64,
}

impl FrameCycle {
    pub fn new(frames: Vec<Bytes>) -> Result<Self, PipelineError> {
        if frames.is_empty() {
            return Err(PipelineError::Config {
                message: "Frame cycle needs at least one frame".to_string(),
            });
        }
        Ok(Self {
            frames: frames.into(),
            next: 0,
        })
    }

    /// 单帧循环
    pub fn still(frame: Bytes) -> Self {
        Self {
            frames: Arc::from(vec![frame]),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 取出下一帧并前进
    pub fn next_frame(&mut self) -> Bytes {
        let frame = self.frames[mirror_index(self.frames.len(), self.next)].clone();
        self.next += 1;
        frame
    }
}

/// 插播片段
#[derive(Debug, Clone, PartialEq)]
pub struct MediaClip {
    pub name: String,
    /// 16 位小端单声道 PCM
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub frames: Arc<[Bytes]>,
}

impl MediaClip {
    pub fn new(name: impl Into<String>, pcm: Bytes, sample_rate: u32, frames: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            pcm,
            sample_rate,
            frames: frames.into(),
        }
    }

    /// 从片段配置加载画面和音频
    pub fn load(config: &ClipConfig, resolution: Resolution) -> Result<Self, PipelineError> {
        let frames = load_frames(&config.frames_dir, resolution)?;
        let pcm = std::fs::read(&config.audio_path).map_err(|e| PipelineError::Config {
            message: format!(
                "Failed to read clip audio {}: {}",
                config.audio_path.display(),
                e
            ),
        })?;
        let clip = Self::new(config.name.clone(), Bytes::from(pcm), config.sample_rate, frames);
        clip.validate(resolution)?;
        info!(
            "Loaded clip '{}': {} frames, {}ms audio",
            clip.name,
            clip.frames.len(),
            clip.duration_us() / 1000
        );
        Ok(clip)
    }

    pub fn duration_us(&self) -> u64 {
        pcm::samples_to_us((self.pcm.len() / pcm::BYTES_PER_SAMPLE) as u64, self.sample_rate)
    }

    /// 片段内第 `index` 个帧位的画面
    pub fn frame_at(&self, index: u64) -> Option<&Bytes> {
        self.frames.get(mirror_index(self.frames.len(), index))
    }

    pub fn validate(&self, resolution: Resolution) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::Config {
            message: format!("Clip '{}' {}", self.name, reason),
        };
        if self.sample_rate == 0 {
            return Err(invalid("has no sample rate".to_string()));
        }
        if self.pcm.is_empty() || self.pcm.len() % pcm::BYTES_PER_SAMPLE != 0 {
            return Err(invalid(format!("has malformed audio ({} bytes)", self.pcm.len())));
        }
        if self.frames.is_empty() {
            return Err(invalid("has no frames".to_string()));
        }
        let expected = resolution.frame_bytes();
        if let Some(bad) = self.frames.iter().position(|f| f.len() != expected) {
            return Err(invalid(format!(
                "frame {} is {} bytes, expected {}",
                bad,
                self.frames[bad].len(),
                expected
            )));
        }
        Ok(())
    }
}

/// 读取目录下按数字命名的 `.rgb` 画面，按序号排序
pub fn load_frames(dir: &Path, resolution: Resolution) -> Result<Vec<Bytes>, PipelineError> {
    let read_error = |e: std::io::Error| PipelineError::Config {
        message: format!("Failed to read frames from {}: {}", dir.display(), e),
    };

    let mut numbered = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("rgb") {
            continue;
        }
        match path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(index) => numbered.push((index, path)),
            None => debug!("Skipping unnumbered frame file {}", path.display()),
        }
    }
    numbered.sort_by_key(|(index, _)| *index);

    let expected = resolution.frame_bytes();
    let mut frames = Vec::with_capacity(numbered.len());
    for (_, path) in numbered {
        let pixels = std::fs::read(&path).map_err(read_error)?;
        if pixels.len() != expected {
            return Err(PipelineError::Config {
                message: format!(
                    "Frame {} is {} bytes, expected {} for {}x{}",
                    path.display(),
                    pixels.len(),
                    expected,
                    resolution.width,
                    resolution.height
                ),
            });
        }
        frames.push(Bytes::from(pixels));
    }

    if frames.is_empty() {
        return Err(PipelineError::Config {
            message: format!("No frames found in {}", dir.display()),
        });
    }
    Ok(frames)
}

/// 按名称索引的插播片段
#[derive(Debug, Clone, Default)]
pub struct ClipLibrary {
    clips: HashMap<String, Arc<MediaClip>>,
}

impl ClipLibrary {
    pub fn load(configs: &[ClipConfig], resolution: Resolution) -> Result<Self, PipelineError> {
        let mut library = Self::default();
        for config in configs {
            library.insert(MediaClip::load(config, resolution)?);
        }
        Ok(library)
    }

    pub fn insert(&mut self, clip: MediaClip) {
        self.clips.insert(clip.name.clone(), Arc::new(clip));
    }

    pub fn get(&self, name: &str) -> Option<Arc<MediaClip>> {
        self.clips.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clips.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mirror_index_ping_pongs() {
        let order: Vec<usize> = (0..12).map(|i| mirror_index(3, i)).collect();
        assert_eq!(order, vec![0, 1, 2, 2, 1, 0, 0, 1, 2, 2, 1, 0]);
        assert!((0..10).all(|i| mirror_index(1, i) == 0));
        assert_eq!(mirror_index(0, 7), 0);
    }

    #[test]
    fn test_frame_cycle_follows_mirror_order() {
        let frames: Vec<Bytes> = (0..4u8).map(|i| Bytes::from(vec![i; 3])).collect();
        let mut cycle = FrameCycle::new(frames).unwrap();
        let firsts: Vec<u8> = (0..10).map(|_| cycle.next_frame()[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3, 3, 2, 1, 0, 0, 1]);

        assert!(FrameCycle::new(Vec::new()).is_err());
        let mut still = FrameCycle::still(Bytes::from_static(&[9, 9, 9]));
        assert_eq!(still.next_frame(), still.next_frame());
    }

    #[test]
    fn test_clip_validation() {
        let resolution = Resolution::new(2, 2);
        let frame = Bytes::from(vec![0u8; 12]);
        let audio = pcm::encode_samples(&[1; 1600]);

        let clip = MediaClip::new("wave", audio.clone(), 16_000, vec![frame.clone()]);
        assert!(clip.validate(resolution).is_ok());
        assert_eq!(clip.duration_us(), 100_000);

        let wrong_size = MediaClip::new("wave", audio.clone(), 16_000, vec![Bytes::from(vec![0u8; 5])]);
        assert!(wrong_size.validate(resolution).is_err());

        let no_frames = MediaClip::new("wave", audio, 16_000, Vec::new());
        assert!(no_frames.validate(resolution).is_err());

        let odd_audio = MediaClip::new("wave", Bytes::from_static(&[1, 2, 3]), 16_000, vec![frame]);
        assert!(odd_audio.validate(resolution).is_err());
    }

    #[test]
    fn test_load_frames_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        // 按字符串排序时 10 会排在 2 之前
        for index in [10u8, 2, 1] {
            std::fs::write(dir.path().join(format!("{}.rgb", index)), vec![index; 12]).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.path().join("cover.rgb"), vec![0u8; 12]).unwrap();

        let frames = load_frames(dir.path(), Resolution::new(2, 2)).unwrap();
        let order: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(order, vec![1, 2, 10]);

        assert!(matches!(
            load_frames(dir.path(), Resolution::new(4, 4)),
            Err(PipelineError::Config { .. })
        ));
        let empty = tempfile::tempdir().unwrap();
        assert!(load_frames(empty.path(), Resolution::new(2, 2)).is_err());
    }

    #[test]
    fn test_library_loads_configured_clips() {
        let dir = tempfile::tempdir().unwrap();
        let frames_dir = dir.path().join("greeting");
        std::fs::create_dir(&frames_dir).unwrap();
        for index in 0..3u8 {
            std::fs::write(frames_dir.join(format!("{}.rgb", index)), vec![index; 12]).unwrap();
        }
        let audio_path = dir.path().join("greeting.pcm");
        std::fs::write(&audio_path, pcm::encode_samples(&[100; 3200])).unwrap();

        let config = ClipConfig {
            name: "greeting".to_string(),
            frames_dir,
            audio_path,
            sample_rate: 16_000,
        };
        let library = ClipLibrary::load(&[config.clone()], Resolution::new(2, 2)).unwrap();
        assert_eq!(library.names(), vec!["greeting".to_string()]);

        let clip = library.get("greeting").unwrap();
        assert_eq!(clip.duration_us(), 200_000);
        assert_eq!(clip.frame_at(4).map(|f| f[0]), Some(1));
        assert!(library.get("farewell").is_none());

        let missing = ClipConfig {
            audio_path: PathBuf::from("/nonexistent/clip.pcm"),
            ..config
        };
        assert!(ClipLibrary::load(&[missing], Resolution::new(2, 2)).is_err());
    }
}
