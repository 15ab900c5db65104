// 推流会话登记
//
// 按会话记录收到的样本并逐媒体类型校验时间戳连续性。
// 同一会话的重连沿用原有记录，序号与时间戳从断点继续校验。

use std::sync::Arc;

use common::{MediaKind, SampleEnvelope, StreamHello};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// 单个样本的校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    Contiguous,
    /// 与上一样本之间有空档
    Gap { missing_us: u64 },
    /// 与上一样本重叠或时间戳回退
    Overlap { overlap_us: u64 },
    /// 序号不大于已收到的最大序号，重连后的重发
    Duplicate,
}

/// 单个媒体类型的统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneStats {
    pub samples: u64,
    pub fillers: u64,
    pub bytes: u64,
    pub gaps: u64,
    pub gap_us: u64,
    pub overlaps: u64,
    /// 下一个样本应有的起始时间
    pub next_pts_us: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub started_at_ms: i64,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub width: u32,
    pub height: u32,
    pub connections: u32,
    pub audio: LaneStats,
    pub video: LaneStats,
    pub duplicates: u64,
    /// 序号跳过的数量，对应推流端丢弃的样本
    pub sequence_skipped: u64,
    pub last_sequence: Option<u64>,
    pub completed: bool,
}

impl SessionStats {
    fn new(hello: &StreamHello) -> Self {
        Self {
            session_id: hello.session_id,
            started_at_ms: hello.started_at_ms,
            frame_rate: hello.frame_rate,
            sample_rate: hello.sample_rate,
            width: hello.width,
            height: hello.height,
            connections: 0,
            audio: LaneStats::default(),
            video: LaneStats::default(),
            duplicates: 0,
            sequence_skipped: 0,
            last_sequence: None,
            completed: false,
        }
    }

    fn lane_mut(&mut self, kind: MediaKind) -> &mut LaneStats {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    fn record(&mut self, envelope: &SampleEnvelope) -> Continuity {
        if let Some(last) = self.last_sequence {
            if envelope.sequence <= last {
                self.duplicates += 1;
                return Continuity::Duplicate;
            }
            self.sequence_skipped += envelope.sequence - last - 1;
        } else {
            self.sequence_skipped += envelope.sequence;
        }
        self.last_sequence = Some(envelope.sequence);

        let lane = self.lane_mut(envelope.kind);
        lane.samples += 1;
        lane.bytes += envelope.payload.len() as u64;
        if envelope.filler {
            lane.fillers += 1;
        }

        let continuity = match lane.next_pts_us {
            Some(expected) if envelope.pts_us > expected => {
                let missing_us = envelope.pts_us - expected;
                lane.gaps += 1;
                lane.gap_us += missing_us;
                Continuity::Gap { missing_us }
            }
            Some(expected) if envelope.pts_us < expected => {
                lane.overlaps += 1;
                Continuity::Overlap {
                    overlap_us: expected - envelope.pts_us,
                }
            }
            _ => Continuity::Contiguous,
        };
        lane.next_pts_us = Some(envelope.end_us());
        continuity
    }
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionStats>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次连接，返回是否为已知会话的重连
    pub fn on_hello(&self, hello: &StreamHello) -> bool {
        let mut entry = self
            .sessions
            .entry(hello.session_id)
            .or_insert_with(|| SessionStats::new(hello));
        entry.connections += 1;
        entry.completed = false;

        let reconnect = entry.connections > 1;
        if reconnect {
            info!(
                "Session {} reconnected (connection #{})",
                hello.session_id, entry.connections
            );
        } else {
            info!(
                "Session {} started: {}fps, {}Hz, {}x{}",
                hello.session_id, hello.frame_rate, hello.sample_rate, hello.width, hello.height
            );
        }
        reconnect
    }

    /// 记录一个样本；未登记的会话返回 None
    pub fn on_sample(&self, envelope: &SampleEnvelope) -> Option<Continuity> {
        let mut entry = self.sessions.get_mut(&envelope.session_id)?;
        let continuity = entry.record(envelope);
        match continuity {
            Continuity::Contiguous => {}
            Continuity::Gap { missing_us } => warn!(
                "Session {} {:?} gap of {}us before pts {}",
                envelope.session_id, envelope.kind, missing_us, envelope.pts_us
            ),
            Continuity::Overlap { overlap_us } => warn!(
                "Session {} {:?} overlap of {}us at pts {}",
                envelope.session_id, envelope.kind, overlap_us, envelope.pts_us
            ),
            Continuity::Duplicate => warn!(
                "Session {} duplicate sample #{}",
                envelope.session_id, envelope.sequence
            ),
        }
        Some(continuity)
    }

    pub fn on_goodbye(&self, session_id: Uuid, last_sequence: u64) {
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.completed = true;
            if entry.last_sequence != Some(last_sequence) {
                warn!(
                    "Session {} ended at #{} but last received #{:?}",
                    session_id, last_sequence, entry.last_sequence
                );
            }
            info!(
                "Session {} finished: {} audio, {} video samples",
                session_id, entry.audio.samples, entry.video.samples
            );
        }
    }

    pub fn get(&self, session_id: &Uuid) -> Option<SessionStats> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<SessionStats> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 尚未正常结束的会话
    pub fn active(&self) -> Vec<SessionStats> {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().completed)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(session_id: Uuid) -> StreamHello {
        StreamHello {
            session_id,
            started_at_ms: 0,
            frame_rate: 25,
            sample_rate: 16_000,
            width: 4,
            height: 4,
        }
    }

    fn sample(session_id: Uuid, sequence: u64, kind: MediaKind, pts_us: u64) -> SampleEnvelope {
        let duration_us = match kind {
            MediaKind::Audio => 20_000,
            MediaKind::Video => 40_000,
        };
        SampleEnvelope {
            session_id,
            sequence,
            kind,
            pts_us,
            duration_us,
            filler: false,
            payload: vec![0; 16],
        }
    }

    #[test]
    fn test_contiguous_lanes() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.on_hello(&hello(id)));

        let samples = [
            sample(id, 0, MediaKind::Audio, 0),
            sample(id, 1, MediaKind::Video, 0),
            sample(id, 2, MediaKind::Audio, 20_000),
            sample(id, 3, MediaKind::Audio, 40_000),
            sample(id, 4, MediaKind::Video, 40_000),
        ];
        for envelope in &samples {
            assert_eq!(registry.on_sample(envelope), Some(Continuity::Contiguous));
        }
        registry.on_goodbye(id, 4);

        let stats = registry.get(&id).unwrap();
        assert!(stats.completed);
        assert_eq!(stats.audio.samples, 3);
        assert_eq!(stats.video.samples, 2);
        assert_eq!(stats.video.next_pts_us, Some(80_000));
        assert_eq!(stats.sequence_skipped, 0);
        assert!(registry.active().is_empty());
    }

    #[test]
    fn test_gap_and_overlap_detected() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.on_hello(&hello(id));

        registry.on_sample(&sample(id, 0, MediaKind::Video, 0));
        // 推流端丢弃了 40ms~80ms 的视频帧
        assert_eq!(
            registry.on_sample(&sample(id, 2, MediaKind::Video, 80_000)),
            Some(Continuity::Gap { missing_us: 40_000 })
        );
        assert_eq!(
            registry.on_sample(&sample(id, 3, MediaKind::Video, 100_000)),
            Some(Continuity::Overlap { overlap_us: 20_000 })
        );

        let stats = registry.get(&id).unwrap();
        assert_eq!(stats.video.gaps, 1);
        assert_eq!(stats.video.gap_us, 40_000);
        assert_eq!(stats.video.overlaps, 1);
        assert_eq!(stats.sequence_skipped, 1);
    }

    #[test]
    fn test_reconnect_resumes_session() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        registry.on_hello(&hello(id));
        registry.on_sample(&sample(id, 0, MediaKind::Audio, 0));
        registry.on_sample(&sample(id, 1, MediaKind::Audio, 20_000));

        assert!(registry.on_hello(&hello(id)));
        // 断线前已收到的样本被重发
        assert_eq!(
            registry.on_sample(&sample(id, 1, MediaKind::Audio, 20_000)),
            Some(Continuity::Duplicate)
        );
        assert_eq!(
            registry.on_sample(&sample(id, 2, MediaKind::Audio, 40_000)),
            Some(Continuity::Contiguous)
        );

        let stats = registry.get(&id).unwrap();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.audio.samples, 3);
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn test_unknown_session_rejected() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        assert_eq!(registry.on_sample(&sample(id, 0, MediaKind::Audio, 0)), None);
        assert!(registry.all().is_empty());
    }
}
