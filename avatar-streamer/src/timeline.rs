// 呈现时间轴
//
// 记录每种媒体已输出样本的结束时间，保证同一媒体类型的时间戳
// 既不重叠也不倒退。唯一写入方是同步器。

use common::MediaKind;

use crate::error::PipelineError;

#[derive(Debug, Default, Clone)]
pub struct PresentationTimeline {
    last_end_us: [Option<u64>; 2],
}

impl PresentationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个即将输出的样本
    ///
    /// 起始时间早于上一个同类样本的结束时间时返回错误，该错误对会话是致命的。
    pub fn record(
        &mut self,
        kind: MediaKind,
        pts_us: u64,
        duration_us: u64,
    ) -> Result<(), PipelineError> {
        let slot = &mut self.last_end_us[kind.index()];
        if let Some(last_end_us) = *slot {
            if pts_us < last_end_us {
                return Err(PipelineError::TimelineViolation {
                    kind,
                    pts_us,
                    last_end_us,
                });
            }
        }
        *slot = Some(pts_us + duration_us);
        Ok(())
    }

    /// 某媒体类型最后一个样本的结束时间
    pub fn end_of(&self, kind: MediaKind) -> Option<u64> {
        self.last_end_us[kind.index()]
    }

    /// 时间轴当前位置（两种媒体中较远的结束时间）
    pub fn position_us(&self) -> u64 {
        self.last_end_us.iter().flatten().copied().max().unwrap_or(0)
    }
}
