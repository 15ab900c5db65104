// 媒体时钟
//
// 以会话开始时刻为原点的单调墙钟，单位微秒。基于 tokio 的 Instant，
// 测试中可用暂停时间精确推进。

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// 唤醒延迟超过该值时告警
const LATE_WAKEUP_WARN_US: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
}

impl MediaClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// 自原点起经过的微秒数
    pub fn now_us(&self) -> u64 {
        Instant::now().saturating_duration_since(self.origin).as_micros() as u64
    }

    /// 时钟上某一时刻对应的 Instant
    pub fn instant_at(&self, at_us: u64) -> Instant {
        self.origin + Duration::from_micros(at_us)
    }

    /// 等待到指定时刻，唤醒明显滞后时告警
    pub async fn sleep_until(&self, at_us: u64) {
        tokio::time::sleep_until(self.instant_at(at_us)).await;
        let late_by = self.now_us().saturating_sub(at_us);
        if late_by > LATE_WAKEUP_WARN_US {
            warn!("Clock wakeup late by {}us", late_by);
        }
    }
}
