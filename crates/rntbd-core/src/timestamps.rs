//! 通道读写时间戳。
//!
//! # 教案式说明
//! - **意图 (Why)**：健康检查可能在任意线程运行，而时间戳只由持有请求管理器的驱动任务
//!   更新；以原子量存储可以让检查方无锁读取；
//! - **逻辑 (How)**：时刻以“相对通道起点的纳秒数”存入 `AtomicU64`，`u64::MAX` 表示未设置；
//!   读取时换算回 [`Instant`]；
//! - **契约 (What)**：写尝试与写完成互相独立更新，不存在先后约束；读到数据即清零过期计数；
//! - **权衡 (Trade-offs)**：[`ChannelTimestamps::snapshot`] 逐字段加载，字段之间不保证同一
//!   时刻一致；健康检查先取快照再读当前时间，竞争写入只会让通道显得更健康。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const UNSET: u64 = u64::MAX;

/// 单个通道的读写进度。
#[derive(Debug)]
pub struct ChannelTimestamps {
    origin: Instant,
    last_write_attempt: AtomicU64,
    last_write: AtomicU64,
    last_read: AtomicU64,
    transit_timeout_count: AtomicU32,
    transit_timeout_write_count: AtomicU32,
    transit_timeout_starting_time: AtomicU64,
}

impl ChannelTimestamps {
    /// 以通道建立时刻为起点，三个读写时间戳都初始化为该时刻。
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            last_write_attempt: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            last_read: AtomicU64::new(0),
            transit_timeout_count: AtomicU32::new(0),
            transit_timeout_write_count: AtomicU32::new(0),
            transit_timeout_starting_time: AtomicU64::new(UNSET),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub(crate) fn channel_write_attempted(&self, now: Instant) {
        self.last_write_attempt
            .store(self.offset(now), Ordering::Release);
    }

    pub(crate) fn channel_write_completed(&self, now: Instant) {
        self.last_write.store(self.offset(now), Ordering::Release);
    }

    /// 收到数据：刷新读时间戳并清零过期统计。
    pub(crate) fn channel_read_completed(&self, now: Instant) {
        self.last_read.store(self.offset(now), Ordering::Release);
        self.transit_timeout_count.store(0, Ordering::Release);
        self.transit_timeout_write_count.store(0, Ordering::Release);
        self.transit_timeout_starting_time
            .store(UNSET, Ordering::Release);
    }

    /// 记录一次在途过期；写操作额外计入写过期计数。
    pub(crate) fn transit_timeout(&self, is_read_only: bool, now: Instant) {
        let previous = self.transit_timeout_count.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.transit_timeout_starting_time
                .store(self.offset(now), Ordering::Release);
        }
        if !is_read_only {
            self.transit_timeout_write_count
                .fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> TimestampsSnapshot {
        TimestampsSnapshot {
            last_channel_write_attempt: self.at(self.last_write_attempt.load(Ordering::Acquire)),
            last_channel_write: self.at(self.last_write.load(Ordering::Acquire)),
            last_channel_read: self.at(self.last_read.load(Ordering::Acquire)),
            transit_timeout_count: self.transit_timeout_count.load(Ordering::Acquire),
            transit_timeout_write_count: self.transit_timeout_write_count.load(Ordering::Acquire),
            transit_timeout_starting_time: match self
                .transit_timeout_starting_time
                .load(Ordering::Acquire)
            {
                UNSET => None,
                nanos => Some(self.at(nanos)),
            },
        }
    }

    fn offset(&self, now: Instant) -> u64 {
        let nanos = now.saturating_duration_since(self.origin).as_nanos();
        u64::try_from(nanos).unwrap_or(UNSET - 1).min(UNSET - 1)
    }

    fn at(&self, nanos: u64) -> Instant {
        self.origin + Duration::from_nanos(nanos)
    }
}

/// 某一时刻读取的时间戳副本。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampsSnapshot {
    pub last_channel_write_attempt: Instant,
    pub last_channel_write: Instant,
    pub last_channel_read: Instant,
    pub transit_timeout_count: u32,
    pub transit_timeout_write_count: u32,
    pub transit_timeout_starting_time: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_clears_transit_timeouts() {
        let origin = Instant::now();
        let ts = ChannelTimestamps::new(origin);
        ts.transit_timeout(false, origin + Duration::from_secs(1));
        ts.transit_timeout(true, origin + Duration::from_secs(2));
        let snap = ts.snapshot();
        assert_eq!(snap.transit_timeout_count, 2);
        assert_eq!(snap.transit_timeout_write_count, 1);
        assert_eq!(
            snap.transit_timeout_starting_time,
            Some(origin + Duration::from_secs(1))
        );

        ts.channel_read_completed(origin + Duration::from_secs(3));
        let snap = ts.snapshot();
        assert_eq!(snap.transit_timeout_count, 0);
        assert_eq!(snap.transit_timeout_write_count, 0);
        assert_eq!(snap.transit_timeout_starting_time, None);
        assert_eq!(snap.last_channel_read, origin + Duration::from_secs(3));
    }

    #[test]
    fn attempt_and_completion_are_independent() {
        let origin = Instant::now();
        let ts = ChannelTimestamps::new(origin);
        ts.channel_write_completed(origin + Duration::from_millis(20));
        ts.channel_write_attempted(origin + Duration::from_millis(10));
        let snap = ts.snapshot();
        assert_eq!(snap.last_channel_write_attempt, origin + Duration::from_millis(10));
        assert_eq!(snap.last_channel_write, origin + Duration::from_millis(20));
    }

    #[test]
    fn instants_before_origin_saturate() {
        let origin = Instant::now() + Duration::from_secs(1);
        let ts = ChannelTimestamps::new(origin);
        ts.channel_write_attempted(Instant::now());
        assert_eq!(ts.snapshot().last_channel_write_attempt, origin);
    }
}
