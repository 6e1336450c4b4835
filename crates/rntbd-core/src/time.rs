//! 可注入时钟。
//!
//! # 教案式说明
//! - **意图 (Why)**：健康判定与请求过期全部是“现在减去某个时间戳”的比较；若直接读取系统
//!   时钟，挂起检测类测试只能真实等待数十秒。通过 [`Clock`] 注入时间源，生产环境使用
//!   [`SystemClock`]，测试使用可手动推进的 [`MockClock`]；
//! - **契约 (What)**：`now` 单调不减；`sleep` 返回的 Future 至少等待给定时长后完成；
//! - **权衡 (Trade-offs)**：[`SystemClock::sleep`] 委托给 Tokio 定时器，必须在 Tokio 运行时内轮询。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 时钟接口返回的统一睡眠 Future。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 可注入的单调时间源。
///
/// 组件统一以 `Arc<dyn Clock>` 持有时钟。
pub trait Clock: Send + Sync + 'static {
    /// 当前单调时间点。
    fn now(&self) -> Instant;

    /// 在 `duration` 之后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 系统时钟：`now` 读取 [`Instant::now`]，`sleep` 委托 `tokio::time::sleep`。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 虚拟时钟：时间只在调用 [`advance`](MockClock::advance) 时前进。
///
/// # 教案式说明
/// - **意图 (Why)**：让“65 秒读挂起”“10 秒高频过期”这类场景在测试中瞬间复现；
/// - **逻辑 (How)**：一把锁保护偏移量与定时器表；睡眠在创建时登记，轮询时在同一把锁下
///   比较截止时间并更新 waker，`advance` 摘除全部到期项后在锁外唤醒；
/// - **契约 (What)**：克隆体共享同一时间线；定时器表只含未到期且未丢弃的睡眠。
#[derive(Clone, Debug)]
pub struct MockClock {
    timers: Arc<Mutex<TimerTable>>,
}

#[derive(Debug)]
struct TimerTable {
    origin: Instant,
    offset: Duration,
    next_key: u64,
    armed: HashMap<u64, Timer>,
}

#[derive(Debug)]
struct Timer {
    due: Duration,
    waker: Option<Waker>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(TimerTable {
                origin: Instant::now(),
                offset: Duration::ZERO,
                next_key: 0,
                armed: HashMap::new(),
            })),
        }
    }

    /// 推进时间并唤醒到期的睡眠。
    pub fn advance(&self, delta: Duration) {
        let fired: Vec<Waker> = {
            let mut table = self.timers.lock();
            table.offset = table.offset.saturating_add(delta);
            let offset = table.offset;
            let due: Vec<u64> = table
                .armed
                .iter()
                .filter(|(_, timer)| timer.due <= offset)
                .map(|(key, _)| *key)
                .collect();
            due.into_iter()
                .filter_map(|key| table.armed.remove(&key).and_then(|timer| timer.waker))
                .collect()
        };
        fired.into_iter().for_each(Waker::wake);
    }

    /// 尚未到期的睡眠数量，测试据此确认驱动任务已挂上定时器。
    pub fn pending_sleepers(&self) -> usize {
        self.timers.lock().armed.len()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let table = self.timers.lock();
        table.origin + table.offset
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut table = self.timers.lock();
        let key = table.next_key;
        table.next_key += 1;
        let due = table.offset.saturating_add(duration);
        if !duration.is_zero() {
            table.armed.insert(key, Timer { due, waker: None });
        }
        Box::pin(MockSleep {
            timers: Arc::clone(&self.timers),
            key,
            due,
        })
    }
}

struct MockSleep {
    timers: Arc<Mutex<TimerTable>>,
    key: u64,
    due: Duration,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut table = self.timers.lock();
        if table.offset >= self.due {
            table.armed.remove(&self.key);
            return Poll::Ready(());
        }
        if let Some(timer) = table.armed.get_mut(&self.key) {
            timer.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        self.timers.lock().armed.remove(&self.key);
    }
}
