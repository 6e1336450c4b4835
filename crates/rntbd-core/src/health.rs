//! # health 模块说明
//!
//! ## 角色定位（Why）
//! - TCP 连接可能在内核层面保持“已建立”，而对端早已停止读写；仅靠 IO 错误无法发现这类
//!   静默挂起的通道；
//! - [`ChannelHealthChecker`] 依据 [`ChannelTimestamps`] 的读写进度与在途过期统计给出判定，
//!   由连接池据此淘汰通道。
//!
//! ## 判定顺序（How）
//! 0. 最近窗口内读到过数据：健康；
//! 1. 写挂起：写尝试领先写完成超过 `send_hang_detection_time`，且尝试之后已过
//!    `write_hang_grace_period`；
//! 2. 读挂起：写完成领先读超过 `receive_hang_detection_time`，且写完成之后已过
//!    `read_hang_grace_period`；
//! 3. 高频过期：过期次数达到阈值，且距上次读超过时限；
//! 4. 写过期：写操作过期次数达到阈值，且距上次写完成超过时限；
//! 5. 空闲：配置了空闲时限且距上次读已超出；
//! 6. 其余情况健康。
//!
//! ## 契约（What）
//! - 判定是纯函数，不修改时间戳；
//! - 先取快照再读当前时间。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EndpointConfig;
use crate::time::Clock;
use crate::timestamps::{ChannelTimestamps, TimestampsSnapshot};

/// 通道不健康的原因，携带判定时测得的时长。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// 写尝试长时间没有完成。
    NonRespondingWrite {
        write_delay: Duration,
        write_hang: Duration,
    },
    /// 写完成后长时间没有读到任何数据。
    NonRespondingRead {
        read_delay: Duration,
        read_hang: Duration,
    },
    /// 自上次读以来发生了过多在途过期。
    TransitTimeoutHighFrequency {
        count: u32,
        since_last_read: Duration,
    },
    /// 写请求在途过期，且此后长时间没有读到任何数据。
    TransitTimeoutOnWrite {
        write_count: u32,
        since_last_read: Duration,
    },
    /// 超过空闲时限没有读到数据。
    Idle { idle_for: Duration },
    /// 驱动任务已退出。
    ChannelClosed,
}

impl UnhealthyReason {
    /// 稳定的简短标识，适合作为日志字段。
    pub fn code(&self) -> &'static str {
        match self {
            UnhealthyReason::NonRespondingWrite { .. } => "non_responding_write",
            UnhealthyReason::NonRespondingRead { .. } => "non_responding_read",
            UnhealthyReason::TransitTimeoutHighFrequency { .. } => "transit_timeout_high_frequency",
            UnhealthyReason::TransitTimeoutOnWrite { .. } => "transit_timeout_on_write",
            UnhealthyReason::Idle { .. } => "idle",
            UnhealthyReason::ChannelClosed => "channel_closed",
        }
    }
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::NonRespondingWrite {
                write_delay,
                write_hang,
            } => write!(
                f,
                "health check failed due to non-responding write: write attempt outpaced completion by {write_delay:?}, pending for {write_hang:?}"
            ),
            UnhealthyReason::NonRespondingRead {
                read_delay,
                read_hang,
            } => write!(
                f,
                "health check failed due to non-responding read: last read trails last write by {read_delay:?}, nothing read for {read_hang:?} since"
            ),
            UnhealthyReason::TransitTimeoutHighFrequency {
                count,
                since_last_read,
            } => write!(
                f,
                "health check failed due to transit timeout high frequency (non-responding read): {count} timeouts, last read {since_last_read:?} ago"
            ),
            UnhealthyReason::TransitTimeoutOnWrite {
                write_count,
                since_last_read,
            } => write!(
                f,
                "health check failed due to transit timeout on write: {write_count} write timeouts, last read {since_last_read:?} ago"
            ),
            UnhealthyReason::Idle { idle_for } => {
                write!(f, "channel idle for {idle_for:?}")
            }
            UnhealthyReason::ChannelClosed => f.write_str("channel closed"),
        }
    }
}

/// 健康判定结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthCheck {
    Healthy,
    Unhealthy(UnhealthyReason),
}

impl HealthCheck {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthCheck::Healthy)
    }

    pub fn reason(&self) -> Option<&UnhealthyReason> {
        match self {
            HealthCheck::Healthy => None,
            HealthCheck::Unhealthy(reason) => Some(reason),
        }
    }
}

/// 基于时间戳的通道健康检查器。
#[derive(Clone)]
pub struct ChannelHealthChecker {
    config: Arc<EndpointConfig>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ChannelHealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHealthChecker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelHealthChecker {
    pub fn new(config: Arc<EndpointConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn is_healthy(&self, timestamps: &ChannelTimestamps) -> bool {
        self.is_healthy_with_reason(timestamps).is_healthy()
    }

    pub fn is_healthy_with_reason(&self, timestamps: &ChannelTimestamps) -> HealthCheck {
        let snapshot = timestamps.snapshot();
        let now = self.clock.now();
        self.evaluate(&snapshot, now)
    }

    /// 对给定快照与时刻做判定。
    pub fn evaluate(&self, snapshot: &TimestampsSnapshot, now: Instant) -> HealthCheck {
        let config = &self.config;
        let since_last_read = now.saturating_duration_since(snapshot.last_channel_read);

        if since_last_read < config.recent_read_window() {
            return HealthCheck::Healthy;
        }

        let write_delay = snapshot
            .last_channel_write_attempt
            .saturating_duration_since(snapshot.last_channel_write);
        let write_hang = now.saturating_duration_since(snapshot.last_channel_write_attempt);
        if write_delay > config.send_hang_detection_time()
            && write_hang > config.write_hang_grace_period()
        {
            return HealthCheck::Unhealthy(UnhealthyReason::NonRespondingWrite {
                write_delay,
                write_hang,
            });
        }

        let read_delay = snapshot
            .last_channel_write
            .saturating_duration_since(snapshot.last_channel_read);
        let read_hang = now.saturating_duration_since(snapshot.last_channel_write);
        if read_delay > config.receive_hang_detection_time()
            && read_hang > config.read_hang_grace_period()
        {
            return HealthCheck::Unhealthy(UnhealthyReason::NonRespondingRead {
                read_delay,
                read_hang,
            });
        }

        if snapshot.transit_timeout_count >= config.timeout_detection_high_frequency_threshold()
            && since_last_read > config.timeout_detection_high_frequency_time_limit()
        {
            return HealthCheck::Unhealthy(UnhealthyReason::TransitTimeoutHighFrequency {
                count: snapshot.transit_timeout_count,
                since_last_read,
            });
        }

        if snapshot.transit_timeout_write_count >= config.timeout_detection_on_write_threshold()
            && since_last_read > config.timeout_detection_on_write_time_limit()
        {
            return HealthCheck::Unhealthy(UnhealthyReason::TransitTimeoutOnWrite {
                write_count: snapshot.transit_timeout_write_count,
                since_last_read,
            });
        }

        if let Some(idle_limit) = config.idle_connection_timeout()
            && since_last_read > idle_limit
        {
            return HealthCheck::Unhealthy(UnhealthyReason::Idle {
                idle_for: since_last_read,
            });
        }

        HealthCheck::Healthy
    }
}
