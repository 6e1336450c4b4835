//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 健康判定与请求过期的全部阈值集中在 [`EndpointConfig`]；
//! - 配置在端点构造时确定，之后以 `Arc<EndpointConfig>` 只读共享，运行期不可变。
//!
//! ## 使用方式（How）
//! - 代码中通过 [`EndpointConfig::builder`] 覆盖个别字段，`build` 时统一校验；
//! - 部署时可从扁平 TOML 解析，时长字段以毫秒表示（`*_ms`），未出现的字段取默认值：
//!
//! ```toml
//! request_timeout_ms = 3000
//! receive_hang_detection_time_ms = 65000
//! timeout_detection_high_frequency_threshold = 3
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 单个副本端点的传输配置。
///
/// # 教案式注释
/// - **契约 (What)**：所有时长严格大于零，计数阈值至少为 1；`idle_connection_timeout`
///   为 `None` 时不做空闲判定；
/// - **注意事项 (Trade-offs)**：`receive_hang_detection_time` 必须长于服务端最长的合法处理
///   时间，否则慢查询会被误判为读挂起。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    request_timeout: Duration,
    connect_timeout: Duration,
    write_hang_grace_period: Duration,
    send_hang_detection_time: Duration,
    read_hang_grace_period: Duration,
    receive_hang_detection_time: Duration,
    recent_read_window: Duration,
    high_frequency_threshold: u32,
    high_frequency_time_limit: Duration,
    on_write_threshold: u32,
    on_write_time_limit: Duration,
    idle_connection_timeout: Option<Duration>,
    max_requests_per_channel: usize,
    max_frame_len: usize,
    user_agent: String,
}

impl EndpointConfig {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_WRITE_HANG_GRACE_PERIOD: Duration = Duration::from_secs(2);
    pub const DEFAULT_SEND_HANG_DETECTION_TIME: Duration = Duration::from_secs(10);
    pub const DEFAULT_READ_HANG_GRACE_PERIOD: Duration = Duration::from_secs(45);
    pub const DEFAULT_RECEIVE_HANG_DETECTION_TIME: Duration = Duration::from_secs(65);
    pub const DEFAULT_RECENT_READ_WINDOW: Duration = Duration::from_secs(1);
    pub const DEFAULT_HIGH_FREQUENCY_THRESHOLD: u32 = 3;
    pub const DEFAULT_HIGH_FREQUENCY_TIME_LIMIT: Duration = Duration::from_secs(10);
    pub const DEFAULT_ON_WRITE_THRESHOLD: u32 = 1;
    pub const DEFAULT_ON_WRITE_TIME_LIMIT: Duration = Duration::from_secs(6);
    pub const DEFAULT_MAX_REQUESTS_PER_CHANNEL: usize = 30;
    pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

    pub fn builder() -> EndpointConfigBuilder {
        EndpointConfigBuilder {
            config: Self::default(),
        }
    }

    /// 解析扁平 TOML；未知字段视为错误。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawEndpointConfig = toml::from_str(input)?;
        raw.into_config()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_hang_grace_period(&self) -> Duration {
        self.write_hang_grace_period
    }

    pub fn send_hang_detection_time(&self) -> Duration {
        self.send_hang_detection_time
    }

    pub fn read_hang_grace_period(&self) -> Duration {
        self.read_hang_grace_period
    }

    pub fn receive_hang_detection_time(&self) -> Duration {
        self.receive_hang_detection_time
    }

    pub fn recent_read_window(&self) -> Duration {
        self.recent_read_window
    }

    pub fn timeout_detection_high_frequency_threshold(&self) -> u32 {
        self.high_frequency_threshold
    }

    pub fn timeout_detection_high_frequency_time_limit(&self) -> Duration {
        self.high_frequency_time_limit
    }

    pub fn timeout_detection_on_write_threshold(&self) -> u32 {
        self.on_write_threshold
    }

    pub fn timeout_detection_on_write_time_limit(&self) -> Duration {
        self.on_write_time_limit
    }

    pub fn idle_connection_timeout(&self) -> Option<Duration> {
        self.idle_connection_timeout
    }

    pub fn max_requests_per_channel(&self) -> usize {
        self.max_requests_per_channel
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("connect_timeout", self.connect_timeout),
            ("write_hang_grace_period", self.write_hang_grace_period),
            ("send_hang_detection_time", self.send_hang_detection_time),
            ("read_hang_grace_period", self.read_hang_grace_period),
            ("receive_hang_detection_time", self.receive_hang_detection_time),
            ("recent_read_window", self.recent_read_window),
            (
                "timeout_detection_high_frequency_time_limit",
                self.high_frequency_time_limit,
            ),
            (
                "timeout_detection_on_write_time_limit",
                self.on_write_time_limit,
            ),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(invalid(field, "duration must be greater than zero"));
            }
        }
        if self.idle_connection_timeout.is_some_and(|d| d.is_zero()) {
            return Err(invalid(
                "idle_connection_timeout",
                "duration must be greater than zero",
            ));
        }
        if self.high_frequency_threshold == 0 {
            return Err(invalid(
                "timeout_detection_high_frequency_threshold",
                "threshold must be at least 1",
            ));
        }
        if self.on_write_threshold == 0 {
            return Err(invalid(
                "timeout_detection_on_write_threshold",
                "threshold must be at least 1",
            ));
        }
        if self.max_requests_per_channel == 0 {
            return Err(invalid(
                "max_requests_per_channel",
                "limit must be at least 1",
            ));
        }
        if self.max_frame_len < crate::frame::FRAME_PREFIX_LEN {
            return Err(invalid(
                "max_frame_len",
                "limit must cover the fixed frame prefix",
            ));
        }
        if self.user_agent.len() > usize::from(u8::MAX) {
            return Err(invalid("user_agent", "must fit a small string token"));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            write_hang_grace_period: Self::DEFAULT_WRITE_HANG_GRACE_PERIOD,
            send_hang_detection_time: Self::DEFAULT_SEND_HANG_DETECTION_TIME,
            read_hang_grace_period: Self::DEFAULT_READ_HANG_GRACE_PERIOD,
            receive_hang_detection_time: Self::DEFAULT_RECEIVE_HANG_DETECTION_TIME,
            recent_read_window: Self::DEFAULT_RECENT_READ_WINDOW,
            high_frequency_threshold: Self::DEFAULT_HIGH_FREQUENCY_THRESHOLD,
            high_frequency_time_limit: Self::DEFAULT_HIGH_FREQUENCY_TIME_LIMIT,
            on_write_threshold: Self::DEFAULT_ON_WRITE_THRESHOLD,
            on_write_time_limit: Self::DEFAULT_ON_WRITE_TIME_LIMIT,
            idle_connection_timeout: None,
            max_requests_per_channel: Self::DEFAULT_MAX_REQUESTS_PER_CHANNEL,
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("rntbd-rust/{}", env!("CARGO_PKG_VERSION"))
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue { field, reason }
}

/// [`EndpointConfig`] 的构建器。
#[derive(Clone, Debug)]
pub struct EndpointConfigBuilder {
    config: EndpointConfig,
}

impl EndpointConfigBuilder {
    pub fn request_timeout(mut self, value: Duration) -> Self {
        self.config.request_timeout = value;
        self
    }

    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.config.connect_timeout = value;
        self
    }

    pub fn write_hang_grace_period(mut self, value: Duration) -> Self {
        self.config.write_hang_grace_period = value;
        self
    }

    pub fn send_hang_detection_time(mut self, value: Duration) -> Self {
        self.config.send_hang_detection_time = value;
        self
    }

    pub fn read_hang_grace_period(mut self, value: Duration) -> Self {
        self.config.read_hang_grace_period = value;
        self
    }

    pub fn receive_hang_detection_time(mut self, value: Duration) -> Self {
        self.config.receive_hang_detection_time = value;
        self
    }

    pub fn recent_read_window(mut self, value: Duration) -> Self {
        self.config.recent_read_window = value;
        self
    }

    pub fn timeout_detection_high_frequency_threshold(mut self, value: u32) -> Self {
        self.config.high_frequency_threshold = value;
        self
    }

    pub fn timeout_detection_high_frequency_time_limit(mut self, value: Duration) -> Self {
        self.config.high_frequency_time_limit = value;
        self
    }

    pub fn timeout_detection_on_write_threshold(mut self, value: u32) -> Self {
        self.config.on_write_threshold = value;
        self
    }

    pub fn timeout_detection_on_write_time_limit(mut self, value: Duration) -> Self {
        self.config.on_write_time_limit = value;
        self
    }

    pub fn idle_connection_timeout(mut self, value: Option<Duration>) -> Self {
        self.config.idle_connection_timeout = value;
        self
    }

    pub fn max_requests_per_channel(mut self, value: usize) -> Self {
        self.config.max_requests_per_channel = value;
        self
    }

    pub fn max_frame_len(mut self, value: usize) -> Self {
        self.config.max_frame_len = value;
        self
    }

    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        self.config.user_agent = value.into();
        self
    }

    pub fn build(self) -> Result<EndpointConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// TOML 线上形态：时长以毫秒表示，缺省字段保留默认值。
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEndpointConfig {
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    write_hang_grace_period_ms: Option<u64>,
    send_hang_detection_time_ms: Option<u64>,
    read_hang_grace_period_ms: Option<u64>,
    receive_hang_detection_time_ms: Option<u64>,
    recent_read_window_ms: Option<u64>,
    timeout_detection_high_frequency_threshold: Option<u32>,
    timeout_detection_high_frequency_time_limit_ms: Option<u64>,
    timeout_detection_on_write_threshold: Option<u32>,
    timeout_detection_on_write_time_limit_ms: Option<u64>,
    idle_connection_timeout_ms: Option<u64>,
    max_requests_per_channel: Option<usize>,
    max_frame_len: Option<usize>,
    user_agent: Option<String>,
}

impl RawEndpointConfig {
    fn into_config(self) -> Result<EndpointConfig, ConfigError> {
        let mut builder = EndpointConfig::builder();
        let ms = Duration::from_millis;
        if let Some(v) = self.request_timeout_ms {
            builder = builder.request_timeout(ms(v));
        }
        if let Some(v) = self.connect_timeout_ms {
            builder = builder.connect_timeout(ms(v));
        }
        if let Some(v) = self.write_hang_grace_period_ms {
            builder = builder.write_hang_grace_period(ms(v));
        }
        if let Some(v) = self.send_hang_detection_time_ms {
            builder = builder.send_hang_detection_time(ms(v));
        }
        if let Some(v) = self.read_hang_grace_period_ms {
            builder = builder.read_hang_grace_period(ms(v));
        }
        if let Some(v) = self.receive_hang_detection_time_ms {
            builder = builder.receive_hang_detection_time(ms(v));
        }
        if let Some(v) = self.recent_read_window_ms {
            builder = builder.recent_read_window(ms(v));
        }
        if let Some(v) = self.timeout_detection_high_frequency_threshold {
            builder = builder.timeout_detection_high_frequency_threshold(v);
        }
        if let Some(v) = self.timeout_detection_high_frequency_time_limit_ms {
            builder = builder.timeout_detection_high_frequency_time_limit(ms(v));
        }
        if let Some(v) = self.timeout_detection_on_write_threshold {
            builder = builder.timeout_detection_on_write_threshold(v);
        }
        if let Some(v) = self.timeout_detection_on_write_time_limit_ms {
            builder = builder.timeout_detection_on_write_time_limit(ms(v));
        }
        if let Some(v) = self.idle_connection_timeout_ms {
            builder = builder.idle_connection_timeout(Some(ms(v)));
        }
        if let Some(v) = self.max_requests_per_channel {
            builder = builder.max_requests_per_channel(v);
        }
        if let Some(v) = self.max_frame_len {
            builder = builder.max_frame_len(v);
        }
        if let Some(v) = self.user_agent {
            builder = builder.user_agent(v);
        }
        builder.build()
    }
}
