//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 直连传输对外只交付两种终态：成功的响应，或恰好一个终结错误；
//! - 错误必须携带“能否安全重试”的信号：读请求或尚未上线的写请求可以换副本重发，
//!   已经开始发送的写请求则结果未知，盲目重试会造成重复写入。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可直接与 `?` 协作；
//! - 每个变体映射到稳定错误码（`rntbd.*`）与 [`ErrorClass`]；
//! - 超时被拆成 [`TransportError::Gone`]（安全重试）与 [`TransportError::RequestTimeout`]
//!   （结果未知），两者绝不合并。
//!
//! ## 扩展建议（How）
//! - 上层重试编排只需读取 [`TransportError::is_safe_to_retry`] 与 [`TransportError::class`]；
//! - 新增变体时同步补全 `code` 与 `class` 的匹配分支。

use std::borrow::Cow;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::operation::OperationType;
use crate::record::{CorrelationId, RequestTimeline};
use crate::token::{Guid, TokenType};

/// 帧或令牌解码失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// 缓冲剩余字节不足以读取下一个字段。
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// 线上出现未登记的令牌类型，无法推导值长度。
    #[error("invalid token type id {type_id:#04x}")]
    InvalidTokenType { type_id: u8 },

    /// 字段实际类型与读取方期望不符。
    #[error("token {id:#06x} has type {actual:?}, expected {expected:?}")]
    TokenTypeMismatch {
        id: u16,
        expected: TokenType,
        actual: TokenType,
    },

    /// 变长值超出长度前缀可表达的范围。
    #[error("{len} bytes do not fit a {token_type:?} token")]
    ValueTooLong { token_type: TokenType, len: usize },

    #[error("string token is not valid UTF-8")]
    InvalidUtf8,

    /// 帧长度字段声明的长度不合法（过小或超过上限）。
    #[error("frame length {len} outside of [{min}, {max}]")]
    FrameLength { len: usize, min: usize, max: usize },

    /// 帧头缺少必需字段。
    #[error("required header token {id:#06x} is missing")]
    MissingToken { id: u16 },
}

/// 错误的处置大类，供上层重试编排使用。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// 通道级故障：本层不重试，交给路由/重试层。
    Transport,
    /// 服务端返回的错误帧。
    Protocol,
    /// 请求在途超时但可以安全换副本重试。
    SafeRetryTimeout,
    /// 请求在途超时且结果未知。
    AmbiguousTimeout,
    /// 调用方主动取消。
    Cancelled,
    /// 通道待处理请求已满。
    Backpressure,
}

/// 直连传输的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把传输、协议、超时、取消四类终态收敛到一个枚举，使调用方可以对
///   每个请求恰好接收一个终结错误；
/// - **契约 (What)**：
///   - 变体均为 `Send + Sync + 'static`；
///   - [`code`](Self::code) 返回稳定错误码，[`class`](Self::class) 返回处置大类；
///   - [`is_safe_to_retry`](Self::is_safe_to_retry) 只对 `Gone` 与 `PendingRequestLimit` 为真；
/// - **风险 (Trade-offs)**：`Io` 持有 `io::Error`，因此整个枚举不实现 `Clone`；需要广播同一
///   故障时（例如通道关闭）由调用点为每个请求重新构造。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// 通道已关闭，待处理请求被强制失败。
    #[error("channel closed: {reason}")]
    ChannelClosed { reason: Arc<str> },

    /// 底层 IO 失败。
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// 建连或协商阶段超过时限。
    #[error("{operation} timed out")]
    ConnectTimeout { operation: &'static str },

    /// 上下文协商被服务端拒绝。
    #[error("context negotiation rejected with status {status}: {message}")]
    ContextNegotiation { status: u32, message: String },

    /// 服务端返回非成功状态的响应帧。
    #[error("store responded {status}/{sub_status} for activity {activity_id}: {message}")]
    Store {
        status: u32,
        sub_status: u32,
        activity_id: Guid,
        message: String,
    },

    /// 请求在途过期，但可安全换副本重试（只读请求，或写请求尚未上线）。
    #[error(
        "request {correlation_id} ({operation:?}) expired before a response; replica is gone, safe to retry (send started: {send_started})"
    )]
    Gone {
        correlation_id: CorrelationId,
        operation: OperationType,
        send_started: bool,
        timeline: RequestTimeline,
    },

    /// 写请求已开始发送后过期，服务端可能已经执行。
    #[error(
        "request {correlation_id} ({operation:?}) timed out after it started sending; outcome unknown"
    )]
    RequestTimeout {
        correlation_id: CorrelationId,
        operation: OperationType,
        timeline: RequestTimeline,
    },

    /// 调用方取消了请求。
    #[error("request {correlation_id} cancelled")]
    Cancelled { correlation_id: CorrelationId },

    /// 单通道待处理请求达到上限。
    #[error("pending request limit of {limit} reached on channel")]
    PendingRequestLimit { limit: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// 构造通道关闭错误。
    pub fn channel_closed(reason: impl Into<Cow<'static, str>>) -> Self {
        let reason: Cow<'static, str> = reason.into();
        TransportError::ChannelClosed {
            reason: Arc::from(reason.as_ref()),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::ChannelClosed { .. } => "rntbd.channel.closed",
            TransportError::Io { .. } => "rntbd.channel.io",
            TransportError::ConnectTimeout { .. } => "rntbd.channel.connect_timeout",
            TransportError::ContextNegotiation { .. } => "rntbd.channel.context_rejected",
            TransportError::Store { .. } => "rntbd.store.status",
            TransportError::Gone { .. } => "rntbd.request.gone",
            TransportError::RequestTimeout { .. } => "rntbd.request.timeout",
            TransportError::Cancelled { .. } => "rntbd.request.cancelled",
            TransportError::PendingRequestLimit { .. } => "rntbd.request.pending_limit",
            TransportError::Codec(_) => "rntbd.codec.invalid_frame",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::ChannelClosed { .. }
            | TransportError::Io { .. }
            | TransportError::ConnectTimeout { .. }
            | TransportError::ContextNegotiation { .. } => ErrorClass::Transport,
            TransportError::Store { .. } | TransportError::Codec(_) => ErrorClass::Protocol,
            TransportError::Gone { .. } => ErrorClass::SafeRetryTimeout,
            TransportError::RequestTimeout { .. } => ErrorClass::AmbiguousTimeout,
            TransportError::Cancelled { .. } => ErrorClass::Cancelled,
            TransportError::PendingRequestLimit { .. } => ErrorClass::Backpressure,
        }
    }

    /// 调用方能否不做幂等校验直接换副本重发。
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::SafeRetryTimeout | ErrorClass::Backpressure
        )
    }

    /// 是否为在途超时（无论安全与否）。
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::SafeRetryTimeout | ErrorClass::AmbiguousTimeout
        )
    }

    /// 过期请求在各阶段的到达时刻（仅 `Gone` 与 `RequestTimeout`）。
    pub fn timeline(&self) -> Option<&RequestTimeline> {
        match self {
            TransportError::Gone { timeline, .. }
            | TransportError::RequestTimeout { timeline, .. } => Some(timeline),
            _ => None,
        }
    }

    pub(crate) fn with_timeline(mut self, value: RequestTimeline) -> Self {
        if let TransportError::Gone { timeline, .. }
        | TransportError::RequestTimeout { timeline, .. } = &mut self
        {
            *timeline = value;
        }
        self
    }

    /// 服务端状态码（仅 `Store` 变体）。
    pub fn status(&self) -> Option<u32> {
        match self {
            TransportError::Store { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 配置校验或解析失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to parse endpoint configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 框架统一的返回值别名。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> CorrelationId {
        CorrelationId::from_raw(7)
    }

    #[test]
    fn only_gone_and_backpressure_are_safe() {
        let gone = TransportError::Gone {
            correlation_id: id(),
            operation: OperationType::Create,
            send_started: false,
            timeline: RequestTimeline::new(std::time::Instant::now()),
        };
        let ambiguous = TransportError::RequestTimeout {
            correlation_id: id(),
            operation: OperationType::Create,
            timeline: RequestTimeline::new(std::time::Instant::now()),
        };
        assert!(gone.is_safe_to_retry());
        assert!(TransportError::PendingRequestLimit { limit: 1 }.is_safe_to_retry());
        assert!(!ambiguous.is_safe_to_retry());
        assert!(!TransportError::channel_closed("eof").is_safe_to_retry());
        assert!(gone.is_timeout() && ambiguous.is_timeout());
        assert_ne!(gone.class(), ambiguous.class());
        assert!(gone.timeline().is_some());
        assert!(TransportError::channel_closed("eof").timeline().is_none());
    }

    #[test]
    fn codec_errors_convert_with_question_mark() {
        fn parse() -> Result<()> {
            Err(CodecError::InvalidUtf8)?
        }
        let err = parse().unwrap_err();
        assert_eq!(err.code(), "rntbd.codec.invalid_frame");
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn store_error_exposes_status() {
        let err = TransportError::Store {
            status: 429,
            sub_status: 3200,
            activity_id: Guid::NIL,
            message: "throttled".into(),
        };
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("429/3200"));
    }
}
