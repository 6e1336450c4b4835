//! # manager 模块说明
//!
//! ## 角色定位（Why）
//! - 一个通道上多路复用多个请求，响应可以乱序到达；[`RequestManager`] 负责分配关联 ID、
//!   记录读写进度、把响应交回正确的调用方，并在超时、取消、关闭时为每个请求产出恰好一个
//!   终结错误；
//! - 它同时是 [`ChannelTimestamps`] 的唯一写入方，健康检查读到的进度全部来自这里。
//!
//! ## 并发模型（How）
//! - 管理器不加锁，所有方法取 `&mut self`；TCP 绑定中由每通道一个的驱动任务独占；
//! - 时间戳以 `Arc` 共享，供任意线程上的健康检查无锁读取。
//!
//! ## 状态机（What）
//! - `Registered → Active`：上下文协商成功；
//! - `Registered | Active → Draining`：拒绝新请求，在途请求继续；
//! - 任意状态 `→ Closed`：全部在途请求以通道关闭失败，之后幂等。

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::error::TransportError;
use crate::frame::{RequestFrame, ResponseFrame};
use crate::header::request;
use crate::interfaces::{FrameTransport, WriteCompletion};
use crate::operation::OperationType;
use crate::pending::PendingTable;
use crate::record::{
    CorrelationId, OutboundRequest, RequestHandle, RequestRecord, RequestStage, StoreResponse,
};
use crate::time::Clock;
use crate::timestamps::ChannelTimestamps;
use crate::token::TokenValue;

/// 通道生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Registered,
    Active,
    Draining,
    Closed,
}

/// 注册成功的请求：关联 ID、待写出的帧与调用方句柄。
#[derive(Debug)]
pub struct RegisteredRequest {
    pub correlation_id: CorrelationId,
    pub frame: Bytes,
    pub handle: RequestHandle,
}

/// [`RequestManager::channel_read`] 的处理结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 响应交付给了对应请求。
    Completed(CorrelationId),
    /// 没有匹配的在途请求（已过期、已取消或未知 ID），响应被丢弃。
    Unmatched(CorrelationId),
}

/// 单通道请求管理器。
pub struct RequestManager {
    config: Arc<EndpointConfig>,
    clock: Arc<dyn Clock>,
    timestamps: Arc<ChannelTimestamps>,
    pending: PendingTable<RequestRecord>,
    state: ChannelState,
    close_reason: Option<Arc<str>>,
    unmatched_responses: u64,
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("unmatched_responses", &self.unmatched_responses)
            .finish_non_exhaustive()
    }
}

impl RequestManager {
    pub fn new(config: Arc<EndpointConfig>, clock: Arc<dyn Clock>) -> Self {
        let timestamps = Arc::new(ChannelTimestamps::new(clock.now()));
        Self {
            config,
            clock,
            timestamps,
            pending: PendingTable::new(),
            state: ChannelState::Registered,
            close_reason: None,
            unmatched_responses: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn timestamps(&self) -> &Arc<ChannelTimestamps> {
        &self.timestamps
    }

    pub fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.get(id).is_some()
    }

    /// 在途请求当前所处阶段。
    pub fn stage(&self, id: CorrelationId) -> Option<RequestStage> {
        self.pending.get(id).map(RequestRecord::stage)
    }

    /// 累计丢弃的无主响应数。
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched_responses
    }

    /// 处于排空状态且已无在途请求。
    pub fn is_drained(&self) -> bool {
        self.state == ChannelState::Draining && self.pending.len() == 0
    }

    /// 最早的请求截止时间，驱动任务据此安排下一次过期扫描。
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(RequestRecord::deadline).min()
    }

    /// 注册请求并编码出待写出的帧。
    ///
    /// # 错误
    /// - 通道排空或关闭：[`TransportError::ChannelClosed`]；
    /// - 在途请求达到上限：[`TransportError::PendingRequestLimit`]；
    /// - 帧头无法编码：[`TransportError::Codec`]，此时不留下任何记录。
    pub fn register(
        &mut self,
        request: OutboundRequest,
    ) -> Result<RegisteredRequest, TransportError> {
        match self.state {
            ChannelState::Registered | ChannelState::Active => {}
            ChannelState::Draining => {
                return Err(TransportError::channel_closed("channel is draining"));
            }
            ChannelState::Closed => return Err(self.closed_error()),
        }
        let limit = self.config.max_requests_per_channel();
        if self.pending.len() >= limit {
            return Err(TransportError::PendingRequestLimit { limit });
        }

        let now = self.clock.now();
        let timeout = self.config.request_timeout();
        let (correlation_id, handle) = self
            .pending
            .insert_with(|id| {
                let (mut record, handle) = RequestRecord::new(id, &request, now, timeout);
                record.advance(RequestStage::Queued, now);
                (record, handle)
            })
            .ok_or(TransportError::PendingRequestLimit { limit })?;

        let mut frame = RequestFrame {
            resource_type: request.resource_type,
            operation_type: request.operation_type,
            activity_id: request.activity_id,
            headers: request.headers,
            payload: request.payload,
        };
        frame.headers.remove(request::TRANSPORT_REQUEST_ID);
        frame.headers.push(
            request::TRANSPORT_REQUEST_ID,
            TokenValue::ULongLong(correlation_id.as_u64()),
        );
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                // 记录尚未交给调用方，直接移除，句柄随之丢弃。
                self.pending.remove(correlation_id);
                return Err(err.into());
            }
        };

        debug!(
            correlation_id = %correlation_id,
            operation = ?frame.operation_type,
            frame_len = encoded.len(),
            "request registered"
        );
        Ok(RegisteredRequest {
            correlation_id,
            frame: encoded,
            handle,
        })
    }

    /// 把帧交给出站通道：记录写尝试并标记请求开始发送。
    ///
    /// 请求已不在途（取消或过期）时不写出，返回 `None`。
    pub fn write(
        &mut self,
        id: CorrelationId,
        frame: Bytes,
        transport: &dyn FrameTransport,
    ) -> Option<WriteCompletion> {
        let now = self.clock.now();
        let record = self.pending.get_mut(id)?;
        record.advance(RequestStage::Sending, now);
        self.timestamps.channel_write_attempted(now);
        Some(transport.write(frame))
    }

    /// 帧已写出。请求可能已在写出期间结束，时间戳仍然更新。
    pub fn write_completed(&mut self, id: CorrelationId) {
        let now = self.clock.now();
        self.timestamps.channel_write_completed(now);
        if let Some(record) = self.pending.get_mut(id) {
            record.advance(RequestStage::Sent, now);
        }
    }

    /// 写出失败：以该错误结束请求。
    pub fn write_failed(&mut self, id: CorrelationId, error: TransportError) -> bool {
        let now = self.clock.now();
        match self.pending.remove(id) {
            Some(mut record) => {
                warn!(correlation_id = %id, error = %error, "request write failed");
                record.complete_exceptionally(error, now)
            }
            None => false,
        }
    }

    /// 处理一个完整的响应帧。
    ///
    /// 任何读到的帧都刷新读时间戳并清零过期统计；帧无法解码时返回错误，调用方应关闭通道。
    pub fn channel_read(&mut self, frame: Bytes) -> Result<ReadOutcome, TransportError> {
        let now = self.clock.now();
        self.timestamps.channel_read_completed(now);

        let id = ResponseFrame::peek_correlation_id(&frame)?;
        if self.pending.get(id).is_none() {
            self.unmatched_responses += 1;
            debug!(correlation_id = %id, "dropping response without a pending request");
            return Ok(ReadOutcome::Unmatched(id));
        }
        let response = ResponseFrame::decode(frame)?;
        let Some(mut record) = self.pending.remove(id) else {
            return Ok(ReadOutcome::Unmatched(id));
        };

        record.advance(RequestStage::Received, now);
        if response.is_success() {
            record.complete(StoreResponse::from(response), now);
        } else {
            debug!(correlation_id = %id, status = response.status, "store returned error status");
            record.complete_exceptionally(response.into_store_error(), now);
        }
        Ok(ReadOutcome::Completed(id))
    }

    /// 上下文协商成功：视为一次读，通道进入 `Active`。
    pub fn on_context_negotiated(&mut self) {
        self.timestamps.channel_read_completed(self.clock.now());
        if self.state == ChannelState::Registered {
            self.state = ChannelState::Active;
            debug!("channel context negotiated");
        }
    }

    /// 过期单个请求并计入在途过期统计。
    pub fn expire(&mut self, id: CorrelationId) -> bool {
        let now = self.clock.now();
        let Some(mut record) = self.pending.remove(id) else {
            return false;
        };
        let operation: OperationType = record.operation_type();
        self.timestamps
            .transit_timeout(operation.is_read_only(), now);
        let error = record.expiry_error();
        warn!(
            correlation_id = %id,
            operation = ?operation,
            send_started = record.sending_request_has_started(),
            safe_to_retry = error.is_safe_to_retry(),
            stage = ?record.stage(),
            age_ms = now.saturating_duration_since(record.timeline().created).as_millis() as u64,
            "request expired in transit"
        );
        record.complete_exceptionally(error, now)
    }

    /// 过期全部已到截止时间的请求，返回过期数量。
    pub fn expire_overdue(&mut self) -> usize {
        let now = self.clock.now();
        let overdue = self.pending.ids_where(|record| record.is_overdue(now));
        overdue.into_iter().filter(|id| self.expire(*id)).count()
    }

    /// 调用方取消；不计入在途过期统计。
    pub fn cancel(&mut self, id: CorrelationId) -> bool {
        let now = self.clock.now();
        match self.pending.remove(id) {
            Some(mut record) => {
                debug!(correlation_id = %id, "request cancelled");
                record.complete_exceptionally(
                    TransportError::Cancelled { correlation_id: id },
                    now,
                )
            }
            None => false,
        }
    }

    /// 拒绝新请求，保留在途请求。
    pub fn drain(&mut self) {
        if matches!(self.state, ChannelState::Registered | ChannelState::Active) {
            self.state = ChannelState::Draining;
            debug!(pending = self.pending.len(), "channel draining");
        }
    }

    /// 关闭通道并以通道关闭错误结束全部在途请求，返回被结束的数量。重复调用返回 0。
    pub fn close(&mut self, reason: &str) -> usize {
        if self.state == ChannelState::Closed {
            return 0;
        }
        self.state = ChannelState::Closed;
        let reason: Arc<str> = Arc::from(reason);
        self.close_reason = Some(Arc::clone(&reason));
        let now = self.clock.now();
        let records = self.pending.drain();
        let failed = records
            .into_iter()
            .map(|mut record| {
                record.complete_exceptionally(
                    TransportError::ChannelClosed {
                        reason: Arc::clone(&reason),
                    },
                    now,
                )
            })
            .filter(|failed| *failed)
            .count();
        if failed > 0 {
            warn!(reason = %reason, failed, "channel closed with pending requests");
        } else {
            debug!(reason = %reason, "channel closed");
        }
        failed
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ChannelClosed {
            reason: self
                .close_reason
                .clone()
                .unwrap_or_else(|| Arc::from("channel closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::response;
    use crate::operation::{ResourceType, status};
    use crate::time::MockClock;
    use crate::token::Guid;
    use std::time::Duration;

    struct NullTransport;

    impl FrameTransport for NullTransport {
        fn write(&self, _frame: Bytes) -> WriteCompletion {
            Box::pin(async { Ok(()) })
        }

        fn close(&self) {}
    }

    fn manager(config: EndpointConfig) -> (RequestManager, MockClock) {
        let clock = MockClock::new();
        (
            RequestManager::new(Arc::new(config), Arc::new(clock.clone())),
            clock,
        )
    }

    fn response_for(id: CorrelationId, status: u32) -> Bytes {
        let mut frame = ResponseFrame::new(status, Guid::NIL);
        frame
            .headers
            .push(response::TRANSPORT_REQUEST_ID, TokenValue::ULongLong(id.as_u64()));
        frame.encode().unwrap()
    }

    #[test]
    fn registered_frame_carries_correlation_id() {
        let (mut mgr, _clock) = manager(EndpointConfig::default());
        let req = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        let frame = RequestFrame::decode(req.frame).unwrap();
        assert_eq!(frame.correlation_id().unwrap(), req.correlation_id);
        assert_eq!(mgr.stage(req.correlation_id), Some(RequestStage::Queued));
    }

    #[test]
    fn pending_limit_applies_backpressure() {
        let config = EndpointConfig::builder()
            .max_requests_per_channel(2)
            .build()
            .unwrap();
        let (mut mgr, _clock) = manager(config);
        let _a = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        let _b = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        let err = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap_err();
        assert!(matches!(err, TransportError::PendingRequestLimit { limit: 2 }));
        assert!(err.is_safe_to_retry());
    }

    #[test]
    fn unmatched_response_is_counted_and_dropped() {
        let (mut mgr, _clock) = manager(EndpointConfig::default());
        let outcome = mgr
            .channel_read(response_for(CorrelationId::from_raw(99), status::OK))
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Unmatched(CorrelationId::from_raw(99)));
        assert_eq!(mgr.unmatched_responses(), 1);
    }

    #[test]
    fn late_response_after_expiry_is_unmatched() {
        let (mut mgr, clock) = manager(EndpointConfig::default());
        let req = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(mgr.expire_overdue(), 1);
        let outcome = mgr
            .channel_read(response_for(req.correlation_id, status::OK))
            .unwrap();
        assert!(matches!(outcome, ReadOutcome::Unmatched(_)));
    }

    #[test]
    fn write_is_skipped_for_cancelled_request() {
        let (mut mgr, _clock) = manager(EndpointConfig::default());
        let req = mgr
            .register(OutboundRequest::new(OperationType::Create, ResourceType::Document))
            .unwrap();
        assert!(mgr.cancel(req.correlation_id));
        assert!(mgr.write(req.correlation_id, req.frame, &NullTransport).is_none());
    }

    #[test]
    fn draining_refuses_new_work_but_keeps_in_flight() {
        let (mut mgr, _clock) = manager(EndpointConfig::default());
        let req = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        mgr.drain();
        assert!(
            mgr.register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
                .is_err()
        );
        assert!(!mgr.is_drained());
        mgr.channel_read(response_for(req.correlation_id, status::OK))
            .unwrap();
        assert!(mgr.is_drained());
    }

    #[test]
    fn next_deadline_tracks_oldest_request() {
        let (mut mgr, clock) = manager(EndpointConfig::default());
        assert!(mgr.next_deadline().is_none());
        let first_deadline = clock.now() + EndpointConfig::DEFAULT_REQUEST_TIMEOUT;
        let _a = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        clock.advance(Duration::from_secs(1));
        let _b = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap();
        assert_eq!(mgr.next_deadline(), Some(first_deadline));
    }

    #[test]
    fn register_after_close_reports_close_reason() {
        let (mut mgr, _clock) = manager(EndpointConfig::default());
        mgr.close("peer reset");
        let err = mgr
            .register(OutboundRequest::new(OperationType::Read, ResourceType::Document))
            .unwrap_err();
        assert!(err.to_string().contains("peer reset"));
    }
}
