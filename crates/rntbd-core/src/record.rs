//! # record 模块说明
//!
//! ## 角色定位（Why）
//! - 每个在途请求对应一条 [`RequestRecord`]，记录关联 ID、操作类型、截止时间以及
//!   “是否已开始发送”；过期时据此判定重试是否安全；
//! - 调用方持有 [`RequestHandle`]，它是一个恰好产出一次结果的 Future。
//!
//! ## 契约（What）
//! - `complete` / `complete_exceptionally` 幂等：首个终态获胜，之后的调用返回 `false`；
//! - [`RequestRecord::expire`] 的分类：只读操作或尚未开始发送 → [`TransportError::Gone`]；
//!   写操作且已开始发送 → [`TransportError::RequestTimeout`]；
//! - 丢弃未完成的 [`RequestHandle`] 等价于取消。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::frame::ResponseFrame;
use crate::header::TokenStream;
use crate::operation::{OperationType, ResourceType};
use crate::token::{Guid, TokenValue};

/// 通道内唯一的请求关联 ID。
///
/// 高 32 位为槽位代际，低 32 位为槽位下标；调用方应视其为不透明值。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 请求所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestStage {
    Created,
    Queued,
    Sending,
    Sent,
    Received,
    Completed,
}

/// 终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Succeeded,
    Failed,
}

/// 各阶段的到达时刻，用于诊断慢请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTimeline {
    pub created: Instant,
    pub queued: Option<Instant>,
    pub sending: Option<Instant>,
    pub sent: Option<Instant>,
    pub received: Option<Instant>,
    pub completed: Option<Instant>,
}

impl RequestTimeline {
    pub(crate) fn new(created: Instant) -> Self {
        Self {
            created,
            queued: None,
            sending: None,
            sent: None,
            received: None,
            completed: None,
        }
    }

    fn mark(&mut self, stage: RequestStage, at: Instant) {
        let slot = match stage {
            RequestStage::Created => return,
            RequestStage::Queued => &mut self.queued,
            RequestStage::Sending => &mut self.sending,
            RequestStage::Sent => &mut self.sent,
            RequestStage::Received => &mut self.received,
            RequestStage::Completed => &mut self.completed,
        };
        slot.get_or_insert(at);
    }

    /// 从创建到完成的耗时；未完成时返回 `None`。
    pub fn total(&self) -> Option<Duration> {
        self.completed.map(|at| at.saturating_duration_since(self.created))
    }
}

/// 调用方提交的请求描述。
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub activity_id: Guid,
    pub headers: TokenStream,
    pub payload: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(operation_type: OperationType, resource_type: ResourceType) -> Self {
        Self {
            operation_type,
            resource_type,
            activity_id: Guid::NIL,
            headers: TokenStream::new(),
            payload: None,
        }
    }

    pub fn with_activity_id(mut self, activity_id: Guid) -> Self {
        self.activity_id = activity_id;
        self
    }

    pub fn with_header(mut self, id: u16, value: TokenValue) -> Self {
        self.headers.push(id, value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// 成功响应。
#[derive(Clone, Debug, PartialEq)]
pub struct StoreResponse {
    pub status: u32,
    pub activity_id: Guid,
    pub headers: TokenStream,
    pub payload: Option<Bytes>,
    /// 经请求管理器交付时附带的阶段时间线。
    pub timeline: Option<RequestTimeline>,
}

impl From<ResponseFrame> for StoreResponse {
    fn from(frame: ResponseFrame) -> Self {
        Self {
            status: frame.status,
            activity_id: frame.activity_id,
            headers: frame.headers,
            payload: frame.payload,
            timeline: None,
        }
    }
}

pub(crate) type Reply = Result<StoreResponse, TransportError>;

/// 在途请求的状态记录，由请求管理器独占。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 超时后能否重试取决于两个事实：操作是否幂等，以及字节是否可能已经到达服务端；
///   记录在 `write` 时置位 `sending_started`，之后不再回退。
///
/// ## 契约 (What)
/// - 结果通过内部 oneshot 交付给 [`RequestHandle`]，仅交付一次；
/// - 句柄已被丢弃时交付静默失败，不影响终态迁移。
#[derive(Debug)]
pub struct RequestRecord {
    correlation_id: CorrelationId,
    operation_type: OperationType,
    resource_type: ResourceType,
    activity_id: Guid,
    deadline: Instant,
    sending_started: bool,
    stage: RequestStage,
    state: CompletionState,
    timeline: RequestTimeline,
    reply: Option<oneshot::Sender<Reply>>,
}

impl RequestRecord {
    /// 创建记录与配对的调用方句柄。
    pub fn new(
        correlation_id: CorrelationId,
        request: &OutboundRequest,
        created: Instant,
        timeout: Duration,
    ) -> (Self, RequestHandle) {
        let (tx, rx) = oneshot::channel();
        let record = Self {
            correlation_id,
            operation_type: request.operation_type,
            resource_type: request.resource_type,
            activity_id: request.activity_id,
            deadline: created + timeout,
            sending_started: false,
            stage: RequestStage::Created,
            state: CompletionState::Pending,
            timeline: RequestTimeline::new(created),
            reply: Some(tx),
        };
        let handle = RequestHandle {
            correlation_id,
            operation_type: request.operation_type,
            rx,
            on_cancel: None,
            finished: false,
        };
        (record, handle)
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn activity_id(&self) -> Guid {
        self.activity_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn sending_request_has_started(&self) -> bool {
        self.sending_started
    }

    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state != CompletionState::Pending
    }

    pub fn timeline(&self) -> &RequestTimeline {
        &self.timeline
    }

    /// 推进阶段；阶段只前进不后退，终态后忽略。
    pub(crate) fn advance(&mut self, stage: RequestStage, now: Instant) {
        if self.is_done() || stage <= self.stage {
            return;
        }
        if stage >= RequestStage::Sending {
            self.sending_started = true;
        }
        self.stage = stage;
        self.timeline.mark(stage, now);
    }

    /// 以成功响应完成；已完成时返回 `false`。
    pub fn complete(&mut self, response: StoreResponse, now: Instant) -> bool {
        self.finish(CompletionState::Succeeded, Ok(response), now)
    }

    /// 以错误完成；已完成时返回 `false`。
    pub fn complete_exceptionally(&mut self, error: TransportError, now: Instant) -> bool {
        self.finish(CompletionState::Failed, Err(error), now)
    }

    /// 过期：按重试安全性分类后以错误完成。
    pub fn expire(&mut self, now: Instant) -> bool {
        let error = self.expiry_error();
        self.complete_exceptionally(error, now)
    }

    /// 当前状态下过期会产生的错误。
    pub fn expiry_error(&self) -> TransportError {
        if self.operation_type.is_read_only() || !self.sending_started {
            TransportError::Gone {
                correlation_id: self.correlation_id,
                operation: self.operation_type,
                send_started: self.sending_started,
                timeline: self.timeline,
            }
        } else {
            TransportError::RequestTimeout {
                correlation_id: self.correlation_id,
                operation: self.operation_type,
                timeline: self.timeline,
            }
        }
    }

    fn finish(&mut self, state: CompletionState, reply: Reply, now: Instant) -> bool {
        if self.is_done() {
            return false;
        }
        self.state = state;
        self.stage = RequestStage::Completed;
        self.timeline.mark(RequestStage::Completed, now);
        let timeline = self.timeline;
        let reply = match reply {
            Ok(mut response) => {
                response.timeline = Some(timeline);
                Ok(response)
            }
            Err(error) => Err(error.with_timeline(timeline)),
        };
        if let Some(tx) = self.reply.take() {
            // 句柄已丢弃时发送失败，终态仍然成立。
            let _ = tx.send(reply);
        }
        true
    }
}

type CancelHook = Box<dyn FnOnce(CorrelationId) + Send + 'static>;

/// 调用方持有的请求句柄，`await` 得到唯一结果。
///
/// 未完成即被丢弃时触发取消钩子，驱动任务据此移除记录。
pub struct RequestHandle {
    correlation_id: CorrelationId,
    operation_type: OperationType,
    rx: oneshot::Receiver<Reply>,
    on_cancel: Option<CancelHook>,
    finished: bool,
}

impl RequestHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// 登记取消钩子，替换已有的钩子。
    pub fn set_cancel_hook(&mut self, hook: impl FnOnce(CorrelationId) + Send + 'static) {
        self.on_cancel = Some(Box::new(hook));
    }

    /// 主动取消；结果已送达时无效果。
    pub fn cancel(self) {
        drop(self);
    }

    /// 非阻塞地获取结果，结果尚未送达时返回 `None`。
    pub fn try_result(&mut self) -> Option<Reply> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(reply) => {
                self.finish();
                Some(reply)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.finish();
                Some(Err(abandoned()))
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.on_cancel = None;
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("correlation_id", &self.correlation_id)
            .field("operation_type", &self.operation_type)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Future for RequestHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.finish();
                Poll::Ready(result.unwrap_or_else(|_| Err(abandoned())))
            }
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(hook) = self.on_cancel.take() {
            hook(self.correlation_id);
        }
    }
}

fn abandoned() -> TransportError {
    TransportError::channel_closed("request abandoned by channel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::status;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn record(op: OperationType) -> (RequestRecord, RequestHandle) {
        RequestRecord::new(
            CorrelationId::from_raw(1),
            &OutboundRequest::new(op, ResourceType::Document),
            Instant::now(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn stages_only_move_forward() {
        let (mut rec, _handle) = record(OperationType::Create);
        let now = Instant::now();
        rec.advance(RequestStage::Sent, now);
        rec.advance(RequestStage::Queued, now);
        assert_eq!(rec.stage(), RequestStage::Sent);
        assert!(rec.sending_request_has_started());
        assert!(rec.timeline().queued.is_none());
    }

    #[test]
    fn first_completion_wins() {
        let (mut rec, mut handle) = record(OperationType::Read);
        let now = Instant::now();
        let ok = StoreResponse::from(ResponseFrame::new(status::OK, Guid::NIL));
        assert!(rec.complete(ok.clone(), now));
        assert!(!rec.complete(ok, now));
        assert!(!rec.complete_exceptionally(TransportError::channel_closed("late"), now));
        assert_eq!(rec.state(), CompletionState::Succeeded);
        assert!(matches!(handle.try_result(), Some(Ok(_))));
    }

    #[test]
    fn dropping_an_unfinished_handle_fires_cancel_hook() {
        let (_rec, mut handle) = record(OperationType::Read);
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        handle.set_cancel_hook(move |id| sink.store(id.as_u64(), Ordering::SeqCst));
        drop(handle);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completed_handle_does_not_cancel() {
        let (mut rec, mut handle) = record(OperationType::Read);
        let fired = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&fired);
        handle.set_cancel_hook(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        rec.expire(Instant::now());
        let reply = futures::executor::block_on(handle);
        assert!(matches!(reply, Err(TransportError::Gone { .. })));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_record_surfaces_channel_closed() {
        let (rec, handle) = record(OperationType::Read);
        drop(rec);
        let reply = futures::executor::block_on(handle);
        assert!(matches!(reply, Err(TransportError::ChannelClosed { .. })));
    }
}
