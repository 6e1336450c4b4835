//! 每通道一个的驱动任务。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - [`RequestManager`] 取 `&mut self`，由单一任务独占即可免锁；调用方、取消钩子、套接字读端、
//!   写完成与过期定时器都通过 `select!` 汇入同一个循环。
//!
//! ## 逻辑 (How)
//! - 命令队列（有界）：注册请求、排空、关闭、查询统计；
//! - 取消队列（无界）：句柄在 `Drop` 中同步投递，不能等待；
//! - 写完成：[`FuturesUnordered`] 聚合写出任务返回的完成 Future；
//! - 读端：增量分帧后逐帧交给管理器；
//! - 定时器：按最早截止时间睡眠，醒来后批量过期。
//!
//! ## 契约 (What)
//! - 循环退出前一定调用 `manager.close`，所有在途请求都会得到终结错误；
//! - 退出后置位 `closed`，健康检查据此报告 `ChannelClosed`。

use crate::error::{READ, WRITE, is_disconnect, map_io_error};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rntbd_core::{
    ChannelState, Clock, CorrelationId, FrameDecoder, FrameTransport, OutboundRequest,
    RequestHandle, RequestManager, Sleep, TransportError, WriteCompletion,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// 驱动任务的运行时统计。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStats {
    pub state: ChannelState,
    pub pending_requests: usize,
    pub unmatched_responses: u64,
}

pub(crate) enum Command {
    Send {
        request: OutboundRequest,
        reply: oneshot::Sender<Result<RequestHandle, TransportError>>,
    },
    Drain,
    Close {
        reason: String,
    },
    Stats(oneshot::Sender<ChannelStats>),
}

type WriteResult = (CorrelationId, Result<(), TransportError>);
type PendingWrite = Pin<Box<dyn Future<Output = WriteResult> + Send>>;

enum WriterMessage {
    Frame {
        frame: Bytes,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown,
}

/// 出站方向：按提交顺序写出帧的后台任务句柄。
#[derive(Clone)]
pub(crate) struct FrameWriter {
    jobs: mpsc::UnboundedSender<WriterMessage>,
}

impl FrameWriter {
    pub(crate) fn spawn(mut half: OwnedWriteHalf) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Frame { frame, done } => {
                        let result = half
                            .write_all(&frame)
                            .await
                            .map_err(|err| map_io_error(WRITE, err));
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            break;
                        }
                    }
                    WriterMessage::Shutdown => {
                        let _ = half.shutdown().await;
                        break;
                    }
                }
            }
        });
        Self { jobs }
    }
}

impl FrameTransport for FrameWriter {
    fn write(&self, frame: Bytes) -> WriteCompletion {
        let (done, rx) = oneshot::channel();
        if self.jobs.send(WriterMessage::Frame { frame, done }).is_err() {
            return Box::pin(async { Err(writer_stopped()) });
        }
        Box::pin(async move { rx.await.unwrap_or_else(|_| Err(writer_stopped())) })
    }

    fn close(&self) {
        let _ = self.jobs.send(WriterMessage::Shutdown);
    }
}

fn writer_stopped() -> TransportError {
    TransportError::channel_closed("writer task stopped")
}

pub(crate) struct Driver {
    pub(crate) manager: RequestManager,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) reader: OwnedReadHalf,
    pub(crate) writer: FrameWriter,
    pub(crate) decoder: FrameDecoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) commands: mpsc::Receiver<Command>,
    pub(crate) cancels: mpsc::UnboundedReceiver<CorrelationId>,
    pub(crate) cancel_tx: mpsc::UnboundedSender<CorrelationId>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) peer: String,
}

impl Driver {
    pub(crate) async fn run(mut self) {
        let mut writes: FuturesUnordered<PendingWrite> = FuturesUnordered::new();
        let reason = loop {
            if self.manager.is_drained() {
                break "channel drained".to_owned();
            }
            let tick = self.next_tick();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reason) = self.on_command(command, &mut writes) {
                            break reason;
                        }
                    }
                    None => break "channel handle dropped".to_owned(),
                },
                Some(id) = self.cancels.recv() => {
                    self.manager.cancel(id);
                }
                Some((id, result)) = writes.next(), if !writes.is_empty() => match result {
                    Ok(()) => self.manager.write_completed(id),
                    Err(error) => {
                        warn!(peer = %self.peer, code = WRITE.code, error = %error, "channel write failed");
                        let reason = format!("write failed: {error}");
                        self.manager.write_failed(id, error);
                        break reason;
                    }
                },
                read = self.reader.read_buf(&mut self.read_buf) => {
                    if let Some(reason) = self.on_read(read) {
                        break reason;
                    }
                }
                () = tick => {
                    self.manager.expire_overdue();
                }
            }
        };
        self.shutdown(&reason);
    }

    fn next_tick(&self) -> Sleep {
        match self.manager.next_deadline() {
            Some(deadline) => self
                .clock
                .sleep(deadline.saturating_duration_since(self.clock.now())),
            None => Box::pin(futures::future::pending()),
        }
    }

    fn on_command(
        &mut self,
        command: Command,
        writes: &mut FuturesUnordered<PendingWrite>,
    ) -> Option<String> {
        match command {
            Command::Send { request, reply } => {
                let registered = match self.manager.register(request) {
                    Ok(registered) => registered,
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return None;
                    }
                };
                let id = registered.correlation_id;
                let mut handle = registered.handle;
                let cancel_tx = self.cancel_tx.clone();
                handle.set_cancel_hook(move |id| {
                    let _ = cancel_tx.send(id);
                });
                if let Err(Ok(handle)) = reply.send(Ok(handle)) {
                    // 调用方已离开：丢弃句柄即投递取消，不再写出。
                    drop(handle);
                    return None;
                }
                if let Some(completion) = self.manager.write(id, registered.frame, &self.writer) {
                    writes.push(Box::pin(async move { (id, completion.await) }));
                }
                None
            }
            Command::Drain => {
                self.manager.drain();
                None
            }
            Command::Close { reason } => Some(reason),
            Command::Stats(reply) => {
                let _ = reply.send(ChannelStats {
                    state: self.manager.state(),
                    pending_requests: self.manager.pending_count(),
                    unmatched_responses: self.manager.unmatched_responses(),
                });
                None
            }
        }
    }

    fn on_read(&mut self, read: std::io::Result<usize>) -> Option<String> {
        match read {
            Ok(0) => return Some("peer closed the connection".to_owned()),
            Ok(_) => {}
            Err(err) => {
                if is_disconnect(&err) {
                    debug!(peer = %self.peer, error = %err, "peer disconnected");
                } else {
                    warn!(peer = %self.peer, code = READ.code, error = %err, "channel read failed");
                }
                return Some(map_io_error(READ, err).to_string());
            }
        }
        loop {
            let frame = match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if self.read_buf.capacity() - self.read_buf.len() < READ_CHUNK {
                        self.read_buf.reserve(READ_CHUNK);
                    }
                    return None;
                }
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "undecodable response stream");
                    return Some(format!("protocol error: {err}"));
                }
            };
            if let Err(err) = self.manager.channel_read(frame) {
                warn!(peer = %self.peer, error = %err, "invalid response frame");
                return Some(format!("protocol error: {err}"));
            }
        }
    }

    fn shutdown(mut self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let failed = self.manager.close(reason);
        self.writer.close();
        self.commands.close();
        // 关闭后仍在队列中的命令逐个拒绝。
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send { reply, .. } => {
                    let _ = reply.send(Err(TransportError::channel_closed(reason.to_owned())));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(ChannelStats {
                        state: self.manager.state(),
                        pending_requests: 0,
                        unmatched_responses: self.manager.unmatched_responses(),
                    });
                }
                Command::Drain | Command::Close { .. } => {}
            }
        }
        debug!(peer = %self.peer, reason, failed, "channel driver stopped");
    }
}
