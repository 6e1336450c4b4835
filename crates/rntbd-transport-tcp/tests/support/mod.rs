//! 进程内假副本：完成上下文协商后按预设模式应答。

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rntbd_core::{
    ContextRequest, ContextResponse, CorrelationId, FrameDecoder, RequestFrame, ResponseFrame,
    TokenValue, header::response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// 假副本的应答方式。
#[derive(Clone, Copy, Debug)]
pub enum Mode {
    /// 以 200 回显请求负载。
    Echo,
    /// 以给定状态码应答，不带负载。
    Status(u32),
    /// 收齐 n 个请求后逆序应答。
    Reverse(usize),
    /// 只读不答。
    Hang,
    /// 收到 n 个请求后断开连接。
    CloseAfter(usize),
    /// 以给定状态码拒绝上下文协商。
    RejectContext(u32),
}

pub struct FakeReplica {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<RequestFrame>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeReplica {
    pub async fn spawn(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake replica");
        let addr = listener.local_addr().expect("replica addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let task = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, mode, Arc::clone(&received)));
                }
            })
        };
        Self {
            addr,
            received,
            connections,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn received(&self) -> Vec<RequestFrame> {
        self.received.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeReplica {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn response_frame(id: CorrelationId, status: u32, payload: Option<Bytes>) -> Bytes {
    let mut frame = ResponseFrame::new(status, rntbd_core::Guid::NIL);
    frame
        .headers
        .push(response::TRANSPORT_REQUEST_ID, TokenValue::ULongLong(id.as_u64()));
    if let Some(payload) = payload {
        frame = frame.with_payload(payload);
    }
    frame.encode().expect("encode response")
}

/// 轮询条件直到成立，超过两秒视为失败。
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn serve(mut stream: TcpStream, mode: Mode, received: Arc<Mutex<Vec<RequestFrame>>>) {
    let mut decoder = FrameDecoder::new(1 << 20);
    let mut buf = BytesMut::new();
    let Some(frame) = next_frame(&mut stream, &mut decoder, &mut buf).await else {
        return;
    };
    let context = RequestFrame::decode(frame)
        .and_then(|frame| ContextRequest::from_frame(&frame))
        .expect("context request");
    let mut reply = ContextResponse::accepted(context.activity_id, "fake-replica");
    if let Mode::RejectContext(status) = mode {
        reply.status = status;
        reply.message = "unsupported client version".to_owned();
    }
    let encoded = reply.encode().expect("encode context");
    if stream.write_all(&encoded).await.is_err() || matches!(mode, Mode::RejectContext(_)) {
        return;
    }

    let mut held = Vec::new();
    while let Some(frame) = next_frame(&mut stream, &mut decoder, &mut buf).await {
        let request = RequestFrame::decode(frame).expect("request frame");
        let id = request.correlation_id().expect("correlation id");
        let payload = request.payload.clone();
        let count = {
            let mut log = received.lock();
            log.push(request);
            log.len()
        };
        let out = match mode {
            Mode::Echo => vec![response_frame(id, 200, payload)],
            Mode::Status(status) => vec![response_frame(id, status, None)],
            Mode::Reverse(n) => {
                held.push(response_frame(id, 200, payload));
                if held.len() == n {
                    held.drain(..).rev().collect()
                } else {
                    Vec::new()
                }
            }
            Mode::Hang => Vec::new(),
            Mode::CloseAfter(n) => {
                if count >= n {
                    return;
                }
                Vec::new()
            }
            Mode::RejectContext(_) => unreachable!(),
        };
        for frame in out {
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

async fn next_frame(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
) -> Option<Bytes> {
    loop {
        if let Some(frame) = decoder.decode(buf).ok()? {
            return Some(frame);
        }
        buf.reserve(4096);
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}
