use crate::{
    driver::{ChannelStats, Command, Driver, FrameWriter},
    error::{CONNECT, NEGOTIATE, SHUTDOWN, map_io_error},
    socket::TcpSocketConfig,
    util::{read_frame, run_with_deadline},
};
use bytes::BytesMut;
use parking_lot::Mutex;
use rntbd_core::{
    ChannelHealthChecker, ChannelTimestamps, Clock, ContextRequest, ContextResponse,
    EndpointConfig, FrameDecoder, Guid, HealthCheck, OutboundRequest, RequestHandle,
    RequestManager, ResponseFrame, StoreResponse, TransportError, UnhealthyReason,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

const COMMAND_QUEUE_DEPTH: usize = 64;

struct RntbdChannelInner {
    commands: mpsc::Sender<Command>,
    timestamps: Arc<ChannelTimestamps>,
    checker: ChannelHealthChecker,
    closed: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    context: ContextResponse,
    socket_config: TcpSocketConfig,
}

/// 到单个副本的 RNTBD 通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 一条 TCP 连接上多路复用多个请求，调用方只需提交请求并等待句柄；
/// - 读写、关联、过期全部由后台驱动任务完成，调用方线程不持有任何锁。
///
/// ## 逻辑 (How)
/// - `open`：建连（受 `connect_timeout` 约束）→ 套接字配置 → 上下文协商 → 拆分读写半部，
///   启动写出任务与驱动任务；
/// - `send`：经有界命令队列把请求交给驱动任务，换回 [`RequestHandle`]；
/// - `health`：在调用线程上直接读取共享时间戳做判定，不经过驱动任务。
///
/// ## 契约 (What)
/// - 克隆体共享同一连接；
/// - 驱动任务退出后（对端关闭、协议错误、显式关闭）所有在途请求得到
///   [`TransportError::ChannelClosed`]，`health` 报告 [`UnhealthyReason::ChannelClosed`]；
/// - 全部克隆体被丢弃时驱动任务随命令队列关闭而退出。
///
/// ## 注意事项 (Trade-offs)
/// - 命令队列有界，提交方在驱动任务繁忙时会被短暂挂起；
/// - 协商阶段的帧不经过请求管理器，也不计入读写时间戳之外的统计。
#[derive(Clone)]
pub struct RntbdChannel {
    inner: Arc<RntbdChannelInner>,
}

impl std::fmt::Debug for RntbdChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RntbdChannel")
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RntbdChannel {
    /// 以默认套接字配置建立通道。
    pub async fn open(
        addr: SocketAddr,
        config: Arc<EndpointConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransportError> {
        Self::open_with_config(addr, config, clock, TcpSocketConfig::default()).await
    }

    pub async fn open_with_config(
        addr: SocketAddr,
        config: Arc<EndpointConfig>,
        clock: Arc<dyn Clock>,
        socket_config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let mut stream =
            run_with_deadline(CONNECT, config.connect_timeout(), TcpStream::connect(addr)).await?;
        socket_config.apply(&stream)?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONNECT, err))?;

        let mut decoder = FrameDecoder::new(config.max_frame_len());
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        let context = negotiate(&mut stream, &config, &mut decoder, &mut read_buf).await?;
        debug!(
            peer = %addr,
            server_agent = %context.server_agent,
            protocol_version = context.protocol_version,
            "rntbd context negotiated"
        );

        let mut manager = RequestManager::new(Arc::clone(&config), Arc::clone(&clock));
        manager.on_context_negotiated();
        let timestamps = Arc::clone(manager.timestamps());

        let (reader, writer) = stream.into_split();
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (cancel_tx, cancels) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let driver = Driver {
            manager,
            clock: Arc::clone(&clock),
            reader,
            writer: FrameWriter::spawn(writer),
            decoder,
            read_buf,
            commands: commands_rx,
            cancels,
            cancel_tx,
            closed: Arc::clone(&closed),
            peer: addr.to_string(),
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            inner: Arc::new(RntbdChannelInner {
                commands,
                timestamps,
                checker: ChannelHealthChecker::new(config, clock),
                closed,
                driver: Mutex::new(Some(driver)),
                peer_addr: addr,
                local_addr,
                context,
                socket_config,
            }),
        })
    }

    /// 提交请求，返回等待响应的句柄。
    pub async fn send(&self, request: OutboundRequest) -> Result<RequestHandle, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Send { request, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// 提交请求并等待唯一结果。
    pub async fn request(&self, request: OutboundRequest) -> Result<StoreResponse, TransportError> {
        self.send(request).await?.await
    }

    pub fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }

    /// 健康判定；驱动任务已退出时直接报告通道关闭。
    pub fn health(&self) -> HealthCheck {
        if self.is_closed() {
            return HealthCheck::Unhealthy(UnhealthyReason::ChannelClosed);
        }
        let verdict = self.inner.checker.is_healthy_with_reason(&self.inner.timestamps);
        if let HealthCheck::Unhealthy(reason) = &verdict {
            warn!(
                peer = %self.inner.peer_addr,
                reason = reason.code(),
                detail = %reason,
                "channel failed health check"
            );
        }
        verdict
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 停止接收新请求，在途请求完成后通道自行关闭。
    pub async fn drain(&self) {
        let _ = self.inner.commands.send(Command::Drain).await;
    }

    /// 关闭通道并等待驱动任务退出；在途请求以通道关闭失败。
    pub async fn close(&self) -> Result<(), TransportError> {
        let _ = self
            .inner
            .commands
            .send(Command::Close {
                reason: "channel closed by owner".to_owned(),
            })
            .await;
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            driver.await.map_err(|err| {
                map_io_error(SHUTDOWN, std::io::Error::other(err.to_string()))
            })?;
        }
        Ok(())
    }

    /// 驱动任务的运行时统计。
    pub async fn stats(&self) -> Result<ChannelStats, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Stats(reply))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    pub fn timestamps(&self) -> &Arc<ChannelTimestamps> {
        &self.inner.timestamps
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// 服务端在协商中声明的身份。
    pub fn context(&self) -> &ContextResponse {
        &self.inner.context
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.inner.socket_config
    }
}

fn closed() -> TransportError {
    TransportError::channel_closed("channel driver stopped")
}

/// 发送上下文请求并等待协商结果，整体受 `connect_timeout` 约束。
async fn negotiate(
    stream: &mut TcpStream,
    config: &EndpointConfig,
    decoder: &mut FrameDecoder,
    read_buf: &mut BytesMut,
) -> Result<ContextResponse, TransportError> {
    let request = ContextRequest::new(Guid::from_u128(random_activity()), config.user_agent());
    let frame = request.encode()?;
    let exchange = async {
        stream
            .write_all(&frame)
            .await
            .map_err(|err| map_io_error(NEGOTIATE, err))?;
        let reply = read_frame(stream, decoder, read_buf, NEGOTIATE).await?;
        let response = ResponseFrame::decode(reply)?;
        ContextResponse::from_frame(&response)?.into_result()
    };
    tokio::time::timeout(config.connect_timeout(), exchange)
        .await
        .map_err(|_| crate::error::timeout_error(NEGOTIATE))?
}

/// 协商请求的 activity id 只用于服务端日志关联，取进程内递增序号与时间的组合即可。
fn random_activity() -> u128 {
    use std::sync::atomic::AtomicU64;
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    (nanos << 64) ^ u128::from(seq)
}
