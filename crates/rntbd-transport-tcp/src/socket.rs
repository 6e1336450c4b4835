use crate::error::{CONFIGURE, map_io_error};
use rntbd_core::TransportError;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 直连通道是长连接，且请求延迟敏感：默认关闭 Nagle 算法，避免小帧被合并延迟；
/// - 内核 keepalive 只能发现“对端消失”，发现不了“对端在线但不处理”，后者由健康检查负责，
///   两者互补。
///
/// ## 核心逻辑（How）
/// - `apply` 通过 `socket2::SockRef` 借用已建立的 Tokio 套接字写入选项，不转移所有权；
/// - `linger = Some(dur)` 时关闭阶段在 `dur` 后发送 RST。
///
/// ## 契约说明（What）
/// - **前置条件**：调用 `apply` 前连接必须已建立；
/// - **后置条件**：返回 `Ok(())` 时全部选项已落地，失败时映射为 `tcp configure` 错误。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒；
/// - keepalive 间隔的可配置粒度因平台而异，这里只设置首次探测时间。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    keepalive: Option<Duration>,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 默认开启 `TCP_NODELAY`，不设置 keepalive 与 linger。
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 keepalive 首次探测前的空闲时长。
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<(), TransportError> {
        stream
            .set_nodelay(self.nodelay)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let sock = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
                .map_err(|err| map_io_error(CONFIGURE, err))?;
        }
        sock.set_linger(self.linger)
            .map_err(|err| map_io_error(CONFIGURE, err))
    }
}
