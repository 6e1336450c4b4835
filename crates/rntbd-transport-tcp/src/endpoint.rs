use crate::{channel::RntbdChannel, socket::TcpSocketConfig};
use rntbd_core::{
    Clock, CollectionKey, EndpointConfig, HealthCheck, OutboundRequest, RoutingCache, RoutingMiss,
    RoutingTarget, StoreResponse, TokenValue, TransportError, header,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 单个副本地址上的通道持有者。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 调用方面向“副本”而非“连接”：通道何时建立、何时因健康检查失败而替换，都收敛在这里；
/// - 健康检查是纯读取，放在取通道的路径上即可，不需要独立的巡检任务。
///
/// ## 逻辑（How）
/// - `channel`：持锁检查当前通道，若已关闭或判定不健康则记录原因、关闭并丢弃，随后重新建连；
/// - `request`：取通道后提交请求；若端点由路由结果构造，则为缺少副本路径头的请求补齐；
/// - `probe`：只读地返回当前通道的健康判定，不触发建连。
///
/// ## 契约（What）
/// - 同一时刻最多持有一条通道；建连期间其它调用方在锁上等待，不会并发建出多条连接；
/// - 替换通道不重试已经失败的请求，重试与否由调用方依据错误分类决定。
///
/// ## 风险与注意（Trade-offs）
/// - 建连在锁内完成，首个请求承担握手延迟；
/// - 被替换通道上的在途请求随其关闭以 `ChannelClosed` 失败。
pub struct RntbdEndpoint {
    addr: SocketAddr,
    replica_path: Option<String>,
    config: Arc<EndpointConfig>,
    clock: Arc<dyn Clock>,
    socket_config: TcpSocketConfig,
    channel: Mutex<Option<RntbdChannel>>,
}

impl std::fmt::Debug for RntbdEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RntbdEndpoint")
            .field("addr", &self.addr)
            .field("replica_path", &self.replica_path)
            .finish_non_exhaustive()
    }
}

impl RntbdEndpoint {
    pub fn new(addr: SocketAddr, config: Arc<EndpointConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            addr,
            replica_path: None,
            config,
            clock,
            socket_config: TcpSocketConfig::default(),
            channel: Mutex::new(None),
        }
    }

    /// 通过路由缓存定位分区副本；未命中时原样返回 [`RoutingMiss`]，由调用方刷新路由后重试。
    pub async fn resolve(
        cache: &dyn RoutingCache,
        key: &CollectionKey,
        config: Arc<EndpointConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RoutingMiss> {
        let RoutingTarget {
            address,
            replica_path,
        } = cache.resolve(key).await?;
        debug!(
            collection = %key.collection_rid,
            range = %key.partition_key_range_id,
            peer = %address,
            "routing entry resolved"
        );
        let mut endpoint = Self::new(address, config, clock);
        endpoint.replica_path = Some(replica_path);
        Ok(endpoint)
    }

    pub fn with_socket_config(mut self, socket_config: TcpSocketConfig) -> Self {
        self.socket_config = socket_config;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn replica_path(&self) -> Option<&str> {
        self.replica_path.as_deref()
    }

    pub fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    /// 取一条健康通道，必要时替换或新建。
    pub async fn channel(&self) -> Result<RntbdChannel, TransportError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            match channel.health() {
                HealthCheck::Healthy => return Ok(channel.clone()),
                HealthCheck::Unhealthy(reason) => {
                    warn!(
                        peer = %self.addr,
                        reason = reason.code(),
                        "evicting unhealthy channel"
                    );
                    if let Some(stale) = slot.take() {
                        let _ = stale.close().await;
                    }
                }
            }
        }
        let channel = RntbdChannel::open_with_config(
            self.addr,
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
            self.socket_config.clone(),
        )
        .await?;
        debug!(peer = %self.addr, local = %channel.local_addr(), "channel opened");
        *slot = Some(channel.clone());
        Ok(channel)
    }

    pub async fn request(
        &self,
        mut request: OutboundRequest,
    ) -> Result<StoreResponse, TransportError> {
        if let Some(path) = &self.replica_path
            && !request.headers.contains(header::request::REPLICA_PATH)
        {
            request
                .headers
                .push(header::request::REPLICA_PATH, TokenValue::String(path.clone()));
        }
        self.channel().await?.request(request).await
    }

    /// 当前通道的健康判定；尚未建连时返回 `None`。
    pub async fn probe(&self) -> Option<HealthCheck> {
        self.channel.lock().await.as_ref().map(RntbdChannel::health)
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        let channel = self.channel.lock().await.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
