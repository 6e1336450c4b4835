//! 核心与外部协作方之间的接口。
//!
//! # 教案式说明
//! - **意图 (Why)**：请求管理器不关心字节如何上线，也不解析分区路由；把这两处依赖收敛为
//!   trait，核心即可在无网络的测试中完整驱动，TCP 绑定与路由缓存各自独立演进；
//! - **契约 (What)**：
//!   - [`FrameTransport::write`] 立即返回写完成 Future，实现方保证同一通道的帧按调用顺序
//!     写出；Future 完成表示帧已交给内核；
//!   - [`RoutingCache::resolve`] 命中时给出副本地址，未命中时返回 [`RoutingMiss`]，调用方
//!     据此刷新路由元数据后重试。

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::TransportError;

/// 写完成 Future。
pub type WriteCompletion = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// 帧的出站通道。
pub trait FrameTransport: Send + Sync {
    /// 排队写出一个完整帧。
    fn write(&self, frame: Bytes) -> WriteCompletion;

    /// 关闭出站方向；已排队的帧可能被丢弃。
    fn close(&self);
}

/// 路由查询键：集合与分区键范围。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub collection_rid: String,
    pub partition_key_range_id: String,
}

/// 路由查询结果：承载分区的副本。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingTarget {
    pub address: SocketAddr,
    pub replica_path: String,
}

/// 路由缓存未命中或已过期。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("no routing entry for {key:?}; refresh required")]
pub struct RoutingMiss {
    pub key: CollectionKey,
}

/// 分区路由元数据缓存。
#[async_trait]
pub trait RoutingCache: Send + Sync {
    async fn resolve(&self, key: &CollectionKey) -> Result<RoutingTarget, RoutingMiss>;
}
