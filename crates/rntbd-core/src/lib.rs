#![doc = r#"
# rntbd-core

## 设计动机（Why）
- **定位**：直连模式下客户端绕过网关，经由 TCP 以二进制令牌协议（RNTBD）直接访问分区副本；
  本 crate 承载与运行时无关的协议与状态机核心。
- **架构角色**：TCP 绑定（`rntbd-transport-tcp`）只负责字节搬运与任务调度，请求关联、超时
  分类与健康判定全部在这里完成，因此可以在无网络的单元测试中被完整驱动。
- **设计理念**：每个请求恰好得到一个结果；超时错误必须区分“可安全重试”与“结果未知”。

## 核心契约（What）
- [`token`] / [`header`] / [`frame`]：令牌类型、帧头字段与请求/响应帧的编解码；
- [`timestamps`] / [`health`]：通道读写进度与静默挂起检测；
- [`record`] / [`manager`]：请求记录、调用方句柄与单通道请求管理器；
- [`error`]：统一错误域与重试安全性分类；
- [`config`] / [`time`] / [`interfaces`]：端点配置、可注入时钟与外部协作接口。

## 实现策略（How）
- 请求管理器取 `&mut self`，由上层保证单一所有者（每通道一个驱动任务）；
- 时间戳以原子量共享，健康检查可在任意线程无锁读取；
- 所有时间比较都经由 [`time::Clock`]，测试注入 [`time::MockClock`] 即可复现长时挂起场景。

## 风险与考量（Trade-offs）
- 本 crate 不做任何重试，只给出分类信号；重试编排属于上层职责。
- 操作码只登记直连核心需要区分的子集。
"#]

pub mod config;
pub mod error;
pub mod frame;
pub mod header;
pub mod health;
pub mod interfaces;
pub mod manager;
pub mod operation;
mod pending;
pub mod record;
pub mod time;
pub mod timestamps;
pub mod token;

pub use config::{EndpointConfig, EndpointConfigBuilder};
pub use error::{CodecError, ConfigError, ErrorClass, Result, TransportError};
pub use frame::{ContextRequest, ContextResponse, FrameDecoder, RequestFrame, ResponseFrame};
pub use header::TokenStream;
pub use health::{ChannelHealthChecker, HealthCheck, UnhealthyReason};
pub use interfaces::{
    CollectionKey, FrameTransport, RoutingCache, RoutingMiss, RoutingTarget, WriteCompletion,
};
pub use manager::{ChannelState, ReadOutcome, RegisteredRequest, RequestManager};
pub use operation::{OperationType, ResourceType};
pub use record::{
    CompletionState, CorrelationId, OutboundRequest, RequestHandle, RequestRecord, RequestStage,
    RequestTimeline, StoreResponse,
};
pub use time::{Clock, MockClock, Sleep, SystemClock};
pub use timestamps::{ChannelTimestamps, TimestampsSnapshot};
pub use token::{Guid, Token, TokenType, TokenValue};
