#![doc = r#"
# rntbd-transport-tcp

## 设计动机（Why）
- **落地核心**：`rntbd-core` 只定义帧、请求管理与健康判定，本 crate 把它们接到 Tokio TCP 上，
  形成可直接对副本发请求的直连通道；
- **单写者**：每条通道一个驱动任务独占请求管理器，调用方之间不共享可变状态；
- **可替换**：端点在取通道时执行健康检查，挂起的连接被换掉而不是被无限等待。

## 核心契约（What）
- [`RntbdChannel`]：建连、上下文协商、请求提交、健康判定与关闭；
- [`RntbdEndpoint`]：单副本地址上的通道持有者，可由路由缓存结果构造；
- [`TcpSocketConfig`]：`TCP_NODELAY`、keepalive 与 `SO_LINGER`；
- [`ChannelStats`]：驱动任务的运行时统计。

## 实现策略（How）
- 建连与协商受 `connect_timeout` 约束，超时映射为 `ConnectTimeout`；
- 读端增量分帧后交给 `RequestManager::channel_read`，写端由独立任务按序写出；
- 过期定时器按最早截止时间经 `Clock::sleep` 唤醒，测试可注入 `MockClock`。

## 风险与注意（Trade-offs）
- 协议错误（无法分帧或缺少关联 id）会关闭整条通道，在途请求全部以 `ChannelClosed` 失败；
- 命令队列有界，驱动任务繁忙时提交方会被短暂挂起。
"#]

mod channel;
mod driver;
mod endpoint;
mod error;
mod socket;
mod util;

pub use channel::RntbdChannel;
pub use driver::ChannelStats;
pub use endpoint::RntbdEndpoint;
pub use socket::TcpSocketConfig;
