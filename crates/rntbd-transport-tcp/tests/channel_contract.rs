//! 直连通道契约：真实 TCP 上的请求往返、乱序关联、过期分类与关闭广播。

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rntbd_core::{
    Clock, EndpointConfig, ErrorClass, HealthCheck, MockClock, OperationType, OutboundRequest,
    ResourceType, SystemClock, TransportError, UnhealthyReason, operation::status,
};
use rntbd_transport_tcp::{RntbdChannel, TcpSocketConfig};
use support::{FakeReplica, Mode, eventually};

fn config(request_timeout: Duration) -> Arc<EndpointConfig> {
    Arc::new(
        EndpointConfig::builder()
            .request_timeout(request_timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()
            .expect("valid config"),
    )
}

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn read(body: &'static [u8]) -> OutboundRequest {
    OutboundRequest::new(OperationType::Read, ResourceType::Document)
        .with_payload(Bytes::from_static(body))
}

async fn open(replica: &FakeReplica, request_timeout: Duration) -> RntbdChannel {
    RntbdChannel::open(replica.addr(), config(request_timeout), system_clock())
        .await
        .expect("open channel")
}

/// 基本往返：协商后的请求拿到回显负载，服务端收到的帧带有关联 id。
#[tokio::test(flavor = "multi_thread")]
async fn request_round_trips_over_tcp() {
    let replica = FakeReplica::spawn(Mode::Echo).await;
    let channel = open(&replica, Duration::from_secs(5)).await;
    assert_eq!(channel.context().server_agent, "fake-replica");
    assert_eq!(channel.peer_addr(), replica.addr());

    let response = channel.request(read(b"ping")).await.expect("response");
    assert_eq!(response.status, status::OK);
    assert_eq!(response.payload.as_deref(), Some(&b"ping"[..]));
    let timeline = response.timeline.expect("timeline delivered with response");
    assert!(timeline.sent.is_some() && timeline.received.is_some());
    assert!(timeline.total().is_some());

    let received = replica.received();
    assert_eq!(received.len(), 1);
    assert!(received[0].correlation_id().is_ok());
    assert!(channel.is_healthy());
    channel.close().await.expect("close");
}

/// 服务端逆序应答时，每个调用方仍拿到自己的响应。
#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_responses_reach_their_callers() {
    let replica = FakeReplica::spawn(Mode::Reverse(3)).await;
    let channel = open(&replica, Duration::from_secs(5)).await;

    let first = channel.send(read(b"one")).await.expect("send one");
    let second = channel.send(read(b"two")).await.expect("send two");
    let third = channel.send(read(b"three")).await.expect("send three");
    let (a, b, c) = tokio::join!(first, second, third);

    assert_eq!(a.expect("one").payload.as_deref(), Some(&b"one"[..]));
    assert_eq!(b.expect("two").payload.as_deref(), Some(&b"two"[..]));
    assert_eq!(c.expect("three").payload.as_deref(), Some(&b"three"[..]));
    let stats = channel.stats().await.expect("stats");
    assert_eq!(stats.pending_requests, 0);
    assert_eq!(stats.unmatched_responses, 0);
}

/// 非成功状态码作为存储错误交付，不影响通道。
#[tokio::test(flavor = "multi_thread")]
async fn error_status_is_delivered_as_store_error() {
    let replica = FakeReplica::spawn(Mode::Status(status::NOT_FOUND)).await;
    let channel = open(&replica, Duration::from_secs(5)).await;

    let err = channel.request(read(b"missing")).await.unwrap_err();
    assert_eq!(err.status(), Some(status::NOT_FOUND));
    assert_eq!(err.class(), ErrorClass::Protocol);
    assert!(!channel.is_closed());
}

/// 服务端无应答：读请求过期为可安全重试，写请求过期为结果未知。
#[tokio::test(flavor = "multi_thread")]
async fn hung_replica_expires_requests_by_operation() {
    let replica = FakeReplica::spawn(Mode::Hang).await;
    let channel = open(&replica, Duration::from_millis(150)).await;

    let read_err = channel.request(read(b"get")).await.unwrap_err();
    assert!(matches!(
        read_err,
        TransportError::Gone {
            operation: OperationType::Read,
            ..
        }
    ));
    assert!(read_err.is_safe_to_retry());

    let create = OutboundRequest::new(OperationType::Create, ResourceType::Document)
        .with_payload(Bytes::from_static(b"{}"));
    let create_err = channel.request(create).await.unwrap_err();
    assert!(matches!(create_err, TransportError::RequestTimeout { .. }));
    assert!(create_err.is_timeout());
    assert!(!create_err.is_safe_to_retry());

    let snapshot = channel.timestamps().snapshot();
    assert_eq!(snapshot.transit_timeout_count, 2);
    assert_eq!(snapshot.transit_timeout_write_count, 1);
}

/// 注入的时钟驱动过期定时器：推进时钟即触发过期，不依赖真实等待。
#[tokio::test(flavor = "multi_thread")]
async fn mock_clock_drives_expiry_timer() {
    let replica = FakeReplica::spawn(Mode::Hang).await;
    let clock = MockClock::new();
    let channel = RntbdChannel::open(
        replica.addr(),
        config(Duration::from_secs(5)),
        Arc::new(clock.clone()),
    )
    .await
    .expect("open channel");

    let create = OutboundRequest::new(OperationType::Create, ResourceType::Document);
    let mut handle = channel.send(create).await.expect("send");
    eventually(|| replica.received().len() == 1 && clock.pending_sleepers() > 0).await;
    assert!(handle.try_result().is_none());

    clock.advance(Duration::from_secs(6));
    let err = handle.await.unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout { .. }));
}

/// 对端断开时，所有在途请求以通道关闭失败，健康检查报告关闭。
#[tokio::test(flavor = "multi_thread")]
async fn peer_close_fails_all_pending_requests() {
    let replica = FakeReplica::spawn(Mode::CloseAfter(3)).await;
    let channel = open(&replica, Duration::from_secs(5)).await;

    let mut handles = Vec::new();
    for body in ["a", "b", "c"] {
        handles.push(channel.send(read_owned(body.as_bytes())).await.expect("send"));
    }
    for handle in handles {
        let err = handle.await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed { .. }), "{err}");
    }

    eventually(|| channel.is_closed()).await;
    assert_eq!(
        channel.health(),
        HealthCheck::Unhealthy(UnhealthyReason::ChannelClosed)
    );
    let err = channel.send(read(b"late")).await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelClosed { .. }));
}

/// 关闭通道：在途请求立即失败，重复关闭无副作用。
#[tokio::test(flavor = "multi_thread")]
async fn close_fails_in_flight_requests() {
    let replica = FakeReplica::spawn(Mode::Hang).await;
    let channel = open(&replica, Duration::from_secs(30)).await;

    let handle = channel.send(read(b"slow")).await.expect("send");
    channel.close().await.expect("close");
    assert!(matches!(
        handle.await,
        Err(TransportError::ChannelClosed { .. })
    ));
    assert!(channel.is_closed());
    channel.close().await.expect("second close");
}

/// 排空：不再接收新请求，在途请求完成后通道自行关闭。
#[tokio::test(flavor = "multi_thread")]
async fn drained_channel_rejects_new_requests() {
    let replica = FakeReplica::spawn(Mode::Reverse(1)).await;
    let channel = open(&replica, Duration::from_secs(5)).await;

    channel.drain().await;
    let err = channel.send(read(b"rejected")).await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelClosed { .. }));
    eventually(|| channel.is_closed()).await;
}

/// 服务端拒绝协商时建连失败，错误携带服务端状态码。
#[tokio::test(flavor = "multi_thread")]
async fn rejected_context_fails_open() {
    let replica = FakeReplica::spawn(Mode::RejectContext(status::BAD_REQUEST)).await;
    let err = RntbdChannel::open(replica.addr(), config(Duration::from_secs(5)), system_clock())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::ContextNegotiation {
            status: status::BAD_REQUEST,
            ..
        }
    ));
}

/// 自定义套接字配置随通道保留。
#[tokio::test(flavor = "multi_thread")]
async fn socket_config_is_kept_on_channel() {
    let replica = FakeReplica::spawn(Mode::Echo).await;
    let socket = TcpSocketConfig::new().with_keepalive(Some(Duration::from_secs(30)));
    let channel = RntbdChannel::open_with_config(
        replica.addr(),
        config(Duration::from_secs(5)),
        system_clock(),
        socket,
    )
    .await
    .expect("open channel");
    assert_eq!(
        channel.socket_config().keepalive(),
        Some(Duration::from_secs(30))
    );
    assert!(channel.socket_config().nodelay());
}

fn read_owned(body: &[u8]) -> OutboundRequest {
    OutboundRequest::new(OperationType::Read, ResourceType::Document)
        .with_payload(Bytes::copy_from_slice(body))
}
