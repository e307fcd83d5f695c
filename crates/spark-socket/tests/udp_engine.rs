//! UDP 服务端与客户端的数据报收发。
//!
//! - **Why**：无连接路径不经过会话表与准入闸门，需要单独验证接收循环的重新接收与发送事件；
//! - **How**：[`UdpClient`] 向 [`UdpServer`] 发送，服务端回包由裸 `tokio::net::UdpSocket` 接收；
//! - **What**：长度为 0 的数据报同样作为 `DataReceived` 交付；超过缓冲的数据报只报告错误。

mod support;

use std::{sync::Arc, time::Duration};

use spark_socket::{ClientConfig, Phase, SocketError, UdpClient, UdpServer, UserToken};
use support::{WAIT, loopback_server, record};
use tokio::net::UdpSocket;

#[tokio::test(flavor = "multi_thread")]
async fn datagrams_flow_both_ways() {
    let server = UdpServer::new(loopback_server(4, 64));
    let mut server_events = record(server.events());
    assert!(server.start().expect("UDP 服务端绑定失败"));
    assert!(!server.start().expect("重复启动不应报错"));
    let server_addr = server.local_addr().expect("服务端应已绑定");

    let client = UdpClient::new(ClientConfig::new("127.0.0.1", server_addr.port()));
    let mut client_events = record(client.events());
    assert!(client.start().await.expect("UDP 客户端启动失败"));

    let token: UserToken = Arc::new(5u32);
    client.send_with_token(b"hello", token).expect("发送失败");
    let sent = client_events.sent().await;
    assert_eq!(sent.data, b"hello");
    assert_eq!(sent.token, Some(5));

    let inbound = server_events.received().await;
    assert_eq!(inbound.data, b"hello");
    assert!(inbound.id.is_none());
    let origin = inbound.remote;

    client.send(&[]).expect("发送空数据报失败");
    let empty = server_events.received().await;
    assert!(empty.data.is_empty());
    assert_eq!(empty.remote, origin);

    let peer = UdpSocket::bind("127.0.0.1:0").await.expect("绑定对端失败");
    let peer_addr = peer.local_addr().expect("读取对端地址失败");
    server.send_to(peer_addr, b"world").expect("服务端发送失败");
    let mut buf = [0u8; 16];
    let (len, from) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
        .await
        .expect("等待回包超时")
        .expect("接收回包失败");
    assert_eq!(&buf[..len], b"world");
    assert_eq!(from, server_addr);
    assert_eq!(server_events.sent().await.remote, peer_addr);

    assert_eq!(client.total_bytes_sent(), 5);
    assert_eq!(server.total_bytes_read(), 5);
    assert_eq!(server.total_bytes_written(), 5);
    server_events.assert_no_errors();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_peer_is_not_an_error() {
    let server = UdpServer::new(loopback_server(4, 64));
    let mut events = record(server.events());
    assert!(server.start().expect("UDP 服务端绑定失败"));

    let vacant = UdpSocket::bind("127.0.0.1:0").await.expect("绑定失败");
    let target = vacant.local_addr().expect("读取地址失败");
    drop(vacant);

    server.send_to(target, b"nobody home").expect("发送失败");
    events.sent().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    events.assert_no_errors();

    let peer = UdpSocket::bind("127.0.0.1:0").await.expect("绑定对端失败");
    peer
        .send_to(b"still alive", server.local_addr().expect("服务端应已绑定"))
        .await
        .expect("对端发送失败");
    assert_eq!(events.received().await.data, b"still alive");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_releases_the_socket() {
    let server = UdpServer::new(loopback_server(1, 32));
    assert!(server.start().expect("UDP 服务端绑定失败"));
    assert!(server.stop());
    assert!(!server.stop());
    assert!(matches!(
        server.send_to("127.0.0.1:9".parse().expect("地址解析失败"), b"x"),
        Err(SocketError::NotRunning)
    ));

    let client = UdpClient::new(ClientConfig::new("127.0.0.1", 9));
    assert!(matches!(client.send(b"x"), Err(SocketError::NotRunning)));
}

/// `stop` 返回时端口已释放，固定端口上可以立即再次绑定。
#[tokio::test(flavor = "multi_thread")]
async fn restart_on_the_same_port_after_stop() {
    let first = UdpServer::new(loopback_server(1, 32));
    assert!(first.start().expect("UDP 服务端绑定失败"));
    let addr = first.local_addr().expect("服务端应已绑定");
    assert!(first.stop());

    for round in 0..10 {
        let server = UdpServer::new(loopback_server(1, 32).with_bind_addr(addr));
        assert!(
            server.start().expect("同一端口的重新绑定失败"),
            "第 {round} 轮未能绑定"
        );
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.stop());
    }
}

/// 超过接收缓冲的数据报报告为接收错误而不交付；恰好等长的数据报完整交付。
#[tokio::test(flavor = "multi_thread")]
async fn oversized_datagram_is_reported_not_delivered() {
    const BUFFER: usize = 8;
    let server = UdpServer::new(loopback_server(1, BUFFER));
    let mut events = record(server.events());
    assert!(server.start().expect("UDP 服务端绑定失败"));
    let server_addr = server.local_addr().expect("服务端应已绑定");

    let peer = UdpSocket::bind("127.0.0.1:0").await.expect("绑定对端失败");
    peer.send_to(b"twelve bytes", server_addr)
        .await
        .expect("发送超长数据报失败");
    let fault = events.error().await;
    assert_eq!(fault.phase, Phase::Receive);
    assert_eq!(fault.code, "spark.socket.datagram_truncated");
    assert!(fault.id.is_none());

    peer.send_to(b"exactly8", server_addr)
        .await
        .expect("发送等长数据报失败");
    let exact = events.received().await;
    assert_eq!(exact.data, b"exactly8");
    assert_eq!(exact.remote, peer.local_addr().expect("读取对端地址失败"));

    peer.send_to(b"tiny", server_addr)
        .await
        .expect("发送短数据报失败");
    assert_eq!(events.received().await.data, b"tiny");
    events.assert_no_errors();
}
