//! 集成测试共用的事件记录器与构造辅助。
//!
//! - **Why**：引擎在 Tokio 工作线程上同步回调，测试需要把事件搬到测试任务里按序断言；
//! - **How**：每个通道注册一个观察者，把事件的自有拷贝推入无界 `mpsc`，测试端带超时逐个取出；
//! - **What**：所有等待都以 [`WAIT`] 为上限，超时即 panic 并给出所等事件的名称。

#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use spark_socket::{
    ConnectedEvent, ConnectionId, DisconnectedEvent, EngineEvents, Phase, ServerConfig,
};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(300);

#[derive(Clone, Debug)]
pub struct Transfer {
    pub id: Option<ConnectionId>,
    pub remote: SocketAddr,
    pub data: Vec<u8>,
    pub token: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Fault {
    pub phase: Phase,
    pub id: Option<ConnectionId>,
    pub code: &'static str,
}

pub struct Recorder {
    connected: UnboundedReceiver<ConnectedEvent>,
    disconnected: UnboundedReceiver<DisconnectedEvent>,
    received: UnboundedReceiver<Transfer>,
    sent: UnboundedReceiver<Transfer>,
    errors: UnboundedReceiver<Fault>,
}

/// 在引擎的五个通道上挂载记录观察者。
pub fn record(events: &EngineEvents) -> Recorder {
    let (connected_tx, connected) = unbounded_channel();
    let (disconnected_tx, disconnected) = unbounded_channel();
    let (received_tx, received) = unbounded_channel();
    let (sent_tx, sent) = unbounded_channel();
    let (errors_tx, errors) = unbounded_channel();

    events.on_connected(move |event| {
        let _ = connected_tx.send(*event);
    });
    events.on_disconnected(move |event| {
        let _ = disconnected_tx.send(*event);
    });
    events.on_data_received(move |event| {
        let _ = received_tx.send(Transfer {
            id: event.connection_id(),
            remote: event.remote(),
            data: event.data().to_vec(),
            token: None,
        });
    });
    events.on_data_sent(move |event| {
        let _ = sent_tx.send(Transfer {
            id: event.connection_id(),
            remote: event.remote(),
            data: event.data().to_vec(),
            token: event
                .user_token()
                .and_then(|token| token.downcast_ref::<u32>().copied()),
        });
    });
    events.on_error(move |event| {
        let _ = errors_tx.send(Fault {
            phase: event.phase,
            id: event.id,
            code: event.error.code(),
        });
    });

    Recorder {
        connected,
        disconnected,
        received,
        sent,
        errors,
    }
}

async fn next<T>(rx: &mut UnboundedReceiver<T>, what: &str) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap_or_else(|_| panic!("等待 {what} 超时"))
        .unwrap_or_else(|| panic!("{what} 通道已关闭"))
}

async fn stays_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>, what: &str) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("不应出现 {what} 事件：{event:?}");
    }
}

impl Recorder {
    pub async fn connected(&mut self) -> ConnectedEvent {
        next(&mut self.connected, "Connected").await
    }

    pub async fn disconnected(&mut self) -> DisconnectedEvent {
        next(&mut self.disconnected, "Disconnected").await
    }

    pub async fn received(&mut self) -> Transfer {
        next(&mut self.received, "DataReceived").await
    }

    /// 累积接收事件直至拿到 `len` 字节。
    pub async fn received_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut collected = Vec::with_capacity(len);
        while collected.len() < len {
            let transfer = self.received().await;
            assert!(
                !transfer.data.is_empty(),
                "TCP 接收事件不应携带 0 字节"
            );
            collected.extend_from_slice(&transfer.data);
        }
        assert_eq!(collected.len(), len, "收到的字节多于预期");
        collected
    }

    pub async fn sent(&mut self) -> Transfer {
        next(&mut self.sent, "DataSent").await
    }

    pub async fn error(&mut self) -> Fault {
        next(&mut self.errors, "ErrorOccurred").await
    }

    pub async fn no_connected(&mut self) {
        stays_quiet(&mut self.connected, "Connected").await
    }

    pub async fn no_disconnected(&mut self) {
        stays_quiet(&mut self.disconnected, "Disconnected").await
    }

    /// 断言到目前为止没有任何 `ErrorOccurred`。
    pub fn assert_no_errors(&mut self) {
        if let Ok(fault) = self.errors.try_recv() {
            panic!("不应出现 ErrorOccurred：{fault:?}");
        }
    }
}

/// 回环地址上、系统分配端口的服务端配置。
pub fn loopback_server(max_connections: usize, buffer_size: usize) -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().expect("地址解析失败"))
        .with_max_connections(max_connections)
        .with_buffer_size(buffer_size)
}

/// 取得一个当前无人监听的回环端口。
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("占用临时端口失败");
    let port = listener.local_addr().expect("读取地址失败").port();
    drop(listener);
    port
}
