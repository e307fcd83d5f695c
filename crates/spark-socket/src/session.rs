//! # Session：单条连接的簿记记录
//!
//! ## 核心意图（Why）
//! - 持有一条 TCP 连接的传输套接字、远端端点、字节计数与用户数据；
//! - 接收循环、发送路径与拆除流程共享同一个 `Arc<Session>`，套接字在最后一个引用释放时关闭。
//!
//! ## 行为契约（What）
//! - [`ConnectionId`] 由所属引擎单调生成，在该引擎生命周期内不会复用；
//! - `begin_close` 幂等：首次调用执行 `shutdown(Both)` 并唤醒所有在途操作，后续调用为空操作；
//! - 字节计数只增不减。
//!
//! ## 风险提示（Trade-offs）
//! - 读写均通过 `&TcpStream` 的 `readable`/`try_read` 与 `writable`/`try_write` 完成，
//!   发送端以 `write_gate` 串行化单个负载的写入，避免不同负载的字节交错。

use std::{
    any::Any,
    fmt,
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::{net::TcpStream, sync::Mutex as AsyncMutex};

use crate::{registry::Registrable, signal::CloseSignal};

/// 会话上可附带的任意用户数据，也用作发送操作的调用方标签。
pub type UserData = Arc<dyn Any + Send + Sync>;

/// 连接标识。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 单调递增的连接标识生成器，每个引擎实例持有一个。
#[derive(Debug)]
pub(crate) struct ConnectionIdGenerator {
    next: AtomicU64,
}

impl ConnectionIdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// 一条存活的 TCP 连接。
pub struct Session {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: TcpStream,
    write_gate: AsyncMutex<()>,
    close: CloseSignal,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    user_data: Mutex<Option<UserData>>,
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            remote_addr,
            local_addr,
            stream,
            write_gate: AsyncMutex::new(()),
            close: CloseSignal::new(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            user_data: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 该会话累计接收的字节数。
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// 该会话累计发送的字节数。
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    /// 替换会话上的用户数据，返回旧值。
    pub fn set_user_data(&self, data: Option<UserData>) -> Option<UserData> {
        std::mem::replace(&mut *self.user_data.lock(), data)
    }

    /// 会话是否已进入关闭流程。
    pub fn is_closing(&self) -> bool {
        self.close.is_closed()
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn write_gate(&self) -> &AsyncMutex<()> {
        &self.write_gate
    }

    pub(crate) async fn closed(&self) {
        self.close.wait().await
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 进入关闭流程：双向关闭套接字并唤醒在途的接收与发送。
    ///
    /// 已关闭或已复位的套接字返回的错误被忽略；仅首次调用返回 `true`。
    pub(crate) fn begin_close(&self) -> bool {
        if !self.close.close() {
            return false;
        }
        if let Err(err) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            tracing::trace!(id = %self.id, error = %err, "shutdown on a closed socket");
        }
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("closing", &self.is_closing())
            .field("bytes_received", &self.bytes_received())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

impl Registrable for Session {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
