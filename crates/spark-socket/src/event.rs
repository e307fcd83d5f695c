//! # 事件通知面
//!
//! ## 模块角色（Why）
//! - 向任意数量的观察者多播 `Connected`/`Disconnected`/`DataReceived`/`DataSent`/`ErrorOccurred`；
//! - 回调直接在完成该 IO 的 Tokio 工作线程上同步执行，引擎不设专用分发线程或队列。
//!
//! ## 核心机制（How）
//! - 每个通道的观察者列表保存在 `ArcSwap<Vec<Slot>>` 中，挂载与卸载以 RCU 方式整体替换；
//! - 分发前先 `load_full` 取得快照再遍历，观察者在回调中卸载自身不会破坏正在进行的遍历；
//! - 没有观察者时分发为空操作。
//!
//! ## 契约说明（What）
//! - [`DataTransferred`] 借用引擎内部缓冲，仅在回调期间有效；需要保留数据的观察者必须自行复制；
//! - 回调不得阻塞：它运行在 IO 完成路径上，阻塞会推迟同一会话的下一次接收。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{
    context::UserToken,
    error::{Phase, SocketError},
    session::ConnectionId,
};

/// 观察者注册句柄，用于卸载。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObserverId(u64);

struct Slot<F: ?Sized> {
    id: ObserverId,
    handler: Arc<F>,
}

impl<F: ?Sized> Clone for Slot<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// 单个事件通道的观察者列表。
pub struct Observers<F: ?Sized> {
    slots: ArcSwap<Vec<Slot<F>>>,
    next_id: AtomicU64,
}

impl<F: ?Sized> Default for Observers<F> {
    fn default() -> Self {
        Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<F: ?Sized> Observers<F> {
    pub fn attach(&self, handler: Arc<F>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Slot {
                id,
                handler: Arc::clone(&handler),
            });
            next
        });
        id
    }

    /// 卸载观察者；句柄未注册时返回 `false`。
    pub fn detach(&self, id: ObserverId) -> bool {
        let previous = self.slots.rcu(|current| {
            current
                .iter()
                .filter(|slot| slot.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|slot| slot.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.load().is_empty()
    }

    fn for_each(&self, mut visit: impl FnMut(&F)) {
        let snapshot = self.slots.load_full();
        for slot in snapshot.iter() {
            visit(&slot.handler);
        }
    }
}

impl<F: ?Sized> fmt::Debug for Observers<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .finish()
    }
}

/// 连接建立。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectedEvent {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// 会话被拆除的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DisconnectReason {
    /// 对端正常关闭（读到 0 字节）。
    PeerClosed,
    /// 对端复位或中止连接。
    Reset,
    /// 接收过程中出现非复位故障。
    ReceiveFault,
    /// 本端调用 `disconnect`/`stop`（客户端）。
    LocalClose,
    /// 服务端停止。
    EngineStopped,
}

impl DisconnectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::PeerClosed => "peer_closed",
            DisconnectReason::Reset => "reset",
            DisconnectReason::ReceiveFault => "receive_fault",
            DisconnectReason::LocalClose => "local_close",
            DisconnectReason::EngineStopped => "engine_stopped",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话已拆除。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DisconnectedEvent {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub reason: DisconnectReason,
}

/// 一次数据传输的只读视图：`(buffer, offset, length)`。
///
/// `buffer` 是本次操作所用的整段缓冲，`offset..offset + length` 为有效数据。
#[derive(Clone, Copy)]
pub struct DataTransferred<'a> {
    id: Option<ConnectionId>,
    remote: SocketAddr,
    buffer: &'a [u8],
    offset: usize,
    length: usize,
    token: Option<&'a UserToken>,
}

impl<'a> DataTransferred<'a> {
    pub(crate) fn new(
        id: Option<ConnectionId>,
        remote: SocketAddr,
        buffer: &'a [u8],
        offset: usize,
        length: usize,
    ) -> Self {
        debug_assert!(offset + length <= buffer.len());
        Self {
            id,
            remote,
            buffer,
            offset,
            length,
            token: None,
        }
    }

    pub(crate) fn with_token(mut self, token: Option<&'a UserToken>) -> Self {
        self.token = token;
        self
    }

    /// 所属连接；无连接传输（UDP）为 `None`。
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn bytes_transferred(&self) -> usize {
        self.length
    }

    /// 有效数据切片。
    pub fn data(&self) -> &'a [u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    /// 发送时附加的调用方标签。
    pub fn user_token(&self) -> Option<&'a UserToken> {
        self.token
    }
}

impl fmt::Debug for DataTransferred<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTransferred")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

/// 操作故障。
#[derive(Clone, Copy, Debug)]
pub struct ErrorEvent<'a> {
    pub phase: Phase,
    pub id: Option<ConnectionId>,
    pub remote: Option<SocketAddr>,
    pub error: &'a SocketError,
}

pub type ConnectedHandler = dyn Fn(&ConnectedEvent) + Send + Sync;
pub type DisconnectedHandler = dyn Fn(&DisconnectedEvent) + Send + Sync;
pub type DataHandler = dyn for<'a> Fn(&DataTransferred<'a>) + Send + Sync;
pub type ErrorHandler = dyn for<'a> Fn(&ErrorEvent<'a>) + Send + Sync;

/// 一个引擎实例的五个事件通道。
#[derive(Debug, Default)]
pub struct EngineEvents {
    connected: Observers<ConnectedHandler>,
    disconnected: Observers<DisconnectedHandler>,
    data_received: Observers<DataHandler>,
    data_sent: Observers<DataHandler>,
    error_occurred: Observers<ErrorHandler>,
}

impl EngineEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(
        &self,
        handler: impl Fn(&ConnectedEvent) + Send + Sync + 'static,
    ) -> ObserverId {
        self.connected.attach(Arc::new(handler))
    }

    pub fn on_disconnected(
        &self,
        handler: impl Fn(&DisconnectedEvent) + Send + Sync + 'static,
    ) -> ObserverId {
        self.disconnected.attach(Arc::new(handler))
    }

    pub fn on_data_received(
        &self,
        handler: impl for<'a> Fn(&DataTransferred<'a>) + Send + Sync + 'static,
    ) -> ObserverId {
        self.data_received.attach(Arc::new(handler))
    }

    pub fn on_data_sent(
        &self,
        handler: impl for<'a> Fn(&DataTransferred<'a>) + Send + Sync + 'static,
    ) -> ObserverId {
        self.data_sent.attach(Arc::new(handler))
    }

    pub fn on_error(
        &self,
        handler: impl for<'a> Fn(&ErrorEvent<'a>) + Send + Sync + 'static,
    ) -> ObserverId {
        self.error_occurred.attach(Arc::new(handler))
    }

    pub fn connected(&self) -> &Observers<ConnectedHandler> {
        &self.connected
    }

    pub fn disconnected(&self) -> &Observers<DisconnectedHandler> {
        &self.disconnected
    }

    pub fn data_received(&self) -> &Observers<DataHandler> {
        &self.data_received
    }

    pub fn data_sent(&self) -> &Observers<DataHandler> {
        &self.data_sent
    }

    pub fn error_occurred(&self) -> &Observers<ErrorHandler> {
        &self.error_occurred
    }

    pub(crate) fn emit_connected(&self, event: &ConnectedEvent) {
        self.connected.for_each(|handler| handler(event));
    }

    pub(crate) fn emit_disconnected(&self, event: &DisconnectedEvent) {
        self.disconnected.for_each(|handler| handler(event));
    }

    pub(crate) fn emit_data_received(&self, event: &DataTransferred<'_>) {
        self.data_received.for_each(|handler| handler(event));
    }

    pub(crate) fn emit_data_sent(&self, event: &DataTransferred<'_>) {
        self.data_sent.for_each(|handler| handler(event));
    }

    pub(crate) fn emit_error(&self, event: &ErrorEvent<'_>) {
        self.error_occurred.for_each(|handler| handler(event));
    }
}
