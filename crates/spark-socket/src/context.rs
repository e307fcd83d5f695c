//! # 操作上下文池
//!
//! ## 模块角色（Why）
//! - 每个在途的接受、建连、接收、发送操作都由一个 [`OperationContext`] 描述，
//!   它携带缓冲段、所属连接与簿记字段；池化复用以免每次操作都触发堆分配；
//! - 读写两侧生命周期不对称：读上下文随会话常驻并持续复用，写上下文按次借还。
//!
//! ## 契约说明（What）
//! - 读侧池在初始化时即为每个上下文绑定一个缓冲段，缓冲池不足时初始化失败；
//! - 写侧池初始不绑定缓冲，`load_payload` 时按负载大小惰性借段，超出段大小的负载走私有分配；
//! - `release` 先清空连接引用与调用方标签再入池，旧会话的引用不会泄漏到下一次借用。
//!
//! ## 实现策略（How）
//! - 每个池以 `parking_lot::Mutex<Vec<_>>` 作为栈；容量上限固定，超额归还的上下文直接丢弃。

use std::{any::Any, fmt, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use crate::{
    buffer::{BufferPool, Segment},
    error::SocketError,
    session::ConnectionId,
};

/// 调用方附加在单次操作上的任意标签。
pub type UserToken = Arc<dyn Any + Send + Sync>;

/// 上下文最近一次承载的操作类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationKind {
    Accept,
    Connect,
    Receive,
    Send,
}

/// 上下文持有的缓冲。
#[derive(Debug, Default)]
pub enum ContextBuffer {
    #[default]
    Empty,
    /// 从缓冲池借出的固定大小段。
    Pooled(Segment),
    /// 超出段大小（或池已耗尽）时的私有分配，释放时直接丢弃。
    Private(Vec<u8>),
}

impl ContextBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            ContextBuffer::Empty => &[],
            ContextBuffer::Pooled(segment) => segment.as_slice(),
            ContextBuffer::Private(bytes) => bytes,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            ContextBuffer::Empty => &mut [],
            ContextBuffer::Pooled(segment) => segment.as_mut_slice(),
            ContextBuffer::Private(bytes) => bytes,
        }
    }

    /// 缓冲在共享区域中的偏移；非池化缓冲恒为 0。
    fn offset(&self) -> usize {
        match self {
            ContextBuffer::Pooled(segment) => segment.offset(),
            _ => 0,
        }
    }
}

/// 一次异步 IO 的描述符。
///
/// 在途期间由引擎独占；空闲后归属所在的读池或写池，不会同时服务两个并发操作。
#[derive(Default)]
pub struct OperationContext {
    kind: Option<OperationKind>,
    buffer: ContextBuffer,
    filled: usize,
    bytes_transferred: usize,
    connection: Option<ConnectionId>,
    remote: Option<SocketAddr>,
    user_token: Option<UserToken>,
}

impl OperationContext {
    fn with_buffer(buffer: ContextBuffer) -> Self {
        Self {
            buffer,
            ..Self::default()
        }
    }

    /// 将上下文绑定到一条连接。
    pub fn bind(&mut self, connection: Option<ConnectionId>, remote: Option<SocketAddr>) {
        self.connection = connection;
        self.remote = remote;
    }

    pub fn set_last_operation(&mut self, kind: OperationKind) {
        self.kind = Some(kind);
    }

    pub fn last_operation(&self) -> Option<OperationKind> {
        self.kind
    }

    pub fn record_transfer(&mut self, bytes: usize) {
        self.bytes_transferred = bytes;
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn set_user_token(&mut self, token: Option<UserToken>) {
        self.user_token = token;
    }

    pub fn user_token(&self) -> Option<&UserToken> {
        self.user_token.as_ref()
    }

    /// 缓冲在共享区域中的偏移。
    pub fn buffer_offset(&self) -> usize {
        self.buffer.offset()
    }

    /// 是否持有池化缓冲段。
    pub fn is_pooled(&self) -> bool {
        matches!(self.buffer, ContextBuffer::Pooled(_))
    }

    /// 整段缓冲的只读视图。
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// 接收方向：整段可写缓冲。
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// 接收方向：最近一次读入的有效字节。
    pub fn received(&self) -> &[u8] {
        let len = self.bytes_transferred.min(self.buffer.as_slice().len());
        &self.buffer.as_slice()[..len]
    }

    /// 发送方向：已装载的负载。
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.filled]
    }

    /// 将负载复制进上下文。
    ///
    /// - 空负载不借缓冲；
    /// - 负载不超过段大小且池中仍有空段时复制进池化段；
    /// - 否则私有分配一块恰好等长的缓冲。
    pub fn load_payload(&mut self, pool: &BufferPool, payload: &[u8]) {
        debug_assert!(matches!(self.buffer, ContextBuffer::Empty));
        self.filled = payload.len();
        if payload.is_empty() {
            return;
        }
        if payload.len() <= pool.segment_size() {
            if let Some(mut segment) = pool.acquire() {
                segment[..payload.len()].copy_from_slice(payload);
                self.buffer = ContextBuffer::Pooled(segment);
                return;
            }
        }
        self.buffer = ContextBuffer::Private(payload.to_vec());
    }

    /// 拆下缓冲，供调用方归还给缓冲池。
    pub(crate) fn take_buffer(&mut self) -> ContextBuffer {
        self.filled = 0;
        std::mem::take(&mut self.buffer)
    }

    /// 清空瞬态字段；缓冲段保持绑定。
    pub fn clear(&mut self) {
        self.kind = None;
        self.filled = 0;
        self.bytes_transferred = 0;
        self.connection = None;
        self.remote = None;
        self.user_token = None;
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("kind", &self.kind)
            .field("buffer_offset", &self.buffer.offset())
            .field("pooled", &self.is_pooled())
            .field("bytes_transferred", &self.bytes_transferred)
            .field("connection", &self.connection)
            .field("remote", &self.remote)
            .field("has_token", &self.user_token.is_some())
            .finish()
    }
}

/// 固定容量的上下文栈。
#[derive(Debug)]
pub struct ContextPool {
    capacity: usize,
    idle: Mutex<Vec<OperationContext>>,
}

impl ContextPool {
    /// 构造读侧池：每个上下文预先绑定一个缓冲段。
    pub fn read_side(count: usize, buffers: &BufferPool) -> Result<Self, SocketError> {
        let mut idle = Vec::with_capacity(count);
        for _ in 0..count {
            let segment = buffers.acquire().ok_or(SocketError::PoolExhausted {
                pool: "buffer pool",
            })?;
            idle.push(OperationContext::with_buffer(ContextBuffer::Pooled(segment)));
        }
        Ok(Self {
            capacity: count,
            idle: Mutex::new(idle),
        })
    }

    /// 构造写侧池：缓冲在装载负载时惰性绑定。
    pub fn write_side(count: usize) -> Self {
        Self {
            capacity: count,
            idle: Mutex::new((0..count).map(|_| OperationContext::default()).collect()),
        }
    }

    pub fn acquire(&self) -> Option<OperationContext> {
        self.idle.lock().pop()
    }

    /// 清空瞬态字段后入池；池已满时丢弃。
    pub fn release(&self, mut context: OperationContext) {
        context.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(context);
        }
    }

    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 一个引擎实例的缓冲池与读写上下文池。
#[derive(Debug)]
pub struct OperationPools {
    buffers: BufferPool,
    reads: ContextPool,
    writes: ContextPool,
}

impl OperationPools {
    /// 共享区域按 `(读上下文数 + 写上下文数) * buffer_size` 一次分配。
    pub fn new(
        read_contexts: usize,
        write_contexts: usize,
        buffer_size: usize,
    ) -> Result<Self, SocketError> {
        let total = read_contexts
            .checked_add(write_contexts)
            .and_then(|count| count.checked_mul(buffer_size))
            .ok_or(crate::config::ConfigError::Invalid {
                field: "buffer_size",
                reason: "pool size overflows usize",
            })?;
        let buffers = BufferPool::new(total, buffer_size)?;
        let reads = ContextPool::read_side(read_contexts, &buffers)?;
        Ok(Self {
            buffers,
            reads,
            writes: ContextPool::write_side(write_contexts),
        })
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn reads(&self) -> &ContextPool {
        &self.reads
    }

    pub fn writes(&self) -> &ContextPool {
        &self.writes
    }

    /// 借出读上下文并绑定到连接，`kind` 为建立该连接的操作（接受或建连）。
    pub fn checkout_read(
        &self,
        kind: OperationKind,
        connection: Option<ConnectionId>,
        remote: Option<SocketAddr>,
    ) -> Result<OperationContext, SocketError> {
        let mut context = self
            .reads
            .acquire()
            .ok_or(SocketError::PoolExhausted {
                pool: "read context pool",
            })?;
        context.bind(connection, remote);
        context.set_last_operation(kind);
        Ok(context)
    }

    pub fn return_read(&self, context: OperationContext) {
        self.reads.release(context);
    }

    /// 借出写上下文并装载负载；写池为空时临时构造一个上下文。
    pub fn checkout_write(
        &self,
        connection: Option<ConnectionId>,
        remote: Option<SocketAddr>,
        payload: &[u8],
        token: Option<UserToken>,
    ) -> OperationContext {
        let mut context = self.writes.acquire().unwrap_or_default();
        context.bind(connection, remote);
        context.set_last_operation(OperationKind::Send);
        context.set_user_token(token);
        context.load_payload(&self.buffers, payload);
        context
    }

    /// 归还写上下文：池化段先回到缓冲池，上下文再回到写池。
    pub fn return_write(&self, mut context: OperationContext) {
        if let ContextBuffer::Pooled(segment) = context.take_buffer() {
            self.buffers.release(segment);
        }
        self.writes.release(context);
    }
}
