//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义套接字引擎对外暴露的错误语义，区分“断连信号”“操作故障”“编程错误”三类；
//! - 为每个底层阶段（绑定、监听、接受、建连、接收、发送、关闭）提供稳定错误码，
//!   便于运维按错误码聚合告警。
//!
//! ## 设计要求（What）
//! - 所有错误类型均派生 `thiserror::Error`；
//! - [`classify`] 是唯一的 IO 错误分类入口：复位类错误一律视为断连，其余视为故障。

use std::{fmt, io, net::SocketAddr};

use thiserror::Error;

use crate::{config::ConfigError, session::ConnectionId};

/// 引擎内部一次底层操作所处的阶段。
///
/// - **契约 (What)**：`code` 返回稳定的点分错误码，`as_str` 返回简短文案；
/// - **用法 (How)**：`ErrorOccurred` 事件与 [`SocketError::Io`] 都携带该标签，调用方据此判断失败环节。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Bind,
    Listen,
    Accept,
    Connect,
    Receive,
    Send,
    Shutdown,
}

impl Phase {
    /// 返回该阶段失败时使用的稳定错误码。
    pub const fn code(self) -> &'static str {
        match self {
            Phase::Bind => "spark.socket.bind_failed",
            Phase::Listen => "spark.socket.listen_failed",
            Phase::Accept => "spark.socket.accept_failed",
            Phase::Connect => "spark.socket.connect_failed",
            Phase::Receive => "spark.socket.receive_failed",
            Phase::Send => "spark.socket.send_failed",
            Phase::Shutdown => "spark.socket.shutdown_failed",
        }
    }

    /// 阶段的简短名称。
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Bind => "bind",
            Phase::Listen => "listen",
            Phase::Accept => "accept",
            Phase::Connect => "connect",
            Phase::Receive => "receive",
            Phase::Send => "send",
            Phase::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const UNRESOLVED_CODE: &str = "spark.socket.unresolved";
const NOT_RUNNING_CODE: &str = "spark.socket.not_running";
const UNKNOWN_CONNECTION_CODE: &str = "spark.socket.unknown_connection";
const UNKNOWN_PEER_CODE: &str = "spark.socket.unknown_peer";
const NO_RUNTIME_CODE: &str = "spark.socket.no_runtime";
const POOL_EXHAUSTED_CODE: &str = "spark.socket.pool_exhausted";
const TRUNCATED_CODE: &str = "spark.socket.datagram_truncated";
const CONFIG_CODE: &str = "spark.socket.invalid_config";

/// 套接字引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让同步入口（`start`/`send`/`disconnect`）与事件回调共享同一错误表示；
/// - **契约 (What)**：
///   - `Io`：底层传输故障，携带失败阶段；
///   - `NotRunning`/`UnknownConnection`/`UnknownPeer`/`NoRuntime`：编程错误，总是以 `Err` 返回；
///   - `PoolExhausted`：池化资源在不应耗尽的位置耗尽；
///   - `Truncated`：数据报长于接收缓冲，超出部分已被内核丢弃；
///   - `Config`：配置校验失败。
/// - **风险 (Trade-offs)**：`Io` 持有 `io::Error`，因此错误本身不可 `Clone`；事件以引用方式分发。
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("{phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    #[error("connect: no address resolved for {host}:{port}")]
    Unresolved { host: String, port: u16 },

    #[error("socket engine is not running")]
    NotRunning,

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("no session registered for peer {0}")]
    UnknownPeer(SocketAddr),

    #[error("socket engine requires a Tokio runtime: {0}")]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),

    #[error("{pool} exhausted")]
    PoolExhausted { pool: &'static str },

    #[error("receive: datagram from {remote} exceeds the {capacity}-byte buffer")]
    Truncated { remote: SocketAddr, capacity: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SocketError {
    /// 以阶段标签包装 IO 错误。
    pub(crate) fn io(phase: Phase, source: io::Error) -> Self {
        SocketError::Io { phase, source }
    }

    /// 返回错误对应的阶段；编程错误不属于任何阶段。
    pub fn phase(&self) -> Option<Phase> {
        match self {
            SocketError::Io { phase, .. } => Some(*phase),
            SocketError::Unresolved { .. } => Some(Phase::Connect),
            SocketError::Truncated { .. } => Some(Phase::Receive),
            _ => None,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::Io { phase, .. } => phase.code(),
            SocketError::Unresolved { .. } => UNRESOLVED_CODE,
            SocketError::NotRunning => NOT_RUNNING_CODE,
            SocketError::UnknownConnection(_) => UNKNOWN_CONNECTION_CODE,
            SocketError::UnknownPeer(_) => UNKNOWN_PEER_CODE,
            SocketError::NoRuntime(_) => NO_RUNTIME_CODE,
            SocketError::PoolExhausted { .. } => POOL_EXHAUSTED_CODE,
            SocketError::Truncated { .. } => TRUNCATED_CODE,
            SocketError::Config(_) => CONFIG_CODE,
        }
    }

    /// 该错误是否属于断连信号。
    pub fn is_disconnect(&self) -> bool {
        match self {
            SocketError::Io { source, .. } => classify(source) == Disposition::Disconnect,
            _ => false,
        }
    }
}

/// IO 错误的处置方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// 对端已离开或套接字已被关闭，按断连处理。
    Disconnect,
    /// 操作故障，需记录并通过 `ErrorOccurred` 通知。
    Fault,
}

/// 将 IO 错误归类为断连或故障。
///
/// - 复位、中止、管道破裂、未连接、意外 EOF 均代表“对端已离开”或“套接字已处置”；
/// - 其余错误（权限、地址不可用、超时等）按故障上报。
pub fn classify(error: &io::Error) -> Disposition {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => Disposition::Disconnect,
        _ => Disposition::Fault,
    }
}
