//! `spark-socket` 提供基于 Tokio 的异步 TCP/UDP 套接字通信引擎。
//!
//! # 模块定位（Why）
//! - 以可复用的服务端与客户端接受或建立连接、无阻塞地收发字节，并向观察者通知连接与传输生命周期；
//! - 有界资源管理（缓冲池、上下文池、连接准入）与多阶段异步协议（接受 → 接收循环 → 发送/断开）
//!   在连接复位、套接字已关闭、操作在途等部分失败下仍保持正确。
//!
//! # 设计概要（How）
//! - [`buffer`]：一次性分配的连续区域，按固定段大小切分并以自由链表复用；
//! - [`context`]：读写两侧的操作上下文池，读上下文随会话常驻，写上下文按次借还；
//! - [`admission`]：计数闸门，限制服务端同时存活的会话数；
//! - [`registry`]：以连接标识与远端端点双索引的并发会话表；
//! - [`tcp`] / [`udp`]：连接生命周期引擎，接收循环与发送路径位于内部的 `transfer` 模块；
//! - [`event`]：五个事件通道的线程安全多播；
//! - [`fault`]：每个被捕获故障的日志协作者，默认输出到 `tracing`。
//!
//! # 使用约束（What）
//! - 负载是不透明字节，引擎不做分帧与协议解析，也不提供加密、重连与投递保证；
//! - 事件回调运行在完成 IO 的 Tokio 工作线程上，不得阻塞；`DataReceived` 的缓冲在回调返回后即被复用。

pub mod admission;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod fault;
pub mod registry;
pub mod session;
pub mod tcp;
pub mod udp;

mod signal;
mod stats;
mod transfer;

pub use config::{ClientConfig, ConfigError, ServerConfig, TcpSocketOptions};
pub use context::UserToken;
pub use error::{Disposition, Phase, SocketError, classify};
pub use event::{
    ConnectedEvent, DataTransferred, DisconnectReason, DisconnectedEvent, EngineEvents,
    ErrorEvent, ObserverId,
};
pub use fault::{FaultLog, TracingFaultLog};
pub use session::{ConnectionId, Session, UserData};
pub use tcp::{TcpClient, TcpServer};
pub use udp::{UdpClient, UdpServer};
