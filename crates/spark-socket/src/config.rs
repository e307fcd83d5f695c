//! 引擎构造参数与套接字选项。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 以可反序列化的结构描述服务端/客户端的构造参数，宿主可直接从 TOML 文件加载；
//! - 每个字段都有默认值，缺省的配置表等价于 `Default::default()`。
//!
//! ## 契约（What）
//! - [`ServerConfig`]：监听端点、最大并发连接数、单次操作缓冲大小、完成端口模式标志等；
//! - [`ClientConfig`]：远端主机与端口、缓冲大小、写上下文数量；
//! - [`TcpSocketOptions`]：接受/建连之后应用到每条连接的 `TCP_NODELAY` 与 `SO_LINGER`；
//! - `validate` 拒绝会让池化资源无法初始化的取值。

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;
use socket2::SockRef;
use thiserror::Error;
use tokio::net::TcpStream;

const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_LISTEN_BACKLOG: i32 = 128;
const DEFAULT_SEND_CONTEXTS: usize = 8;

/// 配置解析或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse socket configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 每条 TCP 连接在建立后应用的套接字选项。
///
/// # 教案级注释
///
/// ## 核心逻辑（How）
/// - `nodelay` 通过 Tokio `set_nodelay` 关闭 Nagle 算法；
/// - `linger_ms` 为 `Some(ms)` 时通过 `socket2::SockRef::set_linger` 写入 `SO_LINGER`，
///   关闭阶段在 `ms` 毫秒后未完成即发送 RST；`Some(0)` 代表关闭即复位；
/// - `None` 遵循内核默认策略。
///
/// ## 注意事项（Trade-offs）
/// - Linux 会将 `SO_LINGER` 向下取整到秒，亚秒值仅 `0` 具有精确语义。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TcpSocketOptions {
    nodelay: bool,
    linger_ms: Option<u64>,
}

impl TcpSocketOptions {
    /// 创建默认选项。
    pub const fn new() -> Self {
        Self {
            nodelay: false,
            linger_ms: None,
        }
    }

    /// 开启或关闭 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger_ms = linger.map(|dur| dur.as_millis() as u64);
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        if self.linger_ms.is_some() {
            SockRef::from(stream).set_linger(self.linger())?;
        }
        Ok(())
    }
}

/// 服务端构造参数。
///
/// # 契约（What）
/// - `bind_addr`：监听端点，支持 IPv4/IPv6，端口 `0` 表示由系统分配；
/// - `max_connections`：同时存活的会话上限，同时决定读上下文池与写上下文池的容量；
/// - `buffer_size`：单次收发操作使用的缓冲段大小；
/// - `completion_only`：是否要求传输仅使用完成式 IO；Tokio 平台上该标志仅作记录；
/// - `listen_backlog`：宿主未显式指定时使用的监听队列长度；
/// - `throw_on_error`：同步入口遇到故障时是否以 `Err` 返回；
/// - `socket`：接受连接后应用的 [`TcpSocketOptions`]。
///
/// UDP 服务端复用该结构：`max_connections` 决定并发发送上下文的池化数量。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    bind_addr: SocketAddr,
    max_connections: usize,
    buffer_size: usize,
    completion_only: bool,
    listen_backlog: i32,
    throw_on_error: bool,
    socket: TcpSocketOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            completion_only: false,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            throw_on_error: false,
            socket: TcpSocketOptions::new(),
        }
    }
}

impl ServerConfig {
    /// 以监听端点创建配置，其余字段取默认值。
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_completion_only(mut self, completion_only: bool) -> Self {
        self.completion_only = completion_only;
        self
    }

    pub fn with_listen_backlog(mut self, listen_backlog: i32) -> Self {
        self.listen_backlog = listen_backlog;
        self
    }

    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn with_socket_options(mut self, socket: TcpSocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn completion_only(&self) -> bool {
        self.completion_only
    }

    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    pub fn throw_on_error(&self) -> bool {
        self.throw_on_error
    }

    pub fn socket_options(&self) -> &TcpSocketOptions {
        &self.socket
    }

    /// 校验取值能否支撑池化资源的初始化。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be at least 1",
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be at least 1",
            });
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::Invalid {
                field: "listen_backlog",
                reason: "must be positive",
            });
        }
        if self
            .max_connections
            .checked_mul(2)
            .and_then(|slots| slots.checked_mul(self.buffer_size))
            .is_none()
        {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "buffer region overflows usize",
            });
        }
        Ok(())
    }
}

/// 客户端构造参数。
///
/// - `remote_host`：远端主机名或 IP 字面量，在 `start` 时异步解析；
/// - `send_contexts`：池化写上下文数量，超出部分的并发发送会临时分配上下文。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    remote_host: String,
    remote_port: u16,
    buffer_size: usize,
    send_contexts: usize,
    throw_on_error: bool,
    socket: TcpSocketOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_host: String::from("127.0.0.1"),
            remote_port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            send_contexts: DEFAULT_SEND_CONTEXTS,
            throw_on_error: false,
            socket: TcpSocketOptions::new(),
        }
    }
}

impl ClientConfig {
    /// 以远端主机与端口创建配置。
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_send_contexts(mut self, send_contexts: usize) -> Self {
        self.send_contexts = send_contexts;
        self
    }

    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn with_socket_options(mut self, socket: TcpSocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn send_contexts(&self) -> usize {
        self.send_contexts
    }

    pub fn throw_on_error(&self) -> bool {
        self.throw_on_error
    }

    pub fn socket_options(&self) -> &TcpSocketOptions {
        &self.socket
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "remote_host",
                reason: "must not be empty",
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be at least 1",
            });
        }
        if self
            .send_contexts
            .checked_add(1)
            .and_then(|slots| slots.checked_mul(self.buffer_size))
            .is_none()
        {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "buffer region overflows usize",
            });
        }
        Ok(())
    }
}
