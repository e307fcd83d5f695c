//! TCP 服务端与客户端。

mod client;
mod server;

pub use client::TcpClient;
pub use server::TcpServer;
