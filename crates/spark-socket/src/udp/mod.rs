//! UDP 服务端与客户端。

mod client;
mod server;

pub use client::UdpClient;
pub use server::UdpServer;
