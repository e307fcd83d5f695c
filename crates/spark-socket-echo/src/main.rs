//! `spark-socket-echo`：把收到的每段字节原样写回同一连接的 TCP 宿主。
//!
//! # 用法
//! ```text
//! spark-socket-echo [config.toml]
//! ```
//! - 省略参数时监听 `127.0.0.1:7000`，其余配置取默认值；
//! - 日志级别由 `RUST_LOG` 控制，缺省为 `info`；
//! - 收到 Ctrl-C 后停止服务端并退出。

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use anyhow::{Context, Result};
use spark_socket::{ServerConfig, TcpServer};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "127.0.0.1:7000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(std::env::args().nth(1))?;
    let backlog = config.listen_backlog();
    let server = Arc::new(TcpServer::new(config.with_throw_on_error(true)));
    install_echo(&server);

    server.start(backlog).context("failed to start echo server")?;
    if let Some(addr) = server.local_addr() {
        tracing::info!(%addr, "echo server ready");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    server.stop();
    tracing::info!(
        read = server.total_bytes_read(),
        written = server.total_bytes_written(),
        peak = server.peak_connected_count(),
        "echo server exited"
    );
    Ok(())
}

fn load_config(path: Option<String>) -> Result<ServerConfig> {
    let Some(path) = path else {
        let addr = DEFAULT_BIND
            .parse::<SocketAddr>()
            .context("invalid default bind address")?;
        return Ok(ServerConfig::new(addr));
    };
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
    ServerConfig::from_toml_str(&text).with_context(|| format!("invalid config in {path}"))
}

/// 回显观察者只持有服务端的弱引用。
fn install_echo(server: &Arc<TcpServer>) {
    let weak: Weak<TcpServer> = Arc::downgrade(server);
    server.events().on_data_received(move |event| {
        let (Some(server), Some(id)) = (weak.upgrade(), event.connection_id()) else {
            return;
        };
        if let Err(err) = server.send(id, event.data()) {
            tracing::debug!(%id, error = %err, "echo dropped");
        }
    });
    server.events().on_connected(|event| {
        tracing::info!(id = %event.id, remote = %event.remote, "client connected");
    });
    server.events().on_disconnected(|event| {
        tracing::info!(id = %event.id, reason = %event.reason, "client disconnected");
    });
}
