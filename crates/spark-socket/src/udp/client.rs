//! UDP 客户端：解析远端端点后 `connect` 数据报套接字，仅负责发送。

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{
    net::{UdpSocket, lookup_host},
    runtime::Handle,
};

use super::server::is_connectionless_reset;
use crate::{
    config::ClientConfig,
    context::{OperationPools, UserToken},
    error::{Phase, SocketError},
    event::{DataTransferred, EngineEvents},
    fault::{FaultLog, TracingFaultLog},
    stats::TrafficCounters,
    transfer::raise_fault,
};

/// 异步 UDP 客户端。
pub struct UdpClient {
    shared: Arc<UdpClientShared>,
}

struct UdpClientShared {
    config: ClientConfig,
    events: EngineEvents,
    faults: Arc<dyn FaultLog>,
    counters: TrafficCounters,
    run: Mutex<Option<UdpClientRun>>,
}

struct UdpClientRun {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    pools: Arc<OperationPools>,
    handle: Handle,
}

impl UdpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_fault_log(config, Arc::new(TracingFaultLog))
    }

    pub fn with_fault_log(config: ClientConfig, faults: Arc<dyn FaultLog>) -> Self {
        Self {
            shared: Arc::new(UdpClientShared {
                config,
                events: EngineEvents::new(),
                faults,
                counters: TrafficCounters::default(),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EngineEvents {
        &self.shared.events
    }

    /// 解析远端端点，绑定同地址族的临时端口并 `connect`；已运行时返回 `Ok(false)`。
    pub async fn start(&self) -> Result<bool, SocketError> {
        let handle = Handle::try_current().map_err(SocketError::NoRuntime)?;
        let shared = &self.shared;
        shared.config.validate()?;
        if shared.run.lock().is_some() {
            return Ok(false);
        }

        let (socket, remote) = match shared.open().await {
            Ok(opened) => opened,
            Err(err) => {
                raise_fault(&shared.events, &*shared.faults, &err, None, None);
                return if shared.config.throw_on_error() {
                    Err(err)
                } else {
                    Ok(false)
                };
            }
        };
        let pools = Arc::new(OperationPools::new(
            0,
            shared.config.send_contexts(),
            shared.config.buffer_size(),
        )?);

        let mut run = shared.run.lock();
        if run.is_some() {
            return Ok(false);
        }
        *run = Some(UdpClientRun {
            socket: Arc::new(socket),
            remote,
            pools,
            handle,
        });
        drop(run);
        tracing::info!(%remote, "udp client ready");
        Ok(true)
    }

    pub fn stop(&self) -> bool {
        let Some(run) = self.shared.run.lock().take() else {
            return false;
        };
        tracing::info!(remote = %run.remote, "udp client stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.run.lock().is_some()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.run.lock().as_ref().map(|run| run.remote)
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        self.send_inner(payload, None)
    }

    pub fn send_with_token(&self, payload: &[u8], token: UserToken) -> Result<(), SocketError> {
        self.send_inner(payload, Some(token))
    }

    fn send_inner(&self, payload: &[u8], token: Option<UserToken>) -> Result<(), SocketError> {
        let (handle, socket, remote, pools) = self
            .shared
            .run
            .lock()
            .as_ref()
            .map(|run| {
                (
                    run.handle.clone(),
                    Arc::clone(&run.socket),
                    run.remote,
                    Arc::clone(&run.pools),
                )
            })
            .ok_or(SocketError::NotRunning)?;
        let context = pools.checkout_write(None, Some(remote), payload, token);
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            match socket.send(context.payload()).await {
                Ok(sent) => {
                    shared.counters.record_written(sent);
                    shared.events.emit_data_sent(
                        &DataTransferred::new(None, remote, context.payload(), 0, sent)
                            .with_token(context.user_token()),
                    );
                }
                Err(err) if is_connectionless_reset(&err) => {
                    tracing::debug!(%remote, error = %err, "datagram peer unreachable");
                }
                Err(err) => raise_fault(
                    &shared.events,
                    &*shared.faults,
                    &SocketError::io(Phase::Send, err),
                    None,
                    Some(remote),
                ),
            }
            pools.return_write(context);
        });
        Ok(())
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.shared.counters.bytes_written()
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpClient")
            .field("remote_host", &self.shared.config.remote_host())
            .field("remote_port", &self.shared.config.remote_port())
            .field("running", &self.is_running())
            .finish()
    }
}

impl UdpClientShared {
    async fn open(&self) -> Result<(UdpSocket, SocketAddr), SocketError> {
        let host = self.config.remote_host();
        let port = self.config.remote_port();
        let remote = lookup_host((host, port))
            .await
            .map_err(|err| SocketError::io(Phase::Connect, err))?
            .next()
            .ok_or_else(|| SocketError::Unresolved {
                host: host.to_owned(),
                port,
            })?;
        let unspecified = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))
            .await
            .map_err(|err| SocketError::io(Phase::Bind, err))?;
        socket
            .connect(remote)
            .await
            .map_err(|err| SocketError::io(Phase::Connect, err))?;
        Ok((socket, remote))
    }
}
