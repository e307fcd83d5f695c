//! TCP 客户端：单次建连、会话接收循环与发送。
//!
//! - **契约 (What)**：`start` 只尝试一次，失败时触发 `ErrorOccurred(Connect)` 并保持空闲，不自动重连；
//!   建连成功后会话标识由本实例的生成器分配；
//! - **拆除 (How)**：对端关闭、复位、接收故障与本端 `stop` 共用同一拆除入口，`Disconnected` 恰好触发一次。

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    net::{TcpStream, lookup_host},
    runtime::Handle,
};

use crate::{
    config::ClientConfig,
    context::{OperationKind, OperationPools, UserToken},
    error::{Phase, SocketError},
    event::{ConnectedEvent, DisconnectReason, DisconnectedEvent, EngineEvents},
    fault::{FaultLog, TracingFaultLog},
    session::{ConnectionIdGenerator, Session},
    stats::TrafficCounters,
    transfer::{TransferHost, raise_fault, receive_loop, spawn_send},
};

/// 异步 TCP 客户端。
pub struct TcpClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    events: EngineEvents,
    faults: Arc<dyn FaultLog>,
    counters: TrafficCounters,
    ids: ConnectionIdGenerator,
    connecting: AtomicBool,
    run: Mutex<Option<ClientRun>>,
}

struct ClientRun {
    session: Arc<Session>,
    pools: Arc<OperationPools>,
    handle: Handle,
}

impl TcpClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_fault_log(config, Arc::new(TracingFaultLog))
    }

    pub fn with_fault_log(config: ClientConfig, faults: Arc<dyn FaultLog>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                events: EngineEvents::new(),
                faults,
                counters: TrafficCounters::default(),
                ids: ConnectionIdGenerator::new(),
                connecting: AtomicBool::new(false),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EngineEvents {
        &self.shared.events
    }

    /// 解析远端地址并建连。
    ///
    /// - 已连接或另一 `start` 正在进行时返回 `Ok(false)`；
    /// - 解析或建连失败时先触发 `ErrorOccurred`，再按 `throw_on_error` 返回 `Err` 或 `Ok(false)`。
    pub async fn start(&self) -> Result<bool, SocketError> {
        let handle = Handle::try_current().map_err(SocketError::NoRuntime)?;
        self.shared.config.validate()?;
        if self.shared.run.lock().is_some() {
            return Ok(false);
        }
        if self.shared.connecting.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let _connecting = ConnectingGuard(&self.shared.connecting);
        self.shared.connect(handle).await
    }

    /// 断开当前连接；未连接时返回 `false`。
    pub fn stop(&self) -> bool {
        let session = self
            .shared
            .run
            .lock()
            .as_ref()
            .map(|run| Arc::clone(&run.session));
        match session {
            Some(session) => self.shared.teardown(&session, DisconnectReason::LocalClose),
            None => false,
        }
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        self.send_inner(payload, None)
    }

    pub fn send_with_token(&self, payload: &[u8], token: UserToken) -> Result<(), SocketError> {
        self.send_inner(payload, Some(token))
    }

    fn send_inner(&self, payload: &[u8], token: Option<UserToken>) -> Result<(), SocketError> {
        let (handle, pools, session) = self
            .shared
            .run
            .lock()
            .as_ref()
            .map(|run| {
                (
                    run.handle.clone(),
                    Arc::clone(&run.pools),
                    Arc::clone(&run.session),
                )
            })
            .ok_or(SocketError::NotRunning)?;
        spawn_send(&handle, Arc::clone(&self.shared), pools, session, payload, token);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.session.is_closing())
    }

    /// 已连接或正在建连。
    pub fn is_running(&self) -> bool {
        self.shared.connecting.load(Ordering::Acquire) || self.shared.run.lock().is_some()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared
            .run
            .lock()
            .as_ref()
            .map(|run| Arc::clone(&run.session))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session().map(|session| session.remote_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session().map(|session| session.local_addr())
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.shared.counters.bytes_written()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.shared.counters.bytes_read()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("remote_host", &self.shared.config.remote_host())
            .field("remote_port", &self.shared.config.remote_port())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// `start` 被取消或返回时复位建连标志。
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClientShared {
    fn fail_start(&self, err: SocketError) -> Result<bool, SocketError> {
        raise_fault(&self.events, &*self.faults, &err, None, None);
        if self.config.throw_on_error() {
            Err(err)
        } else {
            Ok(false)
        }
    }

    async fn open(&self) -> Result<(TcpStream, SocketAddr, SocketAddr), SocketError> {
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
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|err| SocketError::io(Phase::Connect, err))?;
        self.config
            .socket_options()
            .apply(&stream)
            .map_err(|err| SocketError::io(Phase::Connect, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| SocketError::io(Phase::Connect, err))?;
        Ok((stream, remote, local))
    }

    async fn connect(self: &Arc<Self>, handle: Handle) -> Result<bool, SocketError> {
        let (stream, remote, local) = match self.open().await {
            Ok(opened) => opened,
            Err(err) => return self.fail_start(err),
        };

        let pools = Arc::new(OperationPools::new(
            1,
            self.config.send_contexts(),
            self.config.buffer_size(),
        )?);
        let id = self.ids.next_id();
        let context = pools.checkout_read(OperationKind::Connect, Some(id), Some(remote))?;
        let session = Arc::new(Session::new(id, stream, remote, local));
        *self.run.lock() = Some(ClientRun {
            session: Arc::clone(&session),
            pools: Arc::clone(&pools),
            handle: handle.clone(),
        });
        self.counters.connection_opened();
        tracing::info!(%id, %remote, %local, "tcp client connected");
        self.events.emit_connected(&ConnectedEvent { id, remote, local });

        let host = Arc::clone(self);
        handle.spawn(async move {
            let context = receive_loop(host, session, context).await;
            pools.return_read(context);
        });
        Ok(true)
    }
}

impl TransferHost for ClientShared {
    fn events(&self) -> &EngineEvents {
        &self.events
    }

    fn faults(&self) -> &dyn FaultLog {
        &*self.faults
    }

    fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    fn teardown(&self, session: &Arc<Session>, reason: DisconnectReason) -> bool {
        let taken = {
            let mut run = self.run.lock();
            let current = run
                .as_ref()
                .is_some_and(|run| run.session.id() == session.id());
            if current { run.take() } else { None }
        };
        if taken.is_none() {
            return false;
        }
        session.begin_close();
        self.counters.connection_closed();
        tracing::info!(
            id = %session.id(),
            remote = %session.remote_addr(),
            %reason,
            "tcp client disconnected"
        );
        self.events.emit_disconnected(&DisconnectedEvent {
            id: session.id(),
            remote: session.remote_addr(),
            reason,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn send_before_start_is_a_programming_error() {
        let client = TcpClient::new(ClientConfig::new("127.0.0.1", 1));
        assert!(matches!(client.send(b"x"), Err(SocketError::NotRunning)));
        assert!(!client.stop());
        assert!(!client.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolvable_host_reports_connect_phase() {
        let client = TcpClient::new(
            ClientConfig::new("host.invalid", 80).with_throw_on_error(true),
        );
        let err = client.start().await.expect_err("无效主机不应建连成功");
        assert_eq!(err.phase(), Some(Phase::Connect));
        assert!(!client.is_connected());
    }
}
