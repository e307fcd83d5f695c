//! # TcpServer：监听、准入与会话生命周期
//!
//! ## 状态机（What）
//! - `Idle → Listening → Stopped`，`Stopped` 可再次 `start` 回到 `Listening`；
//! - 重复 `start` 返回 `Ok(false)`，对未运行的服务端 `stop` 返回 `false`，均不触发任何事件。
//!
//! ## 接受循环（How）
//! 1. 先从准入闸门获取许可，再等待 `accept`；超出上限的连接停留在 listen backlog 中；
//! 2. 为新连接分配标识、借出读上下文、构造 [`Session`] 并注册；
//! 3. 触发 `Connected`，随后在运行时上启动该会话的接收循环；
//! 4. 接收循环结束后依次归还读上下文与准入许可，许可因此只在会话完全拆除后释放；
//! 5. 单次 `accept` 失败只上报并重试，不会终止监听。
//!
//! ## 拆除（How）
//! - 拆除的唯一入口是 [`TransferHost::teardown`]：只有成功从注册表移除会话的调用者
//!   才会关闭套接字并触发 `Disconnected`，多路并发拆除因此恰好触发一次事件；
//! - `stop` 先置位停止标志并中止接受任务，再对注册表快照逐个拆除；
//!   与 `stop` 竞争的接纳路径在注册后复查停止标志，自行拆除迟到的会话。
//!
//! ## 风险提示（Trade-offs）
//! - 任何回调都不会在持有 `run` 锁时执行，回调内可安全调用 `stop`/`send`/`disconnect`。

use std::{
    collections::HashMap,
    future::poll_fn,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    task::JoinHandle,
};

use crate::{
    admission::{AdmissionController, AdmissionPermit},
    config::ServerConfig,
    context::{OperationKind, OperationPools, UserToken},
    error::{Phase, SocketError},
    event::{ConnectedEvent, DisconnectReason, DisconnectedEvent, EngineEvents},
    fault::{FaultLog, TracingFaultLog},
    registry::SessionRegistry,
    session::{ConnectionId, ConnectionIdGenerator, Session},
    stats::TrafficCounters,
    transfer::{TransferHost, raise_fault, receive_loop, spawn_send},
};

/// 接受失败后的重试间隔，避免文件描述符耗尽时空转。
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 监听套接字的共享槽位。`stop` 取走并析构监听器，描述符在 `stop` 返回前即已关闭。
type ListenerSlot = Arc<Mutex<Option<TcpListener>>>;

/// 异步 TCP 服务端。
///
/// # 教案式说明
/// - **意图 (Why)**：向宿主暴露“启动监听 → 收发 → 断开 → 停止”的完整同步入口，
///   所有网络等待都发生在 Tokio 工作线程上，调用线程从不阻塞；
/// - **契约 (What)**：`start`/`send*` 需在 Tokio 运行时上下文中调用；`stop` 可在任意线程调用，
///   析构时自动执行；
/// - **风险 (Trade-offs)**：`completion_only` 在 Tokio 上仅作记录，IO 模型始终由运行时决定。
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    config: ServerConfig,
    events: EngineEvents,
    faults: Arc<dyn FaultLog>,
    counters: TrafficCounters,
    registry: SessionRegistry,
    admission: AdmissionController,
    ids: ConnectionIdGenerator,
    run: Mutex<Option<ServerRun>>,
}

struct ServerRun {
    local_addr: SocketAddr,
    pools: Arc<OperationPools>,
    handle: Handle,
    active: Arc<AtomicBool>,
    listener: ListenerSlot,
    accept_task: JoinHandle<()>,
}

impl TcpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_fault_log(config, Arc::new(TracingFaultLog))
    }

    pub fn with_fault_log(config: ServerConfig, faults: Arc<dyn FaultLog>) -> Self {
        let admission = AdmissionController::new(config.max_connections());
        Self {
            shared: Arc::new(ServerShared {
                config,
                events: EngineEvents::new(),
                faults,
                counters: TrafficCounters::default(),
                registry: SessionRegistry::new(),
                admission,
                ids: ConnectionIdGenerator::new(),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EngineEvents {
        &self.shared.events
    }

    /// 绑定并开始监听。
    ///
    /// - 已在监听时返回 `Ok(false)`；
    /// - 绑定或监听失败时先触发 `ErrorOccurred`，再按 `throw_on_error` 决定返回 `Err` 还是 `Ok(false)`；
    /// - 不在 Tokio 运行时中调用返回 [`SocketError::NoRuntime`]。
    pub fn start(&self, listen_backlog: i32) -> Result<bool, SocketError> {
        let handle = Handle::try_current().map_err(SocketError::NoRuntime)?;
        let shared = &self.shared;
        shared.config.validate()?;

        let mut run = shared.run.lock();
        if run.is_some() {
            return Ok(false);
        }

        let bound = open_listener(&handle, shared.config.bind_addr(), listen_backlog);
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                drop(run);
                return shared.fail_start(err);
            }
        };

        let pools = Arc::new(OperationPools::new(
            shared.config.max_connections(),
            shared.config.max_connections(),
            shared.config.buffer_size(),
        )?);
        shared.admission.reset();
        let active = Arc::new(AtomicBool::new(true));
        let listener: ListenerSlot = Arc::new(Mutex::new(Some(listener)));
        let accept_task = handle.spawn(accept_loop(
            Arc::clone(shared),
            Arc::clone(&listener),
            Arc::clone(&pools),
            Arc::clone(&active),
            handle.clone(),
        ));
        *run = Some(ServerRun {
            local_addr,
            pools,
            handle,
            active,
            listener,
            accept_task,
        });
        drop(run);

        tracing::info!(
            %local_addr,
            max_connections = shared.config.max_connections(),
            buffer_size = shared.config.buffer_size(),
            listen_backlog,
            completion_only = shared.config.completion_only(),
            "tcp server listening"
        );
        Ok(true)
    }

    /// 停止监听并拆除全部会话；未运行时返回 `false`。
    ///
    /// 返回时监听套接字已经关闭，同一端点可以立即再次 `start`。
    pub fn stop(&self) -> bool {
        let Some(run) = self.shared.run.lock().take() else {
            return false;
        };
        run.active.store(false, Ordering::SeqCst);
        drop(run.listener.lock().take());
        run.accept_task.abort();
        self.shared.admission.reset();

        let sessions = self.shared.registry.snapshot();
        let closed = sessions.len();
        for session in sessions {
            self.shared
                .teardown(&session, DisconnectReason::EngineStopped);
        }
        tracing::info!(local_addr = %run.local_addr, closed, "tcp server stopped");
        true
    }

    pub fn is_listening(&self) -> bool {
        self.shared.run.lock().is_some()
    }

    /// 实际绑定的本地端点；未运行时为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.run.lock().as_ref().map(|run| run.local_addr)
    }

    /// 向指定连接发送一份负载。
    pub fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<(), SocketError> {
        self.send_inner(id, payload, None)
    }

    /// 发送并附带调用方标签，标签随 `DataSent` 一并交付。
    pub fn send_with_token(
        &self,
        id: ConnectionId,
        payload: &[u8],
        token: UserToken,
    ) -> Result<(), SocketError> {
        self.send_inner(id, payload, Some(token))
    }

    /// 按对端端点发送。
    pub fn send_to_peer(&self, peer: SocketAddr, payload: &[u8]) -> Result<(), SocketError> {
        let (handle, pools) = self.shared.active_run()?;
        let session = self
            .shared
            .registry
            .get_by_peer(peer)
            .ok_or(SocketError::UnknownPeer(peer))?;
        spawn_send(&handle, Arc::clone(&self.shared), pools, session, payload, None);
        Ok(())
    }

    /// 向当前全部会话发送同一负载，返回发起的发送数。
    pub fn broadcast(&self, payload: &[u8]) -> Result<usize, SocketError> {
        let (handle, pools) = self.shared.active_run()?;
        let sessions = self.shared.registry.snapshot();
        let count = sessions.len();
        for session in sessions {
            spawn_send(
                &handle,
                Arc::clone(&self.shared),
                Arc::clone(&pools),
                session,
                payload,
                None,
            );
        }
        Ok(count)
    }

    fn send_inner(
        &self,
        id: ConnectionId,
        payload: &[u8],
        token: Option<UserToken>,
    ) -> Result<(), SocketError> {
        let (handle, pools) = self.shared.active_run()?;
        let session = self
            .shared
            .registry
            .get(id)
            .ok_or(SocketError::UnknownConnection(id))?;
        spawn_send(&handle, Arc::clone(&self.shared), pools, session, payload, token);
        Ok(())
    }

    /// 主动断开连接。
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), SocketError> {
        let session = self
            .shared
            .registry
            .get(id)
            .ok_or(SocketError::UnknownConnection(id))?;
        self.shared.teardown(&session, DisconnectReason::LocalClose);
        Ok(())
    }

    pub fn disconnect_peer(&self, peer: SocketAddr) -> Result<(), SocketError> {
        let session = self
            .shared
            .registry
            .get_by_peer(peer)
            .ok_or(SocketError::UnknownPeer(peer))?;
        self.shared.teardown(&session, DisconnectReason::LocalClose);
        Ok(())
    }

    pub fn is_online(&self, id: ConnectionId) -> bool {
        self.shared.registry.contains(id)
    }

    pub fn is_peer_online(&self, peer: SocketAddr) -> bool {
        self.shared.registry.get_by_peer(peer).is_some()
    }

    pub fn remote_endpoint(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.shared
            .registry
            .get(id)
            .map(|session| session.remote_addr())
    }

    /// 当前全部会话的标识与远端端点。
    pub fn sessions(&self) -> HashMap<ConnectionId, SocketAddr> {
        self.shared.registry.endpoints()
    }

    pub fn session(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.shared.registry.get(id)
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.shared.counters.bytes_read()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.shared.counters.bytes_written()
    }

    pub fn connected_count(&self) -> usize {
        self.shared.counters.connected()
    }

    pub fn peak_connected_count(&self) -> usize {
        self.shared.counters.peak_connected()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("bind_addr", &self.shared.config.bind_addr())
            .field("local_addr", &self.local_addr())
            .field("connected", &self.connected_count())
            .finish()
    }
}

fn open_listener(
    handle: &Handle,
    addr: SocketAddr,
    backlog: i32,
) -> Result<(TcpListener, SocketAddr), SocketError> {
    let std_listener = bind_listener(addr, backlog)?;
    let _enter = handle.enter();
    let listener =
        TcpListener::from_std(std_listener).map_err(|err| SocketError::io(Phase::Listen, err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| SocketError::io(Phase::Listen, err))?;
    Ok((listener, local_addr))
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, SocketError> {
    let bind_err = |err| SocketError::io(Phase::Bind, err);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(backlog)
        .map_err(|err| SocketError::io(Phase::Listen, err))?;
    Ok(socket.into())
}

impl ServerShared {
    fn fail_start(&self, err: SocketError) -> Result<bool, SocketError> {
        raise_fault(&self.events, &*self.faults, &err, None, None);
        if self.config.throw_on_error() {
            Err(err)
        } else {
            Ok(false)
        }
    }

    fn active_run(&self) -> Result<(Handle, Arc<OperationPools>), SocketError> {
        self.run
            .lock()
            .as_ref()
            .map(|run| (run.handle.clone(), Arc::clone(&run.pools)))
            .ok_or(SocketError::NotRunning)
    }

    fn admit(
        self: &Arc<Self>,
        handle: &Handle,
        pools: &Arc<OperationPools>,
        active: &AtomicBool,
        stream: TcpStream,
        remote: SocketAddr,
        permit: AdmissionPermit,
    ) {
        if let Err(err) = self.config.socket_options().apply(&stream) {
            raise_fault(
                &self.events,
                &*self.faults,
                &SocketError::io(Phase::Accept, err),
                None,
                Some(remote),
            );
        }
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(err) => {
                raise_fault(
                    &self.events,
                    &*self.faults,
                    &SocketError::io(Phase::Accept, err),
                    None,
                    Some(remote),
                );
                return;
            }
        };
        let id = self.ids.next_id();
        let context = match pools.checkout_read(OperationKind::Accept, Some(id), Some(remote)) {
            Ok(context) => context,
            Err(err) => {
                self.faults.log(&err);
                return;
            }
        };

        let session = Arc::new(Session::new(id, stream, remote, local));
        if !self.registry.add(Arc::clone(&session)) {
            pools.return_read(context);
            return;
        }
        self.counters.connection_opened();
        tracing::debug!(%id, %remote, "connection accepted");
        self.events.emit_connected(&ConnectedEvent { id, remote, local });

        if !active.load(Ordering::SeqCst) {
            self.teardown(&session, DisconnectReason::EngineStopped);
            pools.return_read(context);
            return;
        }

        let host = Arc::clone(self);
        let pools = Arc::clone(pools);
        handle.spawn(async move {
            let context = receive_loop(host, session, context).await;
            pools.return_read(context);
            drop(permit);
        });
    }
}

/// 槽位已被 `stop` 清空时以 `NotConnected` 结束本次接受。
fn poll_accept(
    slot: &Mutex<Option<TcpListener>>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
    match slot.lock().as_ref() {
        Some(listener) => listener.poll_accept(cx),
        None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: ListenerSlot,
    pools: Arc<OperationPools>,
    active: Arc<AtomicBool>,
    handle: Handle,
) {
    loop {
        let Some(permit) = shared.admission.acquire().await else {
            break;
        };
        match poll_fn(|cx| poll_accept(&listener, cx)).await {
            Ok((stream, remote)) => {
                shared.admit(&handle, &pools, &active, stream, remote, permit);
            }
            Err(_) if !active.load(Ordering::SeqCst) => break,
            Err(err) => {
                drop(permit);
                raise_fault(
                    &shared.events,
                    &*shared.faults,
                    &SocketError::io(Phase::Accept, err),
                    None,
                    None,
                );
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    tracing::debug!("accept loop exited");
}

impl TransferHost for ServerShared {
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
        if self.registry.remove(session.id()).is_none() {
            return false;
        }
        session.begin_close();
        self.counters.connection_closed();
        tracing::debug!(
            id = %session.id(),
            remote = %session.remote_addr(),
            %reason,
            bytes_received = session.bytes_received(),
            bytes_sent = session.bytes_sent(),
            "session torn down"
        );
        self.events.emit_disconnected(&DisconnectedEvent {
            id: session.id(),
            remote: session.remote_addr(),
            reason,
        });
        true
    }
}
