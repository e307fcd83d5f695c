//! UDP 服务端：单一接收循环与按端点发送。
//!
//! - **意图 (Why)**：无连接传输没有会话，也不经过准入闸门；所有数据报共用一个读上下文；
//! - **契约 (What)**：
//!   - 接收循环每完成一次 `recv_from` 即同步触发 `DataReceived` 并立即重新接收，长度为 0 的数据报照常交付；
//!   - 无连接复位报告（对端端口不可达经 ICMP 回报为 `ConnectionReset`/`ConnectionRefused`）只记 debug 日志，
//!     既不停止循环也不触发 `ErrorOccurred`；
//!   - 长于接收缓冲的数据报由 `MSG_TRUNC` 标志识别，以 [`SocketError::Truncated`] 上报，
//!     截断后的残缺内容不作为 `DataReceived` 交付；
//!   - 其余接收故障记录并上报后继续接收。
//! - **实现 (How)**：套接字放在共享槽位中，接收与发送都在单次 `poll` 内短暂持锁访问；
//!   `stop` 取走并析构套接字，返回时端口已释放。

use std::{
    future::poll_fn,
    io,
    mem::MaybeUninit,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll, ready},
};

use parking_lot::Mutex;
use socket2::{Domain, MaybeUninitSlice, Protocol, SockRef, Socket, Type};
use tokio::{io::Interest, net::UdpSocket, runtime::Handle, task::JoinHandle};

use crate::{
    config::ServerConfig,
    context::{OperationKind, OperationPools, UserToken},
    error::{Phase, SocketError},
    event::{DataTransferred, EngineEvents},
    fault::{FaultLog, TracingFaultLog},
    signal::CloseSignal,
    stats::TrafficCounters,
    transfer::raise_fault,
};

/// 异步 UDP 服务端。
pub struct UdpServer {
    shared: Arc<UdpShared>,
}

struct UdpShared {
    config: ServerConfig,
    events: EngineEvents,
    faults: Arc<dyn FaultLog>,
    counters: TrafficCounters,
    run: Mutex<Option<UdpRun>>,
}

type SocketSlot = Arc<Mutex<Option<UdpSocket>>>;

struct UdpRun {
    socket: SocketSlot,
    local_addr: SocketAddr,
    pools: Arc<OperationPools>,
    handle: Handle,
    close: Arc<CloseSignal>,
    receive_task: JoinHandle<()>,
}

/// 无连接套接字上由 ICMP 回报的“对端不可达”。
pub(crate) fn is_connectionless_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

impl UdpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_fault_log(config, Arc::new(TracingFaultLog))
    }

    pub fn with_fault_log(config: ServerConfig, faults: Arc<dyn FaultLog>) -> Self {
        Self {
            shared: Arc::new(UdpShared {
                config,
                events: EngineEvents::new(),
                faults,
                counters: TrafficCounters::default(),
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

    /// 绑定并启动接收循环；已运行时返回 `Ok(false)`。
    pub fn start(&self) -> Result<bool, SocketError> {
        let handle = Handle::try_current().map_err(SocketError::NoRuntime)?;
        let shared = &self.shared;
        shared.config.validate()?;

        let mut run = shared.run.lock();
        if run.is_some() {
            return Ok(false);
        }

        let (socket, local_addr) = match open_socket(&handle, shared.config.bind_addr()) {
            Ok(bound) => bound,
            Err(err) => {
                drop(run);
                raise_fault(&shared.events, &*shared.faults, &err, None, None);
                return if shared.config.throw_on_error() {
                    Err(err)
                } else {
                    Ok(false)
                };
            }
        };

        let pools = Arc::new(OperationPools::new(
            1,
            shared.config.max_connections(),
            shared.config.buffer_size(),
        )?);
        let socket: SocketSlot = Arc::new(Mutex::new(Some(socket)));
        let close = Arc::new(CloseSignal::new());
        let receive_task = handle.spawn(receive_loop(
            Arc::clone(shared),
            Arc::clone(&socket),
            Arc::clone(&pools),
            Arc::clone(&close),
        ));
        *run = Some(UdpRun {
            socket,
            local_addr,
            pools,
            handle,
            close,
            receive_task,
        });
        drop(run);

        tracing::info!(%local_addr, buffer_size = shared.config.buffer_size(), "udp server bound");
        Ok(true)
    }

    /// 停止接收循环并关闭套接字；未运行时返回 `false`。
    pub fn stop(&self) -> bool {
        let Some(run) = self.shared.run.lock().take() else {
            return false;
        };
        run.close.close();
        drop(run.socket.lock().take());
        run.receive_task.abort();
        tracing::info!(local_addr = %run.local_addr, "udp server stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.run.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.run.lock().as_ref().map(|run| run.local_addr)
    }

    /// 向指定端点发送一个数据报。
    pub fn send_to(&self, target: SocketAddr, payload: &[u8]) -> Result<(), SocketError> {
        self.send_inner(target, payload, None)
    }

    pub fn send_to_with_token(
        &self,
        target: SocketAddr,
        payload: &[u8],
        token: UserToken,
    ) -> Result<(), SocketError> {
        self.send_inner(target, payload, Some(token))
    }

    fn send_inner(
        &self,
        target: SocketAddr,
        payload: &[u8],
        token: Option<UserToken>,
    ) -> Result<(), SocketError> {
        let (handle, socket, pools) = self
            .shared
            .run
            .lock()
            .as_ref()
            .map(|run| {
                (
                    run.handle.clone(),
                    Arc::clone(&run.socket),
                    Arc::clone(&run.pools),
                )
            })
            .ok_or(SocketError::NotRunning)?;
        let context = pools.checkout_write(None, Some(target), payload, token);
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            let outcome = poll_fn(|cx| poll_send_to(&socket, cx, context.payload(), target)).await;
            match outcome {
                Ok(sent) => {
                    shared.counters.record_written(sent);
                    shared.events.emit_data_sent(
                        &DataTransferred::new(None, target, context.payload(), 0, sent)
                            .with_token(context.user_token()),
                    );
                }
                Err(err) if is_connectionless_reset(&err) => {
                    tracing::debug!(%target, error = %err, "datagram peer unreachable");
                }
                Err(err) => raise_fault(
                    &shared.events,
                    &*shared.faults,
                    &SocketError::io(Phase::Send, err),
                    None,
                    Some(target),
                ),
            }
            pools.return_write(context);
        });
        Ok(())
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.shared.counters.bytes_read()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.shared.counters.bytes_written()
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("bind_addr", &self.shared.config.bind_addr())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn open_socket(handle: &Handle, addr: SocketAddr) -> Result<(UdpSocket, SocketAddr), SocketError> {
    let std_socket = bind_socket(addr)?;
    let _enter = handle.enter();
    let socket =
        UdpSocket::from_std(std_socket).map_err(|err| SocketError::io(Phase::Bind, err))?;
    let local_addr = socket
        .local_addr()
        .map_err(|err| SocketError::io(Phase::Bind, err))?;
    Ok((socket, local_addr))
}

fn bind_socket(addr: SocketAddr) -> Result<std::net::UdpSocket, SocketError> {
    let bind_err = |err| SocketError::io(Phase::Bind, err);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    Ok(socket.into())
}

fn slot_closed() -> io::Error {
    io::ErrorKind::NotConnected.into()
}

/// 一次 `recv_from` 的结果。
struct Datagram {
    length: usize,
    from: SocketAddr,
    truncated: bool,
}

fn poll_send_to(
    slot: &Mutex<Option<UdpSocket>>,
    cx: &mut Context<'_>,
    payload: &[u8],
    target: SocketAddr,
) -> Poll<io::Result<usize>> {
    match slot.lock().as_ref() {
        Some(socket) => socket.poll_send_to(cx, payload, target),
        None => Poll::Ready(Err(slot_closed())),
    }
}

fn poll_recv(
    slot: &Mutex<Option<UdpSocket>>,
    cx: &mut Context<'_>,
    buffer: &mut [u8],
) -> Poll<io::Result<Datagram>> {
    let guard = slot.lock();
    let Some(socket) = guard.as_ref() else {
        return Poll::Ready(Err(slot_closed()));
    };
    loop {
        ready!(socket.poll_recv_ready(cx))?;
        match socket.try_io(Interest::READABLE, || recv_datagram(socket, &mut *buffer)) {
            Ok(datagram) => return Poll::Ready(Ok(datagram)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Poll::Ready(Err(err)),
        }
    }
}

/// 经 `recvmsg` 读取一个数据报，并从返回标志中取出 `MSG_TRUNC`。
fn recv_datagram(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<Datagram> {
    // SAFETY: `u8` 与 `MaybeUninit<u8>` 布局相同；内核只会向切片写入已初始化的字节，
    // 不会把已初始化的内存改回未初始化状态。
    let uninit = unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let mut slices = [MaybeUninitSlice::new(uninit)];
    let (length, flags, from) = SockRef::from(socket).recv_from_vectored(&mut slices)?;
    let from = from.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "datagram from a non-IP address")
    })?;
    Ok(Datagram {
        length,
        from,
        truncated: flags.is_truncated(),
    })
}

async fn receive_loop(
    shared: Arc<UdpShared>,
    socket: SocketSlot,
    pools: Arc<OperationPools>,
    close: Arc<CloseSignal>,
) {
    let mut context = match pools.checkout_read(OperationKind::Receive, None, None) {
        Ok(context) => context,
        Err(err) => {
            shared.faults.log(&err);
            return;
        }
    };
    let capacity = context.buffer().len();
    loop {
        let received = tokio::select! {
            biased;
            () = close.wait() => break,
            received = poll_fn(|cx| poll_recv(&socket, cx, context.receive_buffer())) => received,
        };
        match received {
            Ok(Datagram {
                from,
                truncated: true,
                ..
            }) => raise_fault(
                &shared.events,
                &*shared.faults,
                &SocketError::Truncated {
                    remote: from,
                    capacity,
                },
                None,
                Some(from),
            ),
            Ok(Datagram { length, from, .. }) => {
                context.bind(None, Some(from));
                context.record_transfer(length);
                shared.counters.record_read(length);
                shared.events.emit_data_received(&DataTransferred::new(
                    None,
                    from,
                    context.buffer(),
                    0,
                    length,
                ));
            }
            Err(_) if close.is_closed() => break,
            Err(err) if is_connectionless_reset(&err) => {
                tracing::debug!(error = %err, "datagram peer unreachable");
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => raise_fault(
                &shared.events,
                &*shared.faults,
                &SocketError::io(Phase::Receive, err),
                None,
                None,
            ),
        }
    }
    pools.return_read(context);
}
