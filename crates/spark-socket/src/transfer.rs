//! # 传输引擎：接收循环与发送路径
//!
//! ## 接收循环（How）
//! - 每个会话恰有一个接收任务：等待可读，`try_read` 读入会话绑定的缓冲段，
//!   同步触发 `DataReceived` 后立即进入下一轮，因此同一会话任意时刻至多一个在途读；
//! - 读到 0 字节为对端关闭，复位类错误为断连，两者都进入拆除而不触发 `ErrorOccurred`；
//! - 其他读故障先记录并上报，再以 [`DisconnectReason::ReceiveFault`] 拆除。
//!
//! ## 发送路径（How）
//! - 每次发送借一个写上下文并复制负载，在独立任务中写完后触发 `DataSent` 并归还上下文；
//! - 同一会话的并发发送以 `write_gate` 串行化整段写入，负载之间不会交错，但彼此之间无先后保证；
//! - 复位类写错误拆除会话；其他写故障只上报，不拆除会话；
//! - 会话已进入关闭流程时，在途发送直接放弃，视为已断连。

use std::{io, net::SocketAddr, sync::Arc};

use tokio::runtime::Handle;

use crate::{
    context::{OperationContext, OperationKind, OperationPools, UserToken},
    error::{Disposition, Phase, SocketError, classify},
    event::{DataTransferred, DisconnectReason, EngineEvents, ErrorEvent},
    fault::FaultLog,
    session::{ConnectionId, Session},
    stats::TrafficCounters,
};

/// 接收循环与发送任务回调引擎的接口。
pub(crate) trait TransferHost: Send + Sync + 'static {
    fn events(&self) -> &EngineEvents;

    fn faults(&self) -> &dyn FaultLog;

    fn counters(&self) -> &TrafficCounters;

    /// 拆除会话；仅真正完成拆除的调用者返回 `true` 并触发 `Disconnected`。
    fn teardown(&self, session: &Arc<Session>, reason: DisconnectReason) -> bool;
}

/// 先交给故障日志，再通过 `ErrorOccurred` 上报。
pub(crate) fn raise_fault(
    events: &EngineEvents,
    faults: &dyn FaultLog,
    error: &SocketError,
    id: Option<ConnectionId>,
    remote: Option<SocketAddr>,
) {
    faults.log(error);
    if let Some(phase) = error.phase() {
        events.emit_error(&ErrorEvent {
            phase,
            id,
            remote,
            error,
        });
    }
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// 运行会话的接收循环，直至会话被拆除；返回读上下文供调用方归还。
pub(crate) async fn receive_loop<H: TransferHost>(
    host: Arc<H>,
    session: Arc<Session>,
    mut context: OperationContext,
) -> OperationContext {
    context.set_last_operation(OperationKind::Receive);
    let reason = loop {
        let ready = tokio::select! {
            biased;
            () = session.closed() => break DisconnectReason::LocalClose,
            ready = session.stream().readable() => ready,
        };
        let outcome = ready.and_then(|()| session.stream().try_read(context.receive_buffer()));
        match outcome {
            Ok(0) if session.is_closing() => break DisconnectReason::LocalClose,
            Ok(0) => break DisconnectReason::PeerClosed,
            Ok(read) => {
                context.record_transfer(read);
                session.record_received(read);
                host.counters().record_read(read);
                host.events().emit_data_received(&DataTransferred::new(
                    Some(session.id()),
                    session.remote_addr(),
                    context.buffer(),
                    0,
                    read,
                ));
            }
            Err(err) if is_retryable(&err) => continue,
            Err(_) if session.is_closing() => break DisconnectReason::LocalClose,
            Err(err) => match classify(&err) {
                Disposition::Disconnect => break DisconnectReason::Reset,
                Disposition::Fault => {
                    raise_fault(
                        host.events(),
                        host.faults(),
                        &SocketError::io(Phase::Receive, err),
                        Some(session.id()),
                        Some(session.remote_addr()),
                    );
                    break DisconnectReason::ReceiveFault;
                }
            },
        }
    };
    host.teardown(&session, reason);
    context
}

enum WriteAbort {
    /// 会话已进入关闭流程。
    Closed,
    Io(io::Error),
}

async fn write_payload(session: &Session, payload: &[u8]) -> Result<usize, WriteAbort> {
    if payload.is_empty() {
        return Ok(0);
    }
    let _gate = tokio::select! {
        biased;
        () = session.closed() => return Err(WriteAbort::Closed),
        guard = session.write_gate().lock() => guard,
    };
    let stream = session.stream();
    let mut written = 0;
    while written < payload.len() {
        let ready = tokio::select! {
            biased;
            () = session.closed() => return Err(WriteAbort::Closed),
            ready = stream.writable() => ready,
        };
        ready.map_err(WriteAbort::Io)?;
        match stream.try_write(&payload[written..]) {
            Ok(0) => return Err(WriteAbort::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(err) if is_retryable(&err) => continue,
            Err(err) => return Err(WriteAbort::Io(err)),
        }
    }
    Ok(written)
}

/// 复制负载并在运行时上发起一次发送。
pub(crate) fn spawn_send<H: TransferHost>(
    runtime: &Handle,
    host: Arc<H>,
    pools: Arc<OperationPools>,
    session: Arc<Session>,
    payload: &[u8],
    token: Option<UserToken>,
) {
    let mut context = pools.checkout_write(
        Some(session.id()),
        Some(session.remote_addr()),
        payload,
        token,
    );
    runtime.spawn(async move {
        let outcome = write_payload(&session, context.payload()).await;
        match outcome {
            Ok(written) => {
                context.record_transfer(written);
                session.record_sent(written);
                host.counters().record_written(written);
                host.events().emit_data_sent(
                    &DataTransferred::new(
                        Some(session.id()),
                        session.remote_addr(),
                        context.payload(),
                        0,
                        written,
                    )
                    .with_token(context.user_token()),
                );
            }
            Err(WriteAbort::Closed) => {
                tracing::trace!(id = %session.id(), "send dropped on a closing session");
            }
            Err(WriteAbort::Io(err)) if session.is_closing() => {
                tracing::trace!(
                    id = %session.id(),
                    error = %err,
                    "send failed on a closing session"
                );
            }
            Err(WriteAbort::Io(err)) => match classify(&err) {
                Disposition::Disconnect => {
                    host.teardown(&session, DisconnectReason::Reset);
                }
                Disposition::Fault => raise_fault(
                    host.events(),
                    host.faults(),
                    &SocketError::io(Phase::Send, err),
                    Some(session.id()),
                    Some(session.remote_addr()),
                ),
            },
        }
        pools.return_write(context);
    });
}
