//! 故障日志协作者。
//!
//! - **意图 (Why)**：引擎在捕获每个故障后、分类与上报之前调用 [`FaultLog::log`]，
//!   日志落点与格式由宿主决定；
//! - **契约 (What)**：实现必须 `Send + Sync`，会在任意 IO 完成线程上被调用，且不得阻塞；
//! - **默认实现**：[`TracingFaultLog`] 以结构化 `tracing::warn!` 事件输出错误码与文案。

use crate::error::SocketError;

/// 接收引擎捕获的每一个故障。
pub trait FaultLog: Send + Sync + 'static {
    fn log(&self, fault: &SocketError);
}

/// 基于 `tracing` 的默认故障日志。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingFaultLog;

impl FaultLog for TracingFaultLog {
    fn log(&self, fault: &SocketError) {
        tracing::warn!(
            code = fault.code(),
            phase = fault.phase().map(|phase| phase.as_str()),
            error = %fault,
            "socket fault"
        );
    }
}
