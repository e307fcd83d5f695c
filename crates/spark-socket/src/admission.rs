//! 连接准入控制。
//!
//! - **意图 (Why)**：限制服务端同时存活的会话数，超出上限的连接留在操作系统的 listen backlog 中；
//! - **契约 (What)**：接受循环在等待 `accept` 之前获取许可；许可随会话一起存活，
//!   仅在会话完全拆除后释放；`reset` 使计数回到满额；
//! - **实现 (How)**：以 `tokio::sync::Semaphore` 作为计数闸门，`reset` 关闭旧闸门并安装新闸门，
//!   旧闸门上仍在等待的获取者立即得到 `None`。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 会话持有的准入许可；析构即释放。
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// 计数信号量形式的准入闸门。
#[derive(Debug)]
pub struct AdmissionController {
    capacity: usize,
    gate: Mutex<Arc<Semaphore>>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            gate: Mutex::new(Arc::new(Semaphore::new(capacity))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn current(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate.lock())
    }

    /// 等待一个空闲槽位；闸门被 `reset` 关闭时返回 `None`。
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        let gate = self.current();
        gate.acquire_owned()
            .await
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.current()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// 当前可用槽位数。
    pub fn available(&self) -> usize {
        self.gate.lock().available_permits()
    }

    /// 计数回到满额。旧许可在析构时归还给已关闭的旧闸门，不影响新计数。
    pub fn reset(&self) {
        let fresh = Arc::new(Semaphore::new(self.capacity));
        let previous = std::mem::replace(&mut *self.gate.lock(), fresh);
        previous.close();
    }
}
