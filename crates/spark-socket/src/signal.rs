use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// 一次性关闭信号：置位后唤醒所有等待者，之后的等待立即返回。
///
/// `wait` 先登记 `Notified` 再检查标志位，因此 `close` 与 `wait` 任意交错都不会丢失唤醒。
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 置位信号；仅首次调用返回 `true`。
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test(flavor = "multi_thread")]
    async fn close_wakes_every_waiter() {
        let signal = Arc::new(CloseSignal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signal.close());
        assert!(!signal.close());

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("等待者未被唤醒")
                .expect("等待任务 panic");
        }
    }

    #[tokio::test]
    async fn wait_after_close_returns_immediately() {
        let signal = CloseSignal::new();
        signal.close();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("已关闭的信号不应阻塞");
    }
}
