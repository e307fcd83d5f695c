use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 引擎级聚合计数：累计收发字节、当前与峰值连接数。
#[derive(Debug, Default)]
pub(crate) struct TrafficCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    connected: AtomicUsize,
    peak_connected: AtomicUsize,
}

impl TrafficCounters {
    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        let now = self.connected.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_connected.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        // 拆除与计数并非同一把锁，饱和递减避免下溢。
        let _ = self
            .connected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn connected(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn peak_connected(&self) -> usize {
        self.peak_connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_water_mark() {
        let counters = TrafficCounters::default();
        counters.connection_opened();
        counters.connection_opened();
        counters.connection_closed();
        counters.connection_opened();
        assert_eq!(counters.connected(), 2);
        assert_eq!(counters.peak_connected(), 2);

        counters.connection_closed();
        counters.connection_closed();
        counters.connection_closed();
        assert_eq!(counters.connected(), 0);
    }
}
