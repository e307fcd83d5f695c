//! 固定大小缓冲段的池化分配。
//!
//! # 模块角色（Why）
//! - 在启动时一次性分配整块连续内存，按 `segment_size` 切分为缓冲段，供读写操作借用；
//! - 释放的缓冲段通过自由链表复用，稳态下不再触发堆分配。
//!
//! # 核心机制（How）
//! - 整块区域以 `BytesMut` 表示，尚未切出的部分保存在 `tail` 中，`cursor` 记录高水位；
//! - `acquire` 优先弹出自由链表，其次通过 `BytesMut::split_to` 从 `tail` 切出新段；
//!   `split_to` 返回的视图共享同一底层分配，但彼此不重叠；
//! - [`Segment`] 不可克隆，持有它即代表对该段的独占所有权：同一缓冲段不可能同时出现在
//!   自由链表与某个在途操作中。
//!
//! # 契约说明（What）
//! - **线程安全**：所有状态由单把 `parking_lot::Mutex` 保护，临界区仅为栈的压入/弹出；
//! - **释放语义**：`release` 不清零内存，调用方不得在释放后读取旧内容；
//! - **耗尽语义**：自由链表为空且剩余空间不足一段时返回 `None`，调用方需自行私有分配。

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::config::ConfigError;

/// 缓冲池借出的一个固定大小缓冲段。
///
/// - `offset`：该段在整块区域中的起始偏移，在段的整个生命周期内保持不变；
/// - 通过 `Deref<Target = [u8]>` 访问段内字节，长度恒等于所属池的 `segment_size`。
#[derive(Debug)]
pub struct Segment {
    offset: usize,
    bytes: BytesMut,
}

impl Segment {
    /// 段在整块区域中的起始偏移。
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for Segment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// 缓冲池的统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BufferPoolStats {
    /// 整块区域的字节数。
    pub total_bytes: usize,
    /// 单段字节数。
    pub segment_size: usize,
    /// 已从区域中切出的段数（高水位）。
    pub carved: usize,
    /// 自由链表中的段数。
    pub free: usize,
    /// 当前被借出的段数。
    pub checked_out: usize,
}

/// 固定段大小的缓冲池。
///
/// # 设计权衡（Trade-offs）
/// - 选择固定段大小而非按需容量，换取 O(1) 的借还路径；
/// - 超过段大小的负载不进入池，由调用方私有分配后直接丢弃。
#[derive(Debug)]
pub struct BufferPool {
    total_bytes: usize,
    segment_size: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<Segment>,
    tail: BytesMut,
    cursor: usize,
    checked_out: usize,
}

impl BufferPool {
    /// 分配 `total_bytes` 字节的整块区域，并以 `segment_size` 为切分粒度。
    pub fn new(total_bytes: usize, segment_size: usize) -> Result<Self, ConfigError> {
        if segment_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be at least 1",
            });
        }
        let mut tail = BytesMut::with_capacity(total_bytes);
        tail.resize(total_bytes, 0);
        Ok(Self {
            total_bytes,
            segment_size,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(total_bytes / segment_size),
                tail,
                cursor: 0,
                checked_out: 0,
            }),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// 借出一个缓冲段；池耗尽时返回 `None`。
    pub fn acquire(&self) -> Option<Segment> {
        let mut state = self.state.lock();
        let segment = match state.free.pop() {
            Some(segment) => segment,
            None if state.tail.len() >= self.segment_size => {
                let offset = state.cursor;
                let bytes = state.tail.split_to(self.segment_size);
                state.cursor += self.segment_size;
                Segment { offset, bytes }
            }
            None => return None,
        };
        state.checked_out += 1;
        Some(segment)
    }

    /// 归还缓冲段。
    pub fn release(&self, segment: Segment) {
        debug_assert_eq!(segment.bytes.len(), self.segment_size);
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.free.push(segment);
    }

    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        BufferPoolStats {
            total_bytes: self.total_bytes,
            segment_size: self.segment_size,
            carved: state.cursor / self.segment_size,
            free: state.free.len(),
            checked_out: state.checked_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex as StdMutex},
        thread,
    };

    #[test]
    fn carves_then_reuses_released_segments() {
        let pool = BufferPool::new(64, 16).expect("创建缓冲池失败");
        let first = pool.acquire().expect("首段借出失败");
        let second = pool.acquire().expect("第二段借出失败");
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 16);
        assert_eq!(first.len(), 16);

        pool.release(first);
        let reused = pool.acquire().expect("复用借出失败");
        assert_eq!(reused.offset(), 0);

        let stats = pool.stats();
        assert_eq!(stats.carved, 2);
        assert_eq!(stats.checked_out, 2);
        assert_eq!(stats.free, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = BufferPool::new(40, 16).expect("创建缓冲池失败");
        let _a = pool.acquire().expect("首段借出失败");
        let _b = pool.acquire().expect("第二段借出失败");
        assert!(pool.acquire().is_none(), "剩余 8 字节不足一段");
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        assert!(BufferPool::new(64, 0).is_err());
    }

    #[test]
    fn segments_do_not_alias() {
        let pool = BufferPool::new(32, 16).expect("创建缓冲池失败");
        let mut a = pool.acquire().expect("借出失败");
        let mut b = pool.acquire().expect("借出失败");
        a.fill(0xAA);
        b.fill(0xBB);
        assert!(a.iter().all(|byte| *byte == 0xAA));
        assert!(b.iter().all(|byte| *byte == 0xBB));
    }

    #[test]
    fn concurrent_holders_never_share_an_offset() {
        let pool = Arc::new(BufferPool::new(8 * 32, 32).expect("创建缓冲池失败"));
        let held = Arc::new(StdMutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let Some(segment) = pool.acquire() else {
                            continue;
                        };
                        assert!(
                            held.lock().unwrap().insert(segment.offset()),
                            "偏移 {} 被两个持有者同时借出",
                            segment.offset()
                        );
                        held.lock().unwrap().remove(&segment.offset());
                        pool.release(segment);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("工作线程 panic");
        }
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Acquire,
        Release(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![Just(Op::Acquire), (0usize..16).prop_map(Op::Release)],
            0..128,
        )
    }

    proptest! {
        #[test]
        fn prop_checked_out_offsets_are_unique(seq in ops()) {
            let pool = BufferPool::new(8 * 4, 4).expect("创建缓冲池失败");
            let mut held: Vec<Segment> = Vec::new();
            for op in seq {
                match op {
                    Op::Acquire => {
                        if let Some(segment) = pool.acquire() {
                            prop_assert!(held.iter().all(|h| h.offset() != segment.offset()));
                            held.push(segment);
                        } else {
                            prop_assert_eq!(held.len(), 8);
                        }
                    }
                    Op::Release(index) if !held.is_empty() => {
                        let segment = held.swap_remove(index % held.len());
                        pool.release(segment);
                    }
                    Op::Release(_) => {}
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.checked_out, held.len());
                prop_assert_eq!(stats.free + stats.checked_out, stats.carved);
            }
        }
    }
}
