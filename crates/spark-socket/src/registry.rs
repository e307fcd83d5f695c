//! # SessionRegistry：存活会话表
//!
//! ## 核心意图（Why）
//! - 以连接标识为主索引、远端端点为二级索引，支持按标识或按对端地址发送与断开；
//! - 基于 `DashMap` 分片存储，无关会话之间的增删查不会被一把全局锁串行化。
//!
//! ## 行为契约（What）
//! - `add`：标识已存在时记录告警并返回 `false`，不抛错，以容忍重复接受的竞态；
//! - `remove`：原子移除并返回会话；并发调用时只有一个调用者拿到 `Some`，
//!   拆除流程据此保证 `Disconnected` 恰好触发一次；
//! - 两个索引成对更新：`add` 在持有主索引条目锁期间写入二级索引，读者不会观察到半完成状态。
//!
//! ## 风险提示（Trade-offs）
//! - 只有 `add` 会嵌套持有两个索引的分片锁，且顺序固定为“主索引 → 二级索引”；
//!   其余路径从不同时持有两把锁，因此不会形成环形等待；
//! - `snapshot` 返回 `Arc` 拷贝，遍历期间的增删不影响快照本身。

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::session::{ConnectionId, Session};

/// 可注册进 [`SessionRegistry`] 的会话记录。
pub trait Registrable: Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;
    fn peer_addr(&self) -> SocketAddr;
}

/// 并发安全的会话表。
#[derive(Debug)]
pub struct SessionRegistry<S: Registrable = Session> {
    by_id: DashMap<ConnectionId, Arc<S>>,
    by_peer: DashMap<SocketAddr, ConnectionId>,
}

impl<S: Registrable> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            by_id: DashMap::new(),
            by_peer: DashMap::new(),
        }
    }
}

impl<S: Registrable> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话；标识已存在时返回 `false`。
    pub fn add(&self, session: Arc<S>) -> bool {
        let id = session.connection_id();
        match self.by_id.entry(id) {
            Entry::Occupied(_) => {
                tracing::warn!(%id, "duplicate session registration ignored");
                false
            }
            Entry::Vacant(vacant) => {
                self.by_peer.insert(session.peer_addr(), id);
                vacant.insert(session);
                true
            }
        }
    }

    /// 移除会话，并清理仍指向它的二级索引条目。
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<S>> {
        let (_, session) = self.by_id.remove(&id)?;
        self.by_peer
            .remove_if(&session.peer_addr(), |_, owner| *owner == id);
        Some(session)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<S>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// 按远端端点查找会话。
    pub fn get_by_peer(&self, peer: SocketAddr) -> Option<Arc<S>> {
        let id = *self.by_peer.get(&peer)?.value();
        self.get(id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// 当前全部会话的快照，用于停止与广播等批量操作。
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.by_id
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 标识到远端端点的映射。
    pub fn endpoints(&self) -> HashMap<ConnectionId, SocketAddr> {
        self.by_id
            .iter()
            .map(|entry| (*entry.key(), entry.value().peer_addr()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Barrier,
        thread,
    };

    #[derive(Debug)]
    struct FakeSession {
        id: ConnectionId,
        peer: SocketAddr,
    }

    impl Registrable for FakeSession {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }

        fn peer_addr(&self) -> SocketAddr {
            self.peer
        }
    }

    fn entry(id: u64, port: u16) -> Arc<FakeSession> {
        Arc::new(FakeSession {
            id: ConnectionId::from_raw(id),
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        })
    }

    #[test]
    fn duplicate_add_is_rejected_without_replacing() {
        let registry = SessionRegistry::new();
        assert!(registry.add(entry(1, 1000)));
        assert!(!registry.add(entry(1, 2000)));
        let kept = registry.get(ConnectionId::from_raw(1)).expect("会话应仍存在");
        assert_eq!(kept.peer.port(), 1000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn peer_index_follows_primary() {
        let registry = SessionRegistry::new();
        let session = entry(3, 4000);
        registry.add(Arc::clone(&session));
        let found = registry
            .get_by_peer(session.peer)
            .expect("二级索引应命中");
        assert_eq!(found.id, session.id);

        assert!(registry.remove(session.id).is_some());
        assert!(registry.get_by_peer(session.peer).is_none());
        assert!(registry.endpoints().is_empty());
    }

    #[test]
    fn stale_peer_entry_does_not_evict_newer_owner() {
        let registry = SessionRegistry::new();
        registry.add(entry(1, 5000));
        registry.add(entry(2, 5000));
        registry.remove(ConnectionId::from_raw(1));
        let owner = registry
            .get_by_peer(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000))
            .expect("较新的会话应保留二级索引");
        assert_eq!(owner.id, ConnectionId::from_raw(2));
    }

    #[test]
    fn concurrent_remove_succeeds_exactly_once() {
        let registry = Arc::new(SessionRegistry::new());
        registry.add(entry(42, 4242));
        let barrier = Arc::new(Barrier::new(8));

        let winners: usize = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    usize::from(registry.remove(ConnectionId::from_raw(42)).is_some())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|worker| worker.join().expect("工作线程 panic"))
            .sum();
        assert_eq!(winners, 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u64),
        Remove(u64),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![
                (0u64..16).prop_map(Op::Add),
                (0u64..16).prop_map(Op::Remove),
            ],
            0..96,
        )
    }

    proptest! {
        #[test]
        fn prop_every_added_id_is_removed_once(seq in ops()) {
            let registry = SessionRegistry::new();
            // 每个标识对应唯一端口，与 TCP 上存活连接的对端端点互不相同一致。
            let mut model: HashMap<u64, u16> = HashMap::new();
            for op in seq {
                match op {
                    Op::Add(id) => {
                        let port = 1000 + id as u16;
                        let added = registry.add(entry(id, port));
                        prop_assert_eq!(added, !model.contains_key(&id));
                        model.entry(id).or_insert(port);
                    }
                    Op::Remove(id) => {
                        let removed = registry.remove(ConnectionId::from_raw(id));
                        prop_assert_eq!(removed.is_some(), model.remove(&id).is_some());
                        prop_assert!(registry.remove(ConnectionId::from_raw(id)).is_none());
                    }
                }
                prop_assert_eq!(registry.len(), model.len());
                for (id, port) in &model {
                    let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port);
                    let hit = registry.get_by_peer(peer).map(|session| session.id);
                    prop_assert_eq!(hit, Some(ConnectionId::from_raw(*id)));
                    prop_assert!(registry.contains(ConnectionId::from_raw(*id)));
                }
            }
        }
    }
}
