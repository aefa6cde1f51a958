//! # Summary
//!
//! This module defines the leader oracle handle: the per-shard,
//! eventually-accurate belief about which server may propose without
//! contention. The election algorithm itself is external; whatever drives
//! it calls `set`, and consensus roles read the cached belief with
//! `leader`.
//!
//! The cache is updated *before* watchers are signalled, so a waiter that
//! re-reads the cache after draining its watch channel can never miss a
//! change.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::internal;
use crate::message::ServerId;

/// Shared handle to one shard's leader belief.
#[derive(Clone)]
pub struct Oracle(Arc<RwLock<Inner>>);

struct Inner {
    leader: ServerId,
    watchers: Vec<internal::Tx<ServerId>>,
}

impl Oracle {
    /// Creates an oracle with an initial belief.
    pub fn new(leader: ServerId) -> Self {
        Oracle(Arc::new(RwLock::new(Inner {
            leader,
            watchers: Vec::new(),
        })))
    }

    /// The currently believed leader.
    pub fn leader(&self) -> ServerId {
        self.0.read().leader
    }

    /// Replaces the believed leader and notifies watchers of the change.
    pub fn set(&self, leader: ServerId) {
        let mut inner = self.0.write();
        if inner.leader == leader {
            return;
        }
        debug!("leader is now {}", leader);
        inner.leader = leader;
        for watcher in &inner.watchers {
            watcher.try_send(leader);
        }
    }

    /// Subscribes to leader changes. Expected to be bounded at one
    /// subscriber per interested component.
    pub fn watch(&self) -> internal::Rx<ServerId> {
        let (tx, rx) = internal::pair();
        self.0.write().watchers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use tokio::prelude::*;

    use super::*;

    #[test]
    fn cache_updates_before_signal() {
        futures::future::lazy(|| {
            let oracle = Oracle::new(0);
            let mut changes = oracle.watch();
            oracle.set(2);
            assert_eq!(oracle.leader(), 2);
            match changes.poll() {
                Ok(Async::Ready(Some(leader))) => assert_eq!(leader, 2),
                _ => panic!("expected change notification"),
            }
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }

    #[test]
    fn redundant_set_is_silent() {
        futures::future::lazy(|| {
            let oracle = Oracle::new(1);
            let mut changes = oracle.watch();
            oracle.set(1);
            match changes.poll() {
                Ok(Async::NotReady) => (),
                _ => panic!("expected no notification"),
            }
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }
}
