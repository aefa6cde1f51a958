//! # Summary
//!
//! This module defines the `Learner` struct, which records committed
//! instances for its shard. Commits decided by the colocated proposer are
//! replicated to the shard's peer learners, so the decision survives a
//! crash of the proposer that made it; commits received from peers are
//! recorded without re-replication. Every newly learned instance is
//! handed to the delivery observer, which feeds the reorder buffer.

use std::collections::HashMap as Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::prelude::*;

use crate::internal;
use crate::message::{ServerId, Value};
use crate::shared::Shared;
use crate::thread::peer;

/// Local commits come from this server's proposer; remote commits arrive
/// from peer learners in the same shard.
#[derive(Debug)]
pub enum In {
    Local { instance: usize, value: Value },
    Remote { instance: usize, value: Value },
}

pub struct Learner {
    /// Unique ID of this server
    id: ServerId,

    /// Other members of this server's shard
    peers: Vec<ServerId>,

    /// Intra-server receiving channel
    rx: internal::Rx<In>,

    /// Intra-server shared transmitting channels
    shared: Shared,

    /// Commits learned so far, by instance
    log: Map<usize, Value>,

    /// Highest instance learned, shared with the proposer
    last: Arc<AtomicUsize>,

    /// Delivery observer, feeding the reorder buffer
    delivery: internal::Tx<(usize, Value)>,
}

impl Future for Learner {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            match self.rx.poll()? {
            | Async::Ready(Some(In::Local { instance, value })) => {
                self.respond_commit(instance, value, true);
            }
            | Async::Ready(Some(In::Remote { instance, value })) => {
                self.respond_commit(instance, value, false);
            }
            | Async::Ready(None) => return Ok(Async::Ready(())),
            | Async::NotReady => return Ok(Async::NotReady),
            }
        }
    }
}

impl Learner {
    /// Initializes a new learner with the given channels.
    pub fn new(
        id: ServerId,
        peers: Vec<ServerId>,
        rx: internal::Rx<In>,
        shared: Shared,
        last: Arc<AtomicUsize>,
        delivery: internal::Tx<(usize, Value)>,
    ) -> Self {
        Learner {
            id,
            peers,
            rx,
            shared,
            log: Map::default(),
            last,
            delivery,
        }
    }

    /// Records a commit, notifies the delivery observer, and replicates
    /// locally decided commits to shard peers. Duplicates are no-ops.
    fn respond_commit(&mut self, instance: usize, value: Value, replicate: bool) {
        if self.log.contains_key(&instance) {
            trace!("instance {} already learned", instance);
            return;
        }

        info!("server {} learned instance {}: {:?}", self.id, instance, value);
        self.log.insert(instance, value.clone());
        self.last.fetch_max(instance, Ordering::SeqCst);
        self.delivery.try_send((instance, value.clone()));

        if replicate {
            self.shared
                .read()
                .narrowcast(&self.peers, peer::In::Commit { instance, value });
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future;
    use futures::sync::mpsc;

    use super::*;

    fn payload(bytes: &[u8]) -> Value {
        Value::Payload(bytes.to_vec())
    }

    struct Fixture {
        learner: Learner,
        last: Arc<AtomicUsize>,
        delivery: internal::Rx<(usize, Value)>,
        peers: Vec<internal::Rx<peer::In>>,
    }

    /// A learner on server 0 with shard peers 1 and 2, both captured.
    fn fixture() -> Fixture {
        let (acceptor_tx, _acceptor_rx) = internal::pair();
        let (learner_tx, rx) = internal::pair();
        let (proposer_tx, _proposer_rx) = mpsc::channel(1);
        let shared = Shared::new(0, acceptor_tx, learner_tx, proposer_tx);

        let mut peers = Vec::new();
        for id in 1..3 {
            let (tx, peer_rx) = internal::pair();
            shared.write().connect_peer(id, tx);
            peers.push(peer_rx);
        }

        let last = Arc::new(AtomicUsize::new(0));
        let (delivery_tx, delivery) = internal::pair();
        let learner = Learner::new(0, vec![1, 2], rx, shared, last.clone(), delivery_tx);
        Fixture { learner, last, delivery, peers }
    }

    fn drain<T>(rx: &mut internal::Rx<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(Async::Ready(Some(item))) = rx.poll() {
            out.push(item);
        }
        out
    }

    #[test]
    fn replicates_local_commits_to_peers() {
        future::lazy(|| {
            let mut fixture = fixture();
            fixture.learner.respond_commit(1, payload(b"x"), true);

            assert_eq!(fixture.last.load(Ordering::SeqCst), 1);
            assert_eq!(drain(&mut fixture.delivery), vec![(1, payload(b"x"))]);
            for peer in &mut fixture.peers {
                match drain(peer).as_slice() {
                    [peer::In::Commit { instance: 1, value }] => {
                        assert_eq!(*value, payload(b"x"))
                    }
                    messages => panic!("expected one commit, got {:?}", messages),
                }
            }
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }

    #[test]
    fn remote_commits_are_not_replicated_again() {
        future::lazy(|| {
            let mut fixture = fixture();
            fixture.learner.respond_commit(1, payload(b"x"), false);

            assert_eq!(drain(&mut fixture.delivery), vec![(1, payload(b"x"))]);
            for peer in &mut fixture.peers {
                assert!(drain(peer).is_empty());
            }
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }

    #[test]
    fn duplicate_commits_are_idempotent() {
        future::lazy(|| {
            let mut fixture = fixture();
            fixture.learner.respond_commit(1, payload(b"x"), true);
            drain(&mut fixture.delivery);
            for peer in &mut fixture.peers {
                drain(peer);
            }

            fixture.learner.respond_commit(1, payload(b"x"), false);
            fixture.learner.respond_commit(1, payload(b"x"), true);
            assert!(drain(&mut fixture.delivery).is_empty());
            for peer in &mut fixture.peers {
                assert!(drain(peer).is_empty());
            }
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }

    #[test]
    fn tracks_highest_instance_without_contiguity() {
        future::lazy(|| {
            let mut fixture = fixture();
            fixture.learner.respond_commit(4, payload(b"d"), false);
            assert_eq!(fixture.last.load(Ordering::SeqCst), 4);

            // Filling an earlier gap must not move the watermark back.
            fixture.learner.respond_commit(2, payload(b"b"), false);
            assert_eq!(fixture.last.load(Ordering::SeqCst), 4);
            Ok::<_, ()>(())
        })
        .wait()
        .unwrap();
    }
}
