//! # Summary
//!
//! This module implements a central hub for intra-server message routing.
//! The wrapped `State` holds every transmitting channel a connection or
//! role thread might need to reach: peer connections by server ID, the
//! local acceptor and learner, the bounded proposal queue, in-flight
//! quorum waiters by round, and pending propose replies by request ID.
//! We wrap it in `Arc<RwLock<T>>` to share between concurrently running
//! threads.

use std::sync::Arc;

use futures::sync::mpsc;
use futures::sync::oneshot;
use hashbrown::HashMap as Map;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::internal;
use crate::message::{Accepted, Promise, Round, ServerId, Value};
use crate::thread::{acceptor, learner, peer, proposer};

/// Thread-safe wrapper around the `State` forwarding hub.
#[derive(Clone)]
pub struct Shared(Arc<RwLock<State>>);

impl Shared {
    /// Initializes a message hub with the provided role channels.
    pub fn new(
        id: ServerId,
        acceptor_tx: internal::Tx<acceptor::In>,
        learner_tx: internal::Tx<learner::In>,
        proposer_tx: mpsc::Sender<proposer::Pending>,
    ) -> Self {
        Shared(Arc::new(RwLock::new(State {
            id,
            peer_txs: Map::default(),
            promise_txs: Map::default(),
            accepted_txs: Map::default(),
            propose_txs: Map::default(),
            proposed: 0,
            acceptor_tx,
            learner_tx,
            proposer_tx,
        })))
    }

    /// Acquires a read lock on the underlying state.
    pub fn read(&self) -> RwLockReadGuard<State> {
        self.0.read()
    }

    /// Acquires a write lock on the underlying state.
    pub fn write(&self) -> RwLockWriteGuard<State> {
        self.0.write()
    }

    /// Routes a message received from a peer (or, in tests, injected
    /// directly) to the responsible role thread or waiter.
    pub fn deliver(&self, message: peer::In) {
        match message {
            peer::In::Propose { from, id, value } => {
                self.write().respond_propose(from, id, value)
            }
            peer::In::ProposeReply { id, ack } => self.write().respond_reply(id, ack),
            message => self.read().forward(message),
        }
    }

    /// Opens a vote route for prepare responses to `round`. The route is
    /// closed when the returned guard is dropped.
    pub fn register_promise(&self, round: Round) -> (internal::Rx<(ServerId, Promise)>, Guard) {
        let (tx, rx) = internal::pair();
        self.write().promise_txs.insert(round, tx);
        let guard = Guard {
            shared: self.clone(),
            round,
            phase: Phase::Prepare,
        };
        (rx, guard)
    }

    /// Opens a vote route for accept responses to `round`.
    pub fn register_accepted(&self, round: Round) -> (internal::Rx<(ServerId, Accepted)>, Guard) {
        let (tx, rx) = internal::pair();
        self.write().accepted_txs.insert(round, tx);
        let guard = Guard {
            shared: self.clone(),
            round,
            phase: Phase::Accept,
        };
        (rx, guard)
    }

    /// Registers a reply slot for an outward propose request and returns
    /// the request ID to send with it.
    pub fn register_propose(&self, tx: oneshot::Sender<bool>) -> usize {
        let mut state = self.write();
        state.proposed += 1;
        let id = state.proposed;
        state.propose_txs.insert(id, tx);
        id
    }

    /// Abandons an outward propose request that timed out.
    pub fn cancel_propose(&self, id: usize) {
        self.write().propose_txs.remove(&id);
    }
}

/// Closes a quorum vote route on drop, so abandoned rounds do not leave
/// stale entries behind in the hub.
pub struct Guard {
    shared: Shared,
    round: Round,
    phase: Phase,
}

enum Phase {
    Prepare,
    Accept,
}

impl Drop for Guard {
    fn drop(&mut self) {
        let mut state = self.shared.write();
        match self.phase {
            Phase::Prepare => {
                state.promise_txs.remove(&self.round);
            }
            Phase::Accept => {
                state.accepted_txs.remove(&self.round);
            }
        }
    }
}

/// Collection of intra-server transmitting channels.
pub struct State {
    id: ServerId,
    peer_txs: Map<ServerId, internal::Tx<peer::In>>,
    promise_txs: Map<Round, internal::Tx<(ServerId, Promise)>>,
    accepted_txs: Map<Round, internal::Tx<(ServerId, Accepted)>>,
    propose_txs: Map<usize, oneshot::Sender<bool>>,
    proposed: usize,
    acceptor_tx: internal::Tx<acceptor::In>,
    learner_tx: internal::Tx<learner::In>,
    proposer_tx: mpsc::Sender<proposer::Pending>,
}

impl State {
    /// Registers the provided peer channel with this hub.
    pub fn connect_peer(&mut self, id: ServerId, tx: internal::Tx<peer::In>) {
        self.peer_txs.insert(id, tx);
    }

    /// Disconnects the provided peer from this hub.
    pub fn disconnect_peer(&mut self, id: ServerId) {
        self.peer_txs.remove(&id);
    }

    /// Forwards a message to the given server, routing internally when the
    /// server is this one. Messages to unconnected servers are dropped;
    /// quorum waiters treat the missing vote as a failure.
    pub fn send(&self, server: ServerId, message: peer::In) {
        if server == self.id {
            self.forward(message);
        } else if let Some(tx) = self.peer_txs.get(&server) {
            tx.try_send(message);
        } else {
            trace!("no connection to {}, dropping {:?}", server, message);
        }
    }

    /// Forwards a message to the provided list of servers.
    pub fn narrowcast(&self, servers: &[ServerId], message: peer::In) {
        for server in servers {
            self.send(*server, message.clone());
        }
    }

    /// Forwards a message within this process.
    fn forward(&self, message: peer::In) {
        match message {
        | peer::In::Hello(_)
        | peer::In::Ping(_) => (),
        | peer::In::Prepare { from, prepare } => {
            self.acceptor_tx.send(acceptor::In::Prepare { from, prepare })
        }
        | peer::In::Accept { from, accept } => {
            self.acceptor_tx.send(acceptor::In::Accept { from, accept })
        }
        | peer::In::Promise(promise) => {
            if let Some(tx) = self.promise_txs.get(&promise.round) {
                tx.try_send((promise.acceptor, promise));
            } else {
                trace!("no waiter for {:?}", promise.round);
            }
        }
        | peer::In::Accepted(accepted) => {
            if let Some(tx) = self.accepted_txs.get(&accepted.round) {
                tx.try_send((accepted.acceptor, accepted));
            } else {
                trace!("no waiter for {:?}", accepted.round);
            }
        }
        | peer::In::Commit { instance, value } => {
            self.learner_tx.send(learner::In::Remote { instance, value })
        }
        | peer::In::Propose { .. }
        | peer::In::ProposeReply { .. } => {
            unreachable!("[INTERNAL ERROR]: propose traffic routed through forward")
        }
        }
    }

    /// Hands a remote proposal to the local proposer, answering with an
    /// immediate NACK when the bounded queue cannot take it.
    fn respond_propose(&mut self, from: ServerId, id: usize, value: Value) {
        let pending = proposer::Pending {
            value,
            slot: proposer::Slot::Remote { from, id },
        };
        if self.proposer_tx.try_send(pending).is_err() {
            debug!("proposal queue full, nacking propose {} from {}", id, from);
            self.send(from, peer::In::ProposeReply { id, ack: false });
        }
    }

    /// Resolves a pending outward propose request.
    fn respond_reply(&mut self, id: usize, ack: bool) {
        if let Some(tx) = self.propose_txs.remove(&id) {
            tx.send(ack).ok();
        } else {
            trace!("no pending propose {}", id);
        }
    }
}
