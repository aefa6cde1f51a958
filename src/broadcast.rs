//! # Summary
//!
//! This module defines the application-facing façade. `send` encodes a
//! message once and runs one retry loop per target shard: read the shard's
//! believed leader, propose to it, and on a NACK, a timeout, or a missing
//! connection, back off and try again until the shard accepts. The
//! `Delivery` stream is the other half: commits observed by the local
//! learner pass through the reorder buffer and come out as a gap-free,
//! strictly ordered sequence of decoded messages.

use std::collections::HashMap;
use std::time;

use futures::sync::mpsc;
use futures::sync::oneshot;
use futures::future;
use tokio::prelude::*;
use tokio::timer;

use crate::buffer::Buffer;
use crate::codec::Codec;
use crate::internal;
use crate::message::{ServerId, ShardId, Value};
use crate::oracle::Oracle;
use crate::shared::Shared;
use crate::thread::peer;
use crate::thread::proposer::{Pending, Slot};

/// A delivered message, stamped with its position in the shard's total
/// order. Sequence numbers start at 1 and have no gaps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ordered<M> {
    pub sequence: usize,
    pub message: M,
}

/// Handle to a running server. Cloning yields another sending handle;
/// the delivery stream can be taken exactly once.
pub struct AtomicBroadcast<C: Codec> {
    id: ServerId,
    oracles: HashMap<ShardId, Oracle>,
    shared: Shared,
    proposer_tx: mpsc::Sender<Pending>,
    delivery: Option<mpsc::Receiver<(usize, Vec<u8>)>>,
    codec: C,
    timeout: time::Duration,
    backoff: time::Duration,
}

impl<C: Codec> AtomicBroadcast<C> {
    pub(crate) fn new(
        id: ServerId,
        oracles: HashMap<ShardId, Oracle>,
        shared: Shared,
        proposer_tx: mpsc::Sender<Pending>,
        delivery: mpsc::Receiver<(usize, Vec<u8>)>,
        codec: C,
        timeout: time::Duration,
        backoff: time::Duration,
    ) -> Self {
        AtomicBroadcast {
            id,
            oracles,
            shared,
            proposer_tx,
            delivery: Some(delivery),
            codec,
            timeout,
            backoff,
        }
    }

    /// This server's ID.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// The leader oracle for the given shard.
    pub fn oracle(&self, shard: ShardId) -> Oracle {
        self.oracles[&shard].clone()
    }

    /// Broadcasts a message to every target shard. The returned future
    /// resolves once every shard has accepted the message; it retries
    /// through leader changes and transport failures indefinitely.
    pub fn send(&self, message: &C::Message, shards: &[ShardId]) -> Broadcast {
        let value = Value::Payload(self.codec.encode(message));
        let senders = shards
            .iter()
            .map(|shard| Sender {
                id: self.id,
                shard: *shard,
                value: value.clone(),
                oracle: self.oracles
                    .get(shard)
                    .cloned()
                    .expect("[INTERNAL ERROR]: unknown shard"),
                shared: self.shared.clone(),
                local: self.proposer_tx.clone(),
                timeout: self.timeout,
                backoff: self.backoff,
                state: SendState::Idle,
            })
            .collect::<Vec<_>>();
        Broadcast {
            inner: future::join_all(senders),
        }
    }

    /// The ordered delivery stream for this server's own shard. Panics if
    /// taken twice.
    pub fn delivery(&mut self) -> Delivery<C> {
        Delivery {
            rx: self.delivery
                .take()
                .expect("[INTERNAL ERROR]: delivery stream already taken"),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> Clone for AtomicBroadcast<C> {
    fn clone(&self) -> Self {
        AtomicBroadcast {
            id: self.id,
            oracles: self.oracles.clone(),
            shared: self.shared.clone(),
            proposer_tx: self.proposer_tx.clone(),
            delivery: None,
            codec: self.codec.clone(),
            timeout: self.timeout,
            backoff: self.backoff,
        }
    }
}

/// Resolves once every target shard has accepted the message.
pub struct Broadcast {
    inner: future::JoinAll<Vec<Sender>>,
}

impl Future for Broadcast {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        match self.inner.poll()? {
        | Async::Ready(_) => Ok(Async::Ready(())),
        | Async::NotReady => Ok(Async::NotReady),
        }
    }
}

/// One shard's at-least-once submission loop.
struct Sender {
    id: ServerId,
    shard: ShardId,
    value: Value,
    oracle: Oracle,
    shared: Shared,
    local: mpsc::Sender<Pending>,
    timeout: time::Duration,
    backoff: time::Duration,
    state: SendState,
}

enum SendState {
    /// About to attempt the current leader.
    Idle,
    /// Waiting for room on the local proposer's bounded queue.
    Enqueue(Pending, oneshot::Receiver<bool>),
    /// Submitted locally; waiting for the instance to resolve.
    Waiting(oneshot::Receiver<bool>),
    /// Proposed to a remote leader; waiting for its reply.
    Remote {
        id: usize,
        reply: oneshot::Receiver<bool>,
        deadline: timer::Delay,
    },
    /// Attempt failed; sleeping before the next one.
    Backoff(timer::Delay),
}

impl Sender {
    fn attempt(&mut self) -> SendState {
        let leader = self.oracle.leader();
        let (tx, rx) = oneshot::channel();
        if leader == self.id {
            let pending = Pending {
                value: self.value.clone(),
                slot: Slot::Local(tx),
            };
            SendState::Enqueue(pending, rx)
        } else {
            let id = self.shared.register_propose(tx);
            trace!("proposing {:?} to {} for shard {}", self.value, leader, self.shard);
            self.shared.read().send(leader, peer::In::Propose {
                from: self.id,
                id,
                value: self.value.clone(),
            });
            SendState::Remote {
                id,
                reply: rx,
                deadline: timer::Delay::new(time::Instant::now() + self.timeout),
            }
        }
    }

    fn pause(&self) -> SendState {
        let jitter = 1.0 + rand::random::<f64>();
        SendState::Backoff(timer::Delay::new(
            time::Instant::now() + self.backoff.mul_f64(jitter),
        ))
    }
}

impl Future for Sender {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, SendState::Idle) {
            | SendState::Idle => {
                self.state = self.attempt();
            }
            | SendState::Enqueue(pending, reply) => {
                match self.local.start_send(pending).map_err(|_| ())? {
                | AsyncSink::Ready => self.state = SendState::Waiting(reply),
                | AsyncSink::NotReady(pending) => {
                    self.state = SendState::Enqueue(pending, reply);
                    return Ok(Async::NotReady);
                }
                }
            }
            | SendState::Waiting(mut reply) => match reply.poll() {
                Ok(Async::Ready(true)) => {
                    debug!("shard {} accepted {:?}", self.shard, self.value);
                    return Ok(Async::Ready(()));
                }
                Ok(Async::Ready(false)) | Err(_) => self.state = self.pause(),
                Ok(Async::NotReady) => {
                    self.state = SendState::Waiting(reply);
                    return Ok(Async::NotReady);
                }
            },
            | SendState::Remote { id, mut reply, mut deadline } => match reply.poll() {
                Ok(Async::Ready(true)) => {
                    debug!("shard {} accepted {:?}", self.shard, self.value);
                    return Ok(Async::Ready(()));
                }
                Ok(Async::Ready(false)) | Err(_) => self.state = self.pause(),
                Ok(Async::NotReady) => match deadline.poll().map_err(|_| ())? {
                    Async::Ready(()) => {
                        trace!("propose {} to shard {} timed out", id, self.shard);
                        self.shared.cancel_propose(id);
                        self.state = self.pause();
                    }
                    Async::NotReady => {
                        self.state = SendState::Remote { id, reply, deadline };
                        return Ok(Async::NotReady);
                    }
                },
            },
            | SendState::Backoff(mut delay) => match delay.poll().map_err(|_| ())? {
                Async::Ready(()) => self.state = SendState::Idle,
                Async::NotReady => {
                    self.state = SendState::Backoff(delay);
                    return Ok(Async::NotReady);
                }
            },
            }
        }
    }
}

/// Pushes learned instances through the reorder buffer and releasable
/// payloads into the bounded delivery channel. Sole owner of the buffer,
/// so no further locking is needed around it.
pub(crate) struct Deliver {
    rx: internal::Rx<(usize, Value)>,
    buffer: Buffer,
    out: mpsc::Sender<(usize, Vec<u8>)>,
    staged: Option<(usize, Vec<u8>)>,
}

impl Deliver {
    pub(crate) fn new(
        rx: internal::Rx<(usize, Value)>,
        out: mpsc::Sender<(usize, Vec<u8>)>,
    ) -> Self {
        Deliver {
            rx,
            buffer: Buffer::new(),
            out,
            staged: None,
        }
    }
}

impl Future for Deliver {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            // Flush everything releasable before taking more input; the
            // bounded channel is what slows delivery to the application's
            // pace.
            while let Some(item) = self.staged.take().or_else(|| self.buffer.pop()) {
                match self.out.start_send(item).map_err(|_| ())? {
                | AsyncSink::Ready => continue,
                | AsyncSink::NotReady(item) => {
                    self.staged = Some(item);
                    return Ok(Async::NotReady);
                }
                }
            }

            match self.rx.poll()? {
            | Async::Ready(Some((instance, value))) => self.buffer.insert(instance, value),
            | Async::Ready(None) => return Ok(Async::Ready(())),
            | Async::NotReady => return Ok(Async::NotReady),
            }
        }
    }
}

/// The ordered stream of messages decided by this server's shard.
pub struct Delivery<C: Codec> {
    rx: mpsc::Receiver<(usize, Vec<u8>)>,
    codec: C,
}

impl<C: Codec> Stream for Delivery<C> {
    type Item = Ordered<C::Message>;
    type Error = ();

    fn poll(&mut self) -> Result<Async<Option<Self::Item>>, Self::Error> {
        loop {
            match self.rx.poll()? {
            | Async::Ready(Some((sequence, bytes))) => match self.codec.decode(&bytes) {
                Ok(message) => return Ok(Async::Ready(Some(Ordered { sequence, message }))),
                Err(err) => {
                    error!("dropping undecodable delivery {}: {}", sequence, err);
                    continue;
                }
            },
            | Async::Ready(None) => return Ok(Async::Ready(None)),
            | Async::NotReady => return Ok(Async::NotReady),
            }
        }
    }
}
