//! # Summary
//!
//! This module wires a whole server together: given this server's ID and
//! the shard map, `run` spawns the consensus roles for the server's own
//! shard, connects to every other server in the cluster, and hands back
//! the atomic broadcast façade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time;

use futures::future;
use futures::sync::mpsc;
use tokio::net;
use tokio::prelude::*;
use tokio::timer;

use crate::broadcast::{AtomicBroadcast, Deliver};
use crate::codec::Codec;
use crate::internal;
use crate::message::{ServerId, ShardId};
use crate::oracle::Oracle;
use crate::shared::Shared;
use crate::thread;

const INTERNAL_PORT: usize = 20000;
const DIAL_RETRIES: usize = 40;
const DIAL_DELAY: time::Duration = time::Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct Config {
    /// Unique server ID
    id: ServerId,

    /// Shard membership for the whole cluster
    shards: HashMap<ShardId, Vec<ServerId>>,

    /// Base port; server `id` listens on `port + id`
    port: usize,

    /// Deadline for quorum phases and remote proposals
    timeout: time::Duration,

    /// Base delay before retrying a failed attempt
    backoff: time::Duration,

    /// Capacity of the pending-proposal queue
    pending: usize,

    /// Capacity of the delivery channel
    capacity: usize,
}

impl Config {
    pub fn new(id: ServerId, shards: HashMap<ShardId, Vec<ServerId>>) -> Self {
        Config {
            id,
            shards,
            port: INTERNAL_PORT,
            timeout: time::Duration::from_secs(1),
            backoff: time::Duration::from_millis(10),
            pending: 10,
            capacity: 100,
        }
    }

    pub fn with_port(mut self, port: usize) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: time::Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_pending(mut self, pending: usize) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Starts the server. Must be called within a tokio runtime; every
    /// role, connection, and delivery task is spawned onto it.
    pub fn run<C: Codec>(self, codec: C) -> AtomicBroadcast<C> {
        let shard = self.shards
            .iter()
            .find(|(_, members)| members.contains(&self.id))
            .map(|(shard, _)| *shard)
            .expect("[INTERNAL ERROR]: server missing from shard map");
        let members = self.shards[&shard].clone();
        let peers = members
            .iter()
            .cloned()
            .filter(|peer| *peer != self.id)
            .collect::<Vec<_>>();

        let (acceptor_tx, acceptor_rx) = internal::pair();
        let (learner_tx, learner_rx) = internal::pair();
        let (delivery_tx, delivery_rx) = internal::pair();
        let (proposer_tx, proposer_rx) = mpsc::channel(self.pending);
        let (out_tx, out_rx) = mpsc::channel(self.capacity);

        let oracles = self.shards
            .iter()
            .map(|(shard, members)| (*shard, Oracle::new(members[0])))
            .collect::<HashMap<_, _>>();

        let shared = Shared::new(self.id, acceptor_tx, learner_tx.clone(), proposer_tx.clone());
        let last = Arc::new(AtomicUsize::new(0));

        tokio::spawn(thread::acceptor::Acceptor::new(
            self.id,
            acceptor_rx,
            shared.clone(),
        ));
        tokio::spawn(thread::learner::Learner::new(
            self.id,
            peers,
            learner_rx,
            shared.clone(),
            last.clone(),
            delivery_tx,
        ));
        tokio::spawn(thread::proposer::Proposer::new(
            self.id,
            members,
            proposer_rx,
            oracles[&shard].clone(),
            shared.clone(),
            learner_tx,
            last,
            self.timeout,
            self.backoff,
        ));
        tokio::spawn(Deliver::new(delivery_rx, out_tx));

        self.listen(shared.clone());
        for peer_id in self.shards
            .values()
            .flat_map(|members| members.iter().cloned())
            .filter(|peer| *peer != self.id)
        {
            self.dial(peer_id, shared.clone());
        }

        AtomicBroadcast::new(
            self.id,
            oracles,
            shared,
            proposer_tx,
            out_rx,
            codec,
            self.timeout,
            self.backoff,
        )
    }

    /// Accepts connections from peer servers.
    fn listen(&self, shared: Shared) {
        let addr = self.address(self.id);
        let listener = net::tcp::TcpListener::bind(&addr)
            .expect("[INTERNAL ERROR]: failed to bind to socket");
        let self_id = self.id;
        let timeout = self.timeout;
        tokio::spawn(
            listener
                .incoming()
                .map_err(|err| warn!("failed to accept connection: {}", err))
                .for_each(move |stream| {
                    let connecting =
                        thread::peer::Connecting::new(self_id, stream, shared.clone(), timeout);
                    tokio::spawn(connecting.and_then(|peer| peer));
                    Ok(())
                }),
        );
    }

    /// Dials one peer server, retrying while the cluster comes up.
    fn dial(&self, peer_id: ServerId, shared: Shared) {
        let addr = self.address(peer_id);
        let self_id = self.id;
        let timeout = self.timeout;
        let connect = future::loop_fn(0usize, move |attempt| {
            net::tcp::TcpStream::connect(&addr).then(move |connected| match connected {
                Ok(stream) => {
                    future::Either::A(future::ok(future::Loop::Break(Some(stream))))
                }
                Err(_) if attempt + 1 < DIAL_RETRIES => future::Either::B(
                    timer::Delay::new(time::Instant::now() + DIAL_DELAY)
                        .map(move |()| future::Loop::Continue(attempt + 1))
                        .map_err(|_| ()),
                ),
                Err(err) => {
                    warn!("giving up dialing {}: {}", peer_id, err);
                    future::Either::A(future::ok(future::Loop::Break(None)))
                }
            })
        })
        .and_then(move |stream| match stream {
            Some(stream) => future::Either::A(thread::peer::Peer::new(
                self_id,
                peer_id,
                stream,
                shared,
                timeout,
            )),
            None => future::Either::B(future::ok(())),
        });
        tokio::spawn(connect);
    }

    fn address(&self, id: ServerId) -> SocketAddr {
        format!("127.0.0.1:{}", self.port + id)
            .parse()
            .expect("[INTERNAL ERROR]: invalid socket address")
    }
}
