//! # Summary
//!
//! This module defines connections to peer servers. Every pair of servers
//! shares at least one TCP connection, used in both directions: incoming
//! messages are routed through the shared hub to the responsible role
//! thread, and outgoing messages queued on the hub's channel for the peer
//! are written to the socket. A connection announces itself with `Hello`
//! and keeps itself warm with periodic pings.

use serde_derive::{Deserialize, Serialize};
use tokio::net;
use tokio::prelude::*;
use tokio::timer;

use crate::internal;
use crate::message::{self, ServerId, Value};
use crate::shared::Shared;
use crate::socket;

/// Everything one server can say to another.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub enum In {
    Hello(ServerId),
    Ping(ServerId),
    Prepare { from: ServerId, prepare: message::Prepare },
    Promise(message::Promise),
    Accept { from: ServerId, accept: message::Accept },
    Accepted(message::Accepted),
    Commit { instance: usize, value: Value },
    Propose { from: ServerId, id: usize, value: Value },
    ProposeReply { id: usize, ack: bool },
}

/// An accepted connection whose peer has not yet announced itself.
pub struct Connecting {
    self_id: ServerId,
    peer_rx: Option<socket::Rx<In>>,
    peer_tx: Option<socket::Tx<In>>,
    shared: Option<Shared>,
    timeout: std::time::Duration,
}

impl Connecting {
    pub fn new(
        self_id: ServerId,
        stream: net::tcp::TcpStream,
        shared: Shared,
        timeout: std::time::Duration,
    ) -> Self {
        let (peer_rx, peer_tx) = socket::split(stream);
        Connecting {
            self_id,
            peer_rx: Some(peer_rx),
            peer_tx: Some(peer_tx),
            shared: Some(shared),
            timeout,
        }
    }
}

impl Future for Connecting {
    type Item = Peer;
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            match self.peer_rx.as_mut().unwrap().poll()? {
            | Async::Ready(Some(In::Hello(peer_id))) => {
                info!("connected to {}", peer_id);
                let (tx, rx) = internal::pair();
                self.shared.as_mut()
                    .unwrap()
                    .write()
                    .connect_peer(peer_id, tx);
                return Ok(Async::Ready(Peer {
                    self_id: self.self_id,
                    peer_id,
                    rx,
                    peer_rx: self.peer_rx.take().unwrap(),
                    peer_tx: self.peer_tx.take().unwrap(),
                    shared: self.shared.take().unwrap(),
                    keepalive: timer::Interval::new_interval(self.timeout),
                }));
            }
            | Async::Ready(Some(_)) => (),
            | Async::Ready(None) => return Err(()),
            | Async::NotReady => return Ok(Async::NotReady),
            }
        }
    }
}

/// An established connection to a known peer, registered with the hub.
pub struct Peer {
    /// Our own ID
    self_id: ServerId,

    /// The server on the other end
    peer_id: ServerId,

    /// Intra-server receiving channel for outgoing messages
    rx: internal::Rx<In>,

    /// External peer receiving channel
    peer_rx: socket::Rx<In>,

    /// External peer transmitting channel
    peer_tx: socket::Tx<In>,

    /// Intra-server shared transmitting channels
    shared: Shared,

    /// Keepalive schedule
    keepalive: timer::Interval,
}

impl Peer {
    /// Wraps a dialed connection: announces this server to the peer and
    /// registers the peer with the hub immediately.
    pub fn new(
        self_id: ServerId,
        peer_id: ServerId,
        stream: net::tcp::TcpStream,
        shared: Shared,
        timeout: std::time::Duration,
    ) -> Self {
        let (peer_rx, mut peer_tx) = socket::split(stream);
        let (tx, rx) = internal::pair();
        shared.write().connect_peer(peer_id, tx);
        peer_tx.start_send(In::Hello(self_id)).ok();
        info!("connected to {}", peer_id);
        Peer {
            self_id,
            peer_id,
            rx,
            peer_rx,
            peer_tx,
            shared,
            keepalive: timer::Interval::new_interval(timeout),
        }
    }

    fn respond_incoming(&self, message: In) {
        match message {
        | In::Hello(_) | In::Ping(_) => (),
        | message => {
            trace!("received {:?}", message);
            self.shared.deliver(message);
        }
        }
    }
}

impl Future for Peer {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {

        // Keep the connection warm
        while let Async::Ready(Some(_)) = self.keepalive.poll().map_err(|_| ())? {
            self.peer_tx.start_send(In::Ping(self.self_id)).map_err(|_| ())?;
        }

        // Forward incoming messages
        loop {
            match self.peer_rx.poll()? {
            | Async::Ready(Some(message)) => self.respond_incoming(message),
            | Async::Ready(None) => return Ok(Async::Ready(())),
            | Async::NotReady => break,
            }
        }

        // Forward outgoing messages
        while let Async::Ready(Some(message)) = self.rx.poll()? {
            trace!("sending {:?}", message);
            self.peer_tx.start_send(message).map_err(|_| ())?;
        }

        // Complete sends
        self.peer_tx.poll_complete()?;

        Ok(Async::NotReady)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        info!("disconnected from {}", self.peer_id);
        self.shared.write().disconnect_peer(self.peer_id);
    }
}
