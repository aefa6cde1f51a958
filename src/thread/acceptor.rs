//! # Summary
//!
//! This module defines the `Acceptor` struct, which acts as the protocol's
//! distributed memory. Acceptors track, per instance, the highest round
//! they have promised and the highest-round value they have accepted, and
//! answer prepare and accept requests against that table. They never
//! contact any other role.

use std::collections::HashMap as Map;

use tokio::prelude::*;

use crate::internal;
use crate::message::{self, Round, ServerId, Value};
use crate::shared::Shared;
use crate::thread::peer;

/// Acceptors receive prepares and accepts from proposers.
#[derive(Debug)]
pub enum In {
    Prepare { from: ServerId, prepare: message::Prepare },
    Accept { from: ServerId, accept: message::Accept },
}

pub struct Acceptor {
    /// Unique ID of this server
    id: ServerId,

    /// Intra-server receiving channel
    rx: internal::Rx<In>,

    /// Intra-server shared transmitting channels
    shared: Shared,

    /// Promised and accepted state per instance
    instances: Map<usize, Instance>,
}

/// The default state of an instance: nothing promised, nothing accepted.
#[derive(Default)]
struct Instance {
    promised: Option<Round>,
    accepted: Option<(Round, Value)>,
}

impl Future for Acceptor {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            match self.rx.poll()? {
            | Async::Ready(Some(In::Prepare { from, prepare })) => {
                trace!("received {:?}", prepare);
                self.respond_prepare(from, prepare);
            }
            | Async::Ready(Some(In::Accept { from, accept })) => {
                trace!("received {:?}", accept);
                self.respond_accept(from, accept);
            }
            | Async::Ready(None) => return Ok(Async::Ready(())),
            | Async::NotReady => return Ok(Async::NotReady),
            }
        }
    }
}

impl Acceptor {
    /// Initializes a new acceptor with the given channels.
    pub fn new(id: ServerId, rx: internal::Rx<In>, shared: Shared) -> Self {
        Acceptor {
            id,
            rx,
            shared,
            instances: Map::default(),
        }
    }

    /// Promises the prepare's round if it is higher than any promised so
    /// far, acknowledging with whatever this acceptor has already accepted
    /// for the instance. Otherwise answers with the round that blocks it.
    fn respond_prepare(&mut self, from: ServerId, prepare: message::Prepare) {
        let instance = self.instances.entry(prepare.instance).or_default();
        let promise = if instance.promised.map_or(true, |promised| prepare.round > promised) {
            instance.promised = Some(prepare.round);
            message::Promise {
                acceptor: self.id,
                instance: prepare.instance,
                round: prepare.round,
                ack: true,
                accepted: instance.accepted.clone(),
                higher: None,
            }
        } else {
            message::Promise {
                acceptor: self.id,
                instance: prepare.instance,
                round: prepare.round,
                ack: false,
                accepted: None,
                higher: instance.promised,
            }
        };
        trace!("sending {:?} to {}", promise, from);
        self.shared.read().send(from, peer::In::Promise(promise));
    }

    /// Accepts the value unless a higher round has been promised since.
    fn respond_accept(&mut self, from: ServerId, accept: message::Accept) {
        let instance = self.instances.entry(accept.instance).or_default();
        let ack = instance.promised.map_or(true, |promised| accept.round >= promised);
        if ack {
            instance.promised = Some(accept.round);
            instance.accepted = Some((accept.round, accept.value));
        }
        let accepted = message::Accepted {
            acceptor: self.id,
            instance: accept.instance,
            round: accept.round,
            ack,
        };
        trace!("sending {:?} to {}", accepted, from);
        self.shared.read().send(from, peer::In::Accepted(accepted));
    }
}
