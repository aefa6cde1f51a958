//! # Summary
//!
//! This module defines the messages exchanged between servers during
//! consensus, along with the identifiers they are built from.

use serde_derive::{Deserialize, Serialize};

/// Unique server ID, assigned by deployment configuration.
pub type ServerId = usize;

/// Unique shard ID. Each server belongs to exactly one shard.
pub type ShardId = usize;

/// Paxos ballot number. Totally ordered, with the proposer ID breaking
/// ties between rounds proposed by different servers.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Round {
    pub number: usize,
    pub proposer: ServerId,
}

impl Round {
    /// The next round this proposer may use. Strictly greater than both
    /// `self` and every round of `self.number` owned by other proposers.
    pub fn next(self, proposer: ServerId) -> Self {
        Round {
            number: self.number + 1,
            proposer,
        }
    }
}

/// A value driven through a consensus instance: either an opaque
/// application payload, or the designated no-op marker. No-ops consume an
/// instance number without appearing in the delivered stream, so an empty
/// payload remains a valid message.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Noop,
    Payload(Vec<u8>),
}

/// Phase one request: claim `round` for `instance`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Prepare {
    pub instance: usize,
    pub round: Round,
    pub value: Value,
}

/// Phase one response. An ACK reports the highest-round value this
/// acceptor has already accepted for the instance, if any; a NACK carries
/// the higher round it has promised, so the proposer can fast-forward.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq)]
pub struct Promise {
    pub acceptor: ServerId,
    pub instance: usize,
    pub round: Round,
    pub ack: bool,
    pub accepted: Option<(Round, Value)>,
    pub higher: Option<Round>,
}

/// Phase two request: accept `value` at `round` for `instance`.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Accept {
    pub instance: usize,
    pub round: Round,
    pub value: Value,
}

/// Phase two response.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq)]
pub struct Accepted {
    pub acceptor: ServerId,
    pub instance: usize,
    pub round: Round,
    pub ack: bool,
}
