//! # Summary
//!
//! Atomic broadcast over sharded Multi-Paxos. Servers are partitioned into
//! shards; within each shard, client-submitted messages are totally ordered
//! by a Multi-Paxos instance chain and delivered exactly once, in increasing
//! sequence order, on every replica. `send` routes a message to the believed
//! leader of each target shard, retrying across leader changes; the
//! [`Delivery`] stream yields the gap-free ordered output.

#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod broadcast;
mod buffer;
mod codec;
mod config;
mod internal;
mod message;
mod oracle;
mod shared;
mod thread;

pub mod socket;

pub use crate::broadcast::{AtomicBroadcast, Broadcast, Delivery, Ordered};
pub use crate::codec::{Bincode, Codec};
pub use crate::config::Config;
pub use crate::message::{Round, ServerId, ShardId, Value};
pub use crate::oracle::Oracle;
