//! # Summary
//!
//! This module abstracts over internal connections between role threads.
//!
//! Backed by `futures::sync::mpsc` unbounded channels. An unbounded send
//! can only fail if the receiving end has been dropped, which indicates a
//! wiring error somewhere in this implementation; `send` panics on that
//! case, while `try_send` is available for channels whose receiver is
//! allowed to go away (quorum waiters, delivery observers).

use futures::sync::mpsc;
use tokio::prelude::*;

/// Intra-server receiving channel.
#[derive(Debug)]
pub struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-server transmitting channel. All clones send to the same receiver.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
#[derive(Debug)]
pub struct Tx<T>(mpsc::UnboundedSender<T>);

/// Creates a linked pair of transmitting and receiving channels.
pub fn pair<T>() -> (Tx<T>, Rx<T>) {
    let (tx, rx) = mpsc::unbounded();
    (Tx(tx), Rx(rx))
}

impl<T> Tx<T> {
    /// Forces a message through the channel.
    /// Panics if the receiving end has been dropped.
    pub fn send(&self, message: T) {
        self.0
            .unbounded_send(message)
            .expect("[INTERNAL ERROR]: receiver dropped");
    }

    /// Attempts to send a message through the channel.
    /// Does nothing if the receiving end has been dropped.
    pub fn try_send(&self, message: T) {
        self.0.unbounded_send(message).ok();
    }
}

impl<T> Stream for Rx<T> {
    type Item = T;
    type Error = ();

    #[inline]
    fn poll(&mut self) -> Result<Async<Option<Self::Item>>, Self::Error> {
        self.0.poll()
    }
}
