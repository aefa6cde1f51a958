//! # Summary
//!
//! This module defines the quorum waiter: the same request has been fanned
//! out to every member of a shard, and the waiter collects their votes
//! until the outcome is decided. It succeeds as soon as a majority of
//! distinct members vote yes, and fails as soon as a majority has become
//! impossible or the deadline passes, so unreachable members never block
//! the verdict. The votes collected up to the decision point are returned
//! with it for safety-rule post-processing.

use std::collections::HashSet as Set;
use std::mem;
use std::time;

use tokio::prelude::*;
use tokio::timer;

use crate::internal;
use crate::message::ServerId;
use crate::shared;

/// Votes required among `count` members.
pub fn majority(count: usize) -> usize {
    count / 2 + 1
}

pub struct Quorum<V> {
    rx: internal::Rx<(ServerId, V)>,
    pred: fn(&V) -> bool,
    count: usize,
    yes: usize,
    no: usize,
    voted: Set<ServerId>,
    votes: Vec<(ServerId, V)>,
    deadline: timer::Delay,
    _guard: Option<shared::Guard>,
}

impl<V> Quorum<V> {
    pub fn new(
        rx: internal::Rx<(ServerId, V)>,
        pred: fn(&V) -> bool,
        count: usize,
        timeout: time::Duration,
    ) -> Self {
        Quorum {
            rx,
            pred,
            count,
            yes: 0,
            no: 0,
            voted: Set::default(),
            votes: Vec::with_capacity(count),
            deadline: timer::Delay::new(time::Instant::now() + timeout),
            _guard: None,
        }
    }

    /// Attaches the hub registration that routes votes to this waiter, so
    /// the route is closed when the waiter is dropped.
    pub fn with_guard(mut self, guard: shared::Guard) -> Self {
        self._guard = Some(guard);
        self
    }

    fn verdict(&self) -> Option<bool> {
        if self.yes >= majority(self.count) {
            Some(true)
        } else if self.no > self.count - majority(self.count) {
            Some(false)
        } else {
            None
        }
    }

    fn take(&mut self) -> Vec<(ServerId, V)> {
        mem::replace(&mut self.votes, Vec::with_capacity(0))
    }
}

impl<V> Future for Quorum<V> {
    type Item = (bool, Vec<(ServerId, V)>);
    type Error = ();

    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            match self.rx.poll()? {
            | Async::Ready(Some((server, vote))) => {
                if !self.voted.insert(server) {
                    trace!("duplicate vote from {}", server);
                    continue;
                }
                if (self.pred)(&vote) {
                    self.yes += 1;
                } else {
                    self.no += 1;
                }
                self.votes.push((server, vote));
                if let Some(ok) = self.verdict() {
                    let votes = self.take();
                    return Ok(Async::Ready((ok, votes)));
                }
            }
            | Async::Ready(None) => {
                let votes = self.take();
                return Ok(Async::Ready((false, votes)));
            }
            | Async::NotReady => break,
            }
        }

        match self.deadline.poll().map_err(|_| ())? {
        | Async::Ready(()) => {
            debug!("deadline passed with {}/{} votes", self.voted.len(), self.count);
            let votes = self.take();
            Ok(Async::Ready((false, votes)))
        }
        | Async::NotReady => Ok(Async::NotReady),
        }
    }
}
