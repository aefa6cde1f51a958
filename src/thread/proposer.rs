//! # Summary
//!
//! This module defines the `Proposer` struct, the driver of consensus for
//! one shard. It dequeues pending proposals and runs one instance at a
//! time to completion: check leadership, claim a fresh round from a
//! majority of acceptors, drive a value through the accept phase, then
//! hand the decision to the local learner. A prepare quorum may reveal a
//! higher-round value already accepted for the instance; the proposer must
//! then adopt that value, and the displaced original goes back on the
//! queue for a later instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use futures::sync::mpsc;
use futures::sync::oneshot;
use tokio::prelude::*;
use tokio::timer;

use crate::internal;
use crate::message::{self, Round, ServerId, Value};
use crate::oracle::Oracle;
use crate::shared::Shared;
use crate::thread::learner;
use crate::thread::peer;
use crate::thread::quorum::Quorum;

/// A submission waiting for an instance.
pub struct Pending {
    pub value: Value,
    pub slot: Slot,
}

/// Where to answer a submission once its fate is known.
pub enum Slot {
    Local(oneshot::Sender<bool>),
    Remote { from: ServerId, id: usize },
}

pub struct Proposer {
    /// Unique ID of this server
    id: ServerId,

    /// All members of this server's shard, in configuration order
    members: Vec<ServerId>,

    /// Bounded queue of client submissions
    rx: mpsc::Receiver<Pending>,

    /// Submissions displaced by an adopted value, drained first
    requeued: VecDeque<Pending>,

    /// This shard's leader oracle
    oracle: Oracle,

    /// Intra-server shared transmitting channels
    shared: Shared,

    /// Local learner, where decided instances are committed
    learner_tx: internal::Tx<learner::In>,

    /// Highest instance the local learner has recorded
    last: Arc<AtomicUsize>,

    /// Last round this proposer used; never reused or rewound
    round: Round,

    /// Deadline for each quorum phase
    timeout: time::Duration,

    /// Base delay before retrying an abandoned round
    backoff: time::Duration,

    /// The instance currently being driven
    instance: Option<Instance>,
}

struct Instance {
    no: usize,
    value: Value,
    orig: Value,
    slot: Option<Slot>,
    phase: Phase,
}

enum Phase {
    Leader,
    Preparing(Quorum<message::Promise>),
    Accepting(Quorum<message::Accepted>),
    Backoff(timer::Delay),
}

impl Proposer {
    pub fn new(
        id: ServerId,
        members: Vec<ServerId>,
        rx: mpsc::Receiver<Pending>,
        oracle: Oracle,
        shared: Shared,
        learner_tx: internal::Tx<learner::In>,
        last: Arc<AtomicUsize>,
        timeout: time::Duration,
        backoff: time::Duration,
    ) -> Self {
        Proposer {
            id,
            members,
            rx,
            requeued: VecDeque::new(),
            oracle,
            shared,
            learner_tx,
            last,
            round: Round { number: 0, proposer: id },
            timeout,
            backoff,
            instance: None,
        }
    }

    /// Opens an instance for the next pending submission, one past the
    /// highest instance the local learner knows.
    fn start(&mut self, pending: Pending) {
        let no = self.last.load(Ordering::SeqCst) + 1;
        debug!("driving instance {} for {:?}", no, pending.value);
        self.instance = Some(Instance {
            no,
            value: pending.value.clone(),
            orig: pending.value,
            slot: Some(pending.slot),
            phase: Phase::Leader,
        });
    }

    fn reply(&self, slot: Slot, ack: bool) {
        match slot {
        | Slot::Local(tx) => {
            // The submitter may have given up and gone away.
            tx.send(ack).ok();
        }
        | Slot::Remote { from, id } => {
            self.shared.read().send(from, peer::In::ProposeReply { id, ack });
        }
        }
    }

    /// Claims a fresh round: registers a vote route and broadcasts the
    /// prepare to every shard member, including this one.
    fn prepare(&mut self, instance: &Instance) -> Quorum<message::Promise> {
        self.round = self.round.next(self.id);
        let round = self.round;
        debug!("instance {}: prepare {:?}", instance.no, round);

        let (rx, guard) = self.shared.register_promise(round);
        let pred: fn(&message::Promise) -> bool = |promise| promise.ack;
        let quorum = Quorum::new(rx, pred, self.members.len(), self.timeout).with_guard(guard);

        self.shared.read().narrowcast(&self.members, peer::In::Prepare {
            from: self.id,
            prepare: message::Prepare {
                instance: instance.no,
                round,
                value: instance.value.clone(),
            },
        });
        quorum
    }

    /// Broadcasts the accept for the instance's current value under the
    /// round claimed by the preceding prepare.
    fn accept(&mut self, instance: &Instance) -> Quorum<message::Accepted> {
        let round = self.round;
        debug!("instance {}: accept {:?} at {:?}", instance.no, instance.value, round);

        let (rx, guard) = self.shared.register_accepted(round);
        let pred: fn(&message::Accepted) -> bool = |accepted| accepted.ack;
        let quorum = Quorum::new(rx, pred, self.members.len(), self.timeout).with_guard(guard);

        self.shared.read().narrowcast(&self.members, peer::In::Accept {
            from: self.id,
            accept: message::Accept {
                instance: instance.no,
                round,
                value: instance.value.clone(),
            },
        });
        quorum
    }

    /// Adopts the highest-round value any promise reports as already
    /// accepted. If that displaces the submitter's original value, the
    /// original goes back on the queue to claim a later instance, taking
    /// its reply slot with it.
    fn adopt(&mut self, instance: &mut Instance, votes: Vec<(ServerId, message::Promise)>) {
        if let Some((round, value)) = highest_accepted(votes) {
            debug!("instance {}: adopting {:?} from {:?}", instance.no, value, round);
            instance.value = value;
            if instance.value != instance.orig {
                if let Some(slot) = instance.slot.take() {
                    self.requeued.push_back(Pending {
                        value: instance.orig.clone(),
                        slot,
                    });
                }
            }
        }
    }

    /// Hands the decided value to the local learner, which replicates it
    /// to shard peers, and acknowledges the submitter if its own value is
    /// the one that was decided.
    fn commit(&mut self, instance: &mut Instance) {
        info!("instance {} decided {:?}", instance.no, instance.value);
        self.learner_tx.send(learner::In::Local {
            instance: instance.no,
            value: instance.value.clone(),
        });
        if instance.value == instance.orig {
            if let Some(slot) = instance.slot.take() {
                self.reply(slot, true);
            }
        }
    }

    /// Skips the round counter past any higher round revealed by a NACK,
    /// so the next attempt is not doomed to lose the same race.
    fn fast_forward(&mut self, votes: &[(ServerId, message::Promise)]) {
        for (_, promise) in votes {
            if let Some(higher) = promise.higher {
                if higher.number > self.round.number {
                    self.round = Round {
                        number: higher.number,
                        proposer: self.id,
                    };
                }
            }
        }
    }

    fn pause(&self) -> timer::Delay {
        let jitter = 1.0 + rand::random::<f64>() / 2.0;
        timer::Delay::new(time::Instant::now() + self.backoff.mul_f64(jitter))
    }

    /// Drives the running instance until it terminates or suspends.
    fn step(&mut self, instance: &mut Instance) -> Result<Async<()>, ()> {
        loop {
            match instance.phase {
            | Phase::Leader => {
                if self.oracle.leader() != self.id {
                    // A displaced instance has already requeued its
                    // original; there is no one left to answer.
                    if instance.value == instance.orig {
                        if let Some(slot) = instance.slot.take() {
                            self.reply(slot, false);
                        }
                    }
                    return Ok(Async::Ready(()));
                }
                let quorum = self.prepare(instance);
                instance.phase = Phase::Preparing(quorum);
            }
            | Phase::Preparing(ref mut quorum) => match quorum.poll()? {
                Async::NotReady => return Ok(Async::NotReady),
                Async::Ready((false, votes)) => {
                    debug!("instance {}: prepare round abandoned", instance.no);
                    self.fast_forward(&votes);
                    instance.phase = Phase::Backoff(self.pause());
                }
                Async::Ready((true, votes)) => {
                    self.adopt(instance, votes);
                    let quorum = self.accept(instance);
                    instance.phase = Phase::Accepting(quorum);
                }
            },
            | Phase::Accepting(ref mut quorum) => match quorum.poll()? {
                Async::NotReady => return Ok(Async::NotReady),
                Async::Ready((false, _)) => {
                    debug!("instance {}: accept round abandoned", instance.no);
                    instance.phase = Phase::Backoff(self.pause());
                }
                Async::Ready((true, _)) => {
                    self.commit(instance);
                    return Ok(Async::Ready(()));
                }
            },
            | Phase::Backoff(ref mut delay) => match delay.poll().map_err(|_| ())? {
                Async::NotReady => return Ok(Async::NotReady),
                Async::Ready(()) => instance.phase = Phase::Leader,
            },
            }
        }
    }
}

impl Future for Proposer {
    type Item = ();
    type Error = ();
    fn poll(&mut self) -> Result<Async<Self::Item>, Self::Error> {
        loop {
            let mut instance = match self.instance.take() {
            | Some(instance) => instance,
            | None => {
                if let Some(pending) = self.requeued.pop_front() {
                    self.start(pending);
                    continue;
                }
                match self.rx.poll()? {
                    Async::Ready(Some(pending)) => {
                        self.start(pending);
                        continue;
                    }
                    Async::Ready(None) => return Ok(Async::Ready(())),
                    Async::NotReady => return Ok(Async::NotReady),
                }
            }
            };
            match self.step(&mut instance)? {
            | Async::Ready(()) => continue,
            | Async::NotReady => {
                self.instance = Some(instance);
                return Ok(Async::NotReady);
            }
            }
        }
    }
}

/// The value accepted at the highest round among the collected promises,
/// if any promise carried one. Classic single-decree safety rule.
fn highest_accepted(votes: Vec<(ServerId, message::Promise)>) -> Option<(Round, Value)> {
    votes
        .into_iter()
        .filter(|(_, promise)| promise.ack)
        .filter_map(|(_, promise)| promise.accepted)
        .max_by_key(|(round, _)| *round)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future;
    use pretty_assertions::assert_eq;
    use tokio::runtime::Runtime;
    use tokio::timer::Timeout;

    use crate::broadcast::Deliver;
    use crate::thread::acceptor::Acceptor;
    use crate::thread::learner::Learner;

    use super::*;

    fn payload(bytes: &[u8]) -> Value {
        Value::Payload(bytes.to_vec())
    }

    fn round(number: usize, proposer: ServerId) -> Round {
        Round { number, proposer }
    }

    fn promise(acceptor: ServerId, accepted: Option<(Round, Value)>) -> message::Promise {
        message::Promise {
            acceptor,
            instance: 1,
            round: round(1, 0),
            ack: true,
            accepted,
            higher: None,
        }
    }

    #[test]
    fn highest_accepted_prefers_later_rounds() {
        let votes = vec![
            (0, promise(0, Some((round(2, 1), payload(b"low"))))),
            (1, promise(1, Some((round(4, 2), payload(b"high"))))),
            (2, promise(2, None)),
        ];
        assert_eq!(
            highest_accepted(votes),
            Some((round(4, 2), payload(b"high"))),
        );
    }

    #[test]
    fn highest_accepted_ignores_nacks() {
        let mut nack = promise(0, Some((round(9, 1), payload(b"stale"))));
        nack.ack = false;
        assert_eq!(highest_accepted(vec![(0, nack)]), None);
    }

    /// One fully wired server: every role thread spawned, peers linked by
    /// in-process pumps instead of sockets.
    struct Node {
        shared: Shared,
        oracle: Oracle,
        proposer_tx: mpsc::Sender<Pending>,
        delivery: Option<mpsc::Receiver<(usize, Vec<u8>)>>,
    }

    fn cluster(count: usize, runtime: &mut Runtime) -> Vec<Node> {
        let members: Vec<ServerId> = (0..count).collect();
        let mut nodes = Vec::new();

        for &id in &members {
            let (acceptor_tx, acceptor_rx) = internal::pair();
            let (learner_tx, learner_rx) = internal::pair();
            let (delivery_tx, delivery_rx) = internal::pair();
            let (proposer_tx, proposer_rx) = mpsc::channel(10);
            let (out_tx, out_rx) = mpsc::channel(100);

            let oracle = Oracle::new(0);
            let shared = Shared::new(id, acceptor_tx, learner_tx.clone(), proposer_tx.clone());
            let last = Arc::new(AtomicUsize::new(0));
            let peers = members.iter().cloned().filter(|peer| *peer != id).collect();

            runtime.spawn(Acceptor::new(id, acceptor_rx, shared.clone()));
            runtime.spawn(Learner::new(
                id,
                peers,
                learner_rx,
                shared.clone(),
                last.clone(),
                delivery_tx,
            ));
            runtime.spawn(Proposer::new(
                id,
                members.clone(),
                proposer_rx,
                oracle.clone(),
                shared.clone(),
                learner_tx,
                last,
                Duration::from_millis(500),
                Duration::from_millis(10),
            ));
            runtime.spawn(Deliver::new(delivery_rx, out_tx));

            nodes.push(Node {
                shared,
                oracle,
                proposer_tx,
                delivery: Some(out_rx),
            });
        }

        for a in 0..count {
            for b in 0..count {
                if a == b {
                    continue;
                }
                let (tx, rx) = internal::pair();
                nodes[a].shared.write().connect_peer(b, tx);
                let target = nodes[b].shared.clone();
                runtime.spawn(rx.for_each(move |message| {
                    target.deliver(message);
                    Ok(())
                }));
            }
        }

        nodes
    }

    fn submit(
        runtime: &mut Runtime,
        node: &Node,
        value: Value,
    ) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let pending = Pending { value, slot: Slot::Local(ack_tx) };
        let submit = node
            .proposer_tx
            .clone()
            .send(pending)
            .map_err(|_| ())
            .and_then(|_| ack_rx.map_err(|_| ()));
        runtime
            .block_on(Timeout::new(submit, Duration::from_secs(10)))
            .expect("submission timed out")
    }

    fn deliveries(
        runtime: &mut Runtime,
        node: &mut Node,
        count: usize,
    ) -> Vec<(usize, Vec<u8>)> {
        let rx = node.delivery.take().expect("delivery already taken");
        runtime
            .block_on(Timeout::new(
                rx.take(count as u64).collect(),
                Duration::from_secs(10),
            ))
            .expect("delivery timed out")
    }

    #[test]
    fn leader_commits_and_every_replica_delivers() {
        let mut runtime = Runtime::new().unwrap();
        let mut nodes = cluster(3, &mut runtime);

        assert!(submit(&mut runtime, &nodes[0], payload(b"x")));
        for node in &mut nodes {
            assert_eq!(
                deliveries(&mut runtime, node, 1),
                vec![(1, b"x".to_vec())],
            );
        }
        runtime.shutdown_now().wait().ok();
    }

    #[test]
    fn adopts_accepted_value_and_requeues_original() {
        let mut runtime = Runtime::new().unwrap();
        let mut nodes = cluster(3, &mut runtime);

        // A competing proposer already got "y" accepted at a higher round
        // for instance 1; its replies go to an unknown server and vanish.
        for node in &nodes {
            node.shared.deliver(peer::In::Accept {
                from: 7,
                accept: message::Accept {
                    instance: 1,
                    round: round(5, 7),
                    value: payload(b"y"),
                },
            });
        }

        assert!(submit(&mut runtime, &nodes[0], payload(b"x")));
        for node in &mut nodes {
            assert_eq!(
                deliveries(&mut runtime, node, 2),
                vec![(1, b"y".to_vec()), (2, b"x".to_vec())],
            );
        }
        runtime.shutdown_now().wait().ok();
    }

    #[test]
    fn nacks_submissions_when_not_leader() {
        let mut runtime = Runtime::new().unwrap();
        let nodes = cluster(3, &mut runtime);

        nodes[0].oracle.set(1);
        assert!(!submit(&mut runtime, &nodes[0], payload(b"x")));
        runtime.shutdown_now().wait().ok();
    }

    #[test]
    fn successive_submissions_deliver_in_order() {
        let mut runtime = Runtime::new().unwrap();
        let mut nodes = cluster(3, &mut runtime);

        for value in [&b"a"[..], b"b", b"c"].iter() {
            assert!(submit(&mut runtime, &nodes[0], payload(value)));
        }
        for node in &mut nodes {
            assert_eq!(
                deliveries(&mut runtime, node, 3),
                vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())],
            );
        }
        runtime.shutdown_now().wait().ok();
    }

    #[test]
    fn minority_cannot_commit() {
        let mut runtime = Runtime::new().unwrap();
        let nodes = cluster(3, &mut runtime);

        // Cut server 0 off from both peers: its prepares reach only its
        // own acceptor, so no quorum phase can succeed.
        nodes[0].shared.write().disconnect_peer(1);
        nodes[0].shared.write().disconnect_peer(2);

        let (ack_tx, ack_rx) = oneshot::channel();
        let pending = Pending {
            value: payload(b"x"),
            slot: Slot::Local(ack_tx),
        };
        runtime
            .block_on(nodes[0].proposer_tx.clone().send(pending))
            .unwrap();

        // The submission must still be unanswered after several rounds of
        // prepare deadlines have passed.
        match runtime.block_on(Timeout::new(ack_rx, Duration::from_secs(2))) {
            Err(err) if err.is_elapsed() => (),
            result => panic!("expected no decision, got {:?}", result),
        }
        runtime.shutdown_now().wait().ok();
    }
}
