//! # Summary
//!
//! This module defines the reorder buffer that turns possibly-out-of-order,
//! possibly-gapped commit notifications into the gap-free delivery stream.
//!
//! Entries are keyed by instance number; an entry is releasable exactly
//! when its instance is the successor of the last released one. No-op
//! values are consumed without an application sequence number, so the
//! delivered stream shows no gap where a no-op was committed.

use std::collections::BTreeMap;

use crate::message::Value;

pub struct Buffer {
    pending: BTreeMap<usize, Value>,
    delivered: usize,
    sequence: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            pending: BTreeMap::new(),
            delivered: 0,
            sequence: 0,
        }
    }

    /// Records a learned instance. Instances at or below the delivery
    /// watermark are duplicates and are dropped.
    pub fn insert(&mut self, instance: usize, value: Value) {
        if instance <= self.delivered {
            trace!("instance {} already delivered", instance);
            return;
        }
        self.pending.insert(instance, value);
    }

    /// Releases the next deliverable payload, if any, stamped with a fresh
    /// application sequence number. Call repeatedly until `None`: each call
    /// consumes releasable no-ops silently.
    pub fn pop(&mut self) -> Option<(usize, Vec<u8>)> {
        loop {
            let next = self.delivered + 1;
            let value = self.pending.remove(&next)?;
            self.delivered = next;
            match value {
                Value::Noop => continue,
                Value::Payload(bytes) => {
                    self.sequence += 1;
                    return Some((self.sequence, bytes));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn payload(bytes: &[u8]) -> Value {
        Value::Payload(bytes.to_vec())
    }

    fn drain(buffer: &mut Buffer) -> Vec<(usize, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(item) = buffer.pop() {
            out.push(item);
        }
        out
    }

    #[test]
    fn releases_in_instance_order() {
        let mut buffer = Buffer::new();
        buffer.insert(2, payload(b"b"));
        buffer.insert(1, payload(b"a"));
        assert_eq!(
            drain(&mut buffer),
            vec![(1, b"a".to_vec()), (2, b"b".to_vec())],
        );
    }

    #[test]
    fn holds_entries_past_a_gap() {
        let mut buffer = Buffer::new();
        buffer.insert(1, payload(b"a"));
        buffer.insert(3, payload(b"c"));
        assert_eq!(drain(&mut buffer), vec![(1, b"a".to_vec())]);

        buffer.insert(2, payload(b"b"));
        assert_eq!(
            drain(&mut buffer),
            vec![(2, b"b".to_vec()), (3, b"c".to_vec())],
        );
    }

    #[test]
    fn noops_consume_no_sequence_number() {
        let mut buffer = Buffer::new();
        buffer.insert(1, Value::Noop);
        buffer.insert(2, Value::Noop);
        buffer.insert(3, payload(b"real"));
        buffer.insert(4, payload(b"next"));
        assert_eq!(
            drain(&mut buffer),
            vec![(1, b"real".to_vec()), (2, b"next".to_vec())],
        );
    }

    #[test]
    fn ignores_delivered_duplicates() {
        let mut buffer = Buffer::new();
        buffer.insert(1, payload(b"a"));
        assert_eq!(drain(&mut buffer), vec![(1, b"a".to_vec())]);

        buffer.insert(1, payload(b"a"));
        assert_eq!(drain(&mut buffer), vec![]);
    }

    #[test]
    fn empty_payloads_are_not_noops() {
        let mut buffer = Buffer::new();
        buffer.insert(1, payload(b""));
        assert_eq!(drain(&mut buffer), vec![(1, Vec::new())]);
    }
}
