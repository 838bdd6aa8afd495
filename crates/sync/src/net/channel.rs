//! Delivery guarantees layered over datagrams.
//!
//! Reliable messages carry a per-direction sequence starting at 1 and are
//! resent until the peer acknowledges the highest contiguous sequence it has
//! delivered. Best-effort transform patches carry a per-entity sequence and
//! the receiver keeps only the newest per field.

use std::collections::{HashMap, VecDeque};

use crate::entity::ChangeMask;
use crate::types::EntityId;

use super::protocol::sequence_greater_than;

/// Furthest ahead of the next expected sequence a message may be buffered.
const MAX_REORDER_WINDOW: u32 = 4096;

#[derive(Debug)]
struct PendingReliable<T> {
    seq: u32,
    message: T,
    last_sent_ms: Option<u64>,
}

#[derive(Debug)]
pub struct ReliableSender<T> {
    next_seq: u32,
    pending: VecDeque<PendingReliable<T>>,
    resend_interval_ms: u64,
}

impl<T: Clone> ReliableSender<T> {
    pub fn new(resend_interval_ms: u64) -> Self {
        Self {
            next_seq: 1,
            pending: VecDeque::new(),
            resend_interval_ms,
        }
    }

    pub fn push(&mut self, message: T) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        self.pending.push_back(PendingReliable {
            seq,
            message,
            last_sent_ms: None,
        });
        seq
    }

    /// Drops everything up to and including `ack`.
    pub fn ack(&mut self, ack: u32) {
        while self
            .pending
            .front()
            .is_some_and(|p| p.seq == ack || sequence_greater_than(ack, p.seq))
        {
            self.pending.pop_front();
        }
    }

    /// Messages never sent, or unacked for longer than the resend interval.
    pub fn due(&mut self, now_ms: u64) -> Vec<(u32, T)> {
        let interval = self.resend_interval_ms;
        self.pending
            .iter_mut()
            .filter(|p| {
                p.last_sent_ms
                    .is_none_or(|sent| now_ms.saturating_sub(sent) >= interval)
            })
            .map(|p| {
                p.last_sent_ms = Some(now_ms);
                (p.seq, p.message.clone())
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug)]
pub struct OrderedReceiver<T> {
    next_expected: u32,
    buffered: HashMap<u32, T>,
}

impl<T> Default for OrderedReceiver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedReceiver<T> {
    pub fn new() -> Self {
        Self {
            next_expected: 1,
            buffered: HashMap::new(),
        }
    }

    /// Accepts one reliable message and returns whatever became deliverable,
    /// in sequence order. Duplicates and messages outside the window are
    /// dropped.
    pub fn receive(&mut self, seq: u32, message: T) -> Vec<T> {
        if seq != self.next_expected && !sequence_greater_than(seq, self.next_expected) {
            log::trace!("duplicate reliable message {}", seq);
            return Vec::new();
        }
        if seq.wrapping_sub(self.next_expected) >= MAX_REORDER_WINDOW {
            log::warn!("reliable message {} outside reorder window", seq);
            return Vec::new();
        }

        self.buffered.entry(seq).or_insert(message);

        let mut ready = Vec::new();
        while let Some(message) = self.buffered.remove(&self.next_expected) {
            ready.push(message);
            self.next_expected = self.next_expected.wrapping_add(1).max(1);
        }
        ready
    }

    /// Highest contiguous sequence delivered so far, 0 before the first.
    pub fn ack(&self) -> u32 {
        self.next_expected.wrapping_sub(1)
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Hands out per-entity sequence numbers for best-effort transform patches.
#[derive(Debug, Default)]
pub struct TransformSequencer {
    next: HashMap<EntityId, u32>,
}

impl TransformSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, entity: EntityId) -> u32 {
        let seq = self.next.entry(entity).or_insert(0);
        *seq = seq.wrapping_add(1);
        *seq
    }

    pub fn forget(&mut self, entity: EntityId) {
        self.next.remove(&entity);
    }
}

/// Last-writer-wins filter keyed by entity and field.
#[derive(Debug, Default)]
pub struct SequenceFilter {
    latest: HashMap<(EntityId, ChangeMask), u32>,
}

impl SequenceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fields of `fields` for which `seq` is newer than anything
    /// seen before, and records it for them.
    pub fn accept(&mut self, entity: EntityId, fields: ChangeMask, seq: u32) -> ChangeMask {
        let mut accepted = ChangeMask::empty();
        for field in fields.iter() {
            let newer = self
                .latest
                .get(&(entity, field))
                .is_none_or(|&last| sequence_greater_than(seq, last));
            if newer {
                self.latest.insert((entity, field), seq);
                accepted |= field;
            }
        }
        accepted
    }

    pub fn forget(&mut self, entity: EntityId) {
        self.latest.retain(|(id, _), _| *id != entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resends_until_acked() {
        let mut sender = ReliableSender::new(100);
        let a = sender.push("a");
        let b = sender.push("b");
        assert_eq!((a, b), (1, 2));

        assert_eq!(sender.due(0).len(), 2);
        assert!(sender.due(50).is_empty());
        assert_eq!(sender.due(100).len(), 2);

        sender.ack(1);
        assert_eq!(sender.in_flight(), 1);
        assert_eq!(sender.due(200), vec![(2, "b")]);

        sender.ack(2);
        assert_eq!(sender.in_flight(), 0);
    }

    #[test]
    fn stale_ack_is_harmless() {
        let mut sender = ReliableSender::new(100);
        sender.push(1);
        sender.push(2);
        sender.ack(2);
        sender.push(3);
        sender.ack(1);
        assert_eq!(sender.in_flight(), 1);
    }

    #[test]
    fn delivers_in_order_across_gaps() {
        let mut receiver = OrderedReceiver::new();
        assert!(receiver.receive(2, "b").is_empty());
        assert!(receiver.receive(3, "c").is_empty());
        assert_eq!(receiver.ack(), 0);

        assert_eq!(receiver.receive(1, "a"), vec!["a", "b", "c"]);
        assert_eq!(receiver.ack(), 3);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut receiver = OrderedReceiver::new();
        assert_eq!(receiver.receive(1, "a"), vec!["a"]);
        assert!(receiver.receive(1, "a").is_empty());

        assert!(receiver.receive(3, "c").is_empty());
        assert!(receiver.receive(3, "c").is_empty());
        assert_eq!(receiver.receive(2, "b"), vec!["b", "c"]);
    }

    #[test]
    fn filter_keeps_newest_per_field() {
        let mut filter = SequenceFilter::new();
        let id = EntityId::new();

        assert_eq!(
            filter.accept(id, ChangeMask::POSITION | ChangeMask::ROTATION, 5),
            ChangeMask::POSITION | ChangeMask::ROTATION
        );
        assert_eq!(filter.accept(id, ChangeMask::POSITION, 4), ChangeMask::empty());
        assert_eq!(filter.accept(id, ChangeMask::SCALE, 4), ChangeMask::SCALE);
        assert_eq!(filter.accept(id, ChangeMask::POSITION, 6), ChangeMask::POSITION);

        filter.forget(id);
        assert_eq!(filter.accept(id, ChangeMask::POSITION, 1), ChangeMask::POSITION);
    }

    #[test]
    fn sequencer_is_per_entity() {
        let mut sequencer = TransformSequencer::new();
        let a = EntityId::new();
        let b = EntityId::new();
        assert_eq!(sequencer.next(a), 1);
        assert_eq!(sequencer.next(a), 2);
        assert_eq!(sequencer.next(b), 1);
    }
}
