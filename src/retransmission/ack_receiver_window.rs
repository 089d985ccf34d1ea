use crate::message::{Message, Seqno};
use std::collections::BTreeMap;

/// Receiver side of ack-based delivery: buffers out-of-order messages and
/// hands them out strictly in seqno order.
#[derive(Debug)]
pub struct AckReceiverWindow {
    next_to_remove: Seqno,
    msgs: BTreeMap<Seqno, Message>,
}

impl AckReceiverWindow {
    pub fn new(initial_seqno: Seqno) -> Self {
        Self {
            next_to_remove: initial_seqno,
            msgs: BTreeMap::new(),
        }
    }

    /// Buffers `msg`. Returns false for duplicates, including anything below
    /// the next expected seqno.
    pub fn add(&mut self, seqno: Seqno, msg: Message) -> bool {
        if seqno < self.next_to_remove || self.msgs.contains_key(&seqno) {
            tracing::trace!(
                "Discarding duplicate #{} (next expected #{})",
                seqno,
                self.next_to_remove
            );
            return false;
        }
        self.msgs.insert(seqno, msg);
        true
    }

    /// Next in-order message, or `None` if it has not arrived yet.
    pub fn remove(&mut self) -> Option<Message> {
        let msg = self.msgs.remove(&self.next_to_remove)?;
        self.next_to_remove += 1;
        Some(msg)
    }

    pub fn next_to_remove(&self) -> Seqno {
        self.next_to_remove
    }

    pub fn size(&self) -> usize {
        self.msgs.len()
    }

    pub fn reset(&mut self) {
        self.msgs.clear();
    }
}
