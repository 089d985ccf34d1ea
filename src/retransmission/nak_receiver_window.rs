//! Receiver side of NAK-based multicast for a single sender.
//!
//! The window covers `[head, tail)`: `head` is the next seqno to deliver,
//! `tail` the next seqno expected off the wire. Any seqno in that range
//! without a message is a gap; gaps are never materialized, so a far-ahead
//! seqno costs nothing until it is filled. Each gap is handed to the
//! retransmitter when it is discovered and removed from it when the missing
//! message arrives. Delivered messages are kept until `stable()` says
//! everybody has them.

use super::retransmitter::Retransmitter;
use crate::message::{Address, Message, Seqno};
use std::collections::BTreeMap;

pub struct NakReceiverWindow {
    sender: Address,
    head: Seqno,
    tail: Seqno,
    msgs: BTreeMap<Seqno, Message>,
    delivered: BTreeMap<Seqno, Message>,
    retransmitter: Option<Retransmitter>,
}

impl NakReceiverWindow {
    /// `start_seqno` is the first seqno this window will deliver.
    pub fn new(sender: Address, start_seqno: Seqno, retransmitter: Option<Retransmitter>) -> Self {
        Self {
            sender,
            head: start_seqno,
            tail: start_seqno,
            msgs: BTreeMap::new(),
            delivered: BTreeMap::new(),
            retransmitter,
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Inserts `msg` at `seqno`. Returns false if it was a duplicate or already delivered.
    pub fn add(&mut self, seqno: Seqno, msg: Message) -> bool {
        if seqno < self.head {
            tracing::trace!(
                "Discarding #{} from {}: already delivered (head={})",
                seqno,
                self.sender,
                self.head
            );
            return false;
        }

        if seqno < self.tail {
            let filled = !self.msgs.contains_key(&seqno);
            if filled {
                self.msgs.insert(seqno, msg);
            }

            if filled {
                if let Some(retransmitter) = &self.retransmitter {
                    retransmitter.remove(seqno);
                }
            } else {
                tracing::trace!("Discarding duplicate #{} from {}", seqno, self.sender);
            }
            return filled;
        }

        if seqno > self.tail {
            tracing::debug!(
                "Gap from {}: missing [{} - {}]",
                self.sender,
                self.tail,
                seqno - 1
            );
            if let Some(retransmitter) = &self.retransmitter {
                retransmitter.add(self.tail, seqno - 1);
            }
        }

        self.msgs.insert(seqno, msg);
        self.tail = seqno + 1;
        true
    }

    /// Pops the head if it is present. `None` when the window is drained or the
    /// head is still missing.
    pub fn remove(&mut self) -> Option<Message> {
        let msg = self.msgs.remove(&self.head)?;
        self.delivered.insert(self.head, msg.clone());
        self.head += 1;
        Some(msg)
    }

    /// Discards delivered messages with seqno <= `seqno`.
    pub fn stable(&mut self, seqno: Seqno) {
        self.delivered = self.delivered.split_off(&(seqno + 1));
    }

    /// Lowest seqno still held (delivered or not).
    pub fn lowest_seen(&self) -> Seqno {
        self.delivered
            .keys()
            .next()
            .copied()
            .unwrap_or(self.head)
    }

    pub fn highest_delivered(&self) -> Seqno {
        self.head - 1
    }

    /// Highest seqno such that everything from `head` up to it is present.
    pub fn highest_deliverable(&self) -> Seqno {
        let mut highest = self.head - 1;
        for seqno in self.msgs.range(self.head..).map(|(seqno, _)| seqno) {
            if *seqno != highest + 1 {
                break;
            }
            highest = *seqno;
        }
        highest
    }

    /// Highest seqno received, gaps or not.
    pub fn highest_received(&self) -> Seqno {
        self.tail - 1
    }

    /// Gaps in `[head, tail)` as inclusive ranges.
    pub fn missing(&self) -> Vec<(Seqno, Seqno)> {
        let mut gaps = Vec::new();
        let mut next = self.head;
        for seqno in self.msgs.keys() {
            if *seqno > next {
                gaps.push((next, seqno - 1));
            }
            next = seqno + 1;
        }
        if next < self.tail {
            gaps.push((next, self.tail - 1));
        }
        gaps
    }

    /// Number of undelivered seqnos, gaps included.
    pub fn size(&self) -> usize {
        (self.tail - self.head).max(0) as usize
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Drops all state and cancels pending retransmissions.
    pub fn reset(&mut self) {
        self.msgs.clear();
        self.delivered.clear();
        if let Some(retransmitter) = &self.retransmitter {
            retransmitter.reset();
        }
    }
}
