//! Sender side of ack-based point-to-point delivery.
//!
//! Every message handed to the window stays there until the peer acks it;
//! until then the retransmitter re-sends the original message with backoff.
//! With `window_size > 0` at most `window_size` messages are in flight;
//! the rest wait in a queue and are released once acks bring the in-flight
//! count below `min_threshold`.

use super::retransmitter::{RetransmitCommand, Retransmitter};
use crate::message::{Address, Message, Seqno};
use crate::scheduler::TimeScheduler;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Callback that puts a stored message back on the wire.
pub type ResendFn = Arc<dyn Fn(Seqno, Message) + Send + Sync>;

type SentMessages = Arc<Mutex<BTreeMap<Seqno, Message>>>;

struct Resender {
    msgs: SentMessages,
    resend: ResendFn,
}

impl RetransmitCommand for Resender {
    fn retransmit(&self, first: Seqno, last: Seqno, _sender: Address) {
        let pending: Vec<(Seqno, Message)> = self
            .msgs
            .lock()
            .unwrap()
            .range(first..=last)
            .map(|(seqno, msg)| (*seqno, msg.clone()))
            .collect();

        for (seqno, msg) in pending {
            (self.resend)(seqno, msg);
        }
    }
}

pub struct AckSenderWindow {
    msgs: SentMessages,
    queued: Mutex<VecDeque<(Seqno, Message)>>,
    retransmitter: Retransmitter,
    window_size: usize,
    min_threshold: usize,
}

impl AckSenderWindow {
    /// `window_size == 0` disables throttling. `min_threshold == 0` releases
    /// queued messages as soon as there is room in the window.
    pub fn new(
        peer: Address,
        resend: ResendFn,
        scheduler: Arc<TimeScheduler>,
        intervals: Vec<Duration>,
        window_size: usize,
        min_threshold: usize,
    ) -> Self {
        let msgs: SentMessages = Arc::new(Mutex::new(BTreeMap::new()));
        let command = Arc::new(Resender {
            msgs: msgs.clone(),
            resend,
        });

        Self {
            msgs,
            queued: Mutex::new(VecDeque::new()),
            retransmitter: Retransmitter::new(peer, command, scheduler, intervals),
            window_size,
            min_threshold: min_threshold.min(window_size),
        }
    }

    fn throttled(&self) -> bool {
        self.window_size > 0
    }

    /// Stores `msg`. Returns true if the caller should send it now, false if it
    /// was queued because the window is full.
    pub fn add(&self, seqno: Seqno, msg: Message) -> bool {
        {
            let mut queued = self.queued.lock().unwrap();
            let mut msgs = self.msgs.lock().unwrap();

            if self.throttled() && (!queued.is_empty() || msgs.len() >= self.window_size) {
                tracing::debug!(
                    "Window full ({} in flight), queueing message #{}",
                    msgs.len(),
                    seqno
                );
                queued.push_back((seqno, msg));
                return false;
            }

            msgs.insert(seqno, msg);
        }

        self.retransmitter.add(seqno, seqno);
        true
    }

    /// Removes `seqno` from the window. Returns the queued messages that may be
    /// sent now. Acking an unknown or already-acked seqno is a no-op.
    pub fn ack(&self, seqno: Seqno) -> Vec<(Seqno, Message)> {
        let removed = self.msgs.lock().unwrap().remove(&seqno).is_some();
        if !removed {
            return Vec::new();
        }
        self.retransmitter.remove(seqno);

        if !self.throttled() {
            return Vec::new();
        }

        let released = {
            let mut queued = self.queued.lock().unwrap();
            let mut msgs = self.msgs.lock().unwrap();

            let threshold = if self.min_threshold == 0 {
                self.window_size
            } else {
                self.min_threshold
            };

            let mut released = Vec::new();
            if msgs.len() < threshold {
                while msgs.len() < self.window_size {
                    let Some((queued_seqno, msg)) = queued.pop_front() else {
                        break;
                    };
                    msgs.insert(queued_seqno, msg.clone());
                    released.push((queued_seqno, msg));
                }
            }
            released
        };

        for (released_seqno, _) in released.iter() {
            self.retransmitter.add(*released_seqno, *released_seqno);
        }

        if !released.is_empty() {
            tracing::debug!("Released {} queued message(s)", released.len());
        }

        released
    }

    /// Number of messages sent but not yet acked.
    pub fn size(&self) -> usize {
        self.msgs.lock().unwrap().len()
    }

    /// Number of messages waiting for room in the window.
    pub fn queued_count(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    pub fn pending_retransmissions(&self) -> usize {
        self.retransmitter.size()
    }

    pub fn reset(&self) {
        self.queued.lock().unwrap().clear();
        self.msgs.lock().unwrap().clear();
        self.retransmitter.reset();
    }
}
