use crate::message::{Address, Seqno};
use crate::scheduler::{TimeScheduler, TimedTask};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Invoked for every contiguous run of seqnos still missing when an entry times out.
pub trait RetransmitCommand: Send + Sync {
    fn retransmit(&self, first: Seqno, last: Seqno, sender: Address);
}

/// One scheduled range. Seqnos leave it as they are received or acked, which
/// may split it into several disjoint runs; the entry cancels itself once
/// nothing is left.
struct Entry {
    sender: Address,
    /// Sorted, disjoint, inclusive runs.
    missing: Mutex<Vec<(Seqno, Seqno)>>,
    intervals: Arc<[Duration]>,
    next: AtomicUsize,
    cancelled: AtomicBool,
    command: Arc<dyn RetransmitCommand>,
}

impl Entry {
    fn contains(&self, seqno: Seqno) -> bool {
        self.missing
            .lock()
            .unwrap()
            .iter()
            .any(|(first, last)| (*first..=*last).contains(&seqno))
    }

    /// Takes `seqno` out of its run. Returns true once no run is left.
    fn remove(&self, seqno: Seqno) -> bool {
        let mut missing = self.missing.lock().unwrap();
        if let Some(index) = missing
            .iter()
            .position(|(first, last)| (*first..=*last).contains(&seqno))
        {
            let (first, last) = missing[index];
            let mut pieces = Vec::with_capacity(2);
            if first < seqno {
                pieces.push((first, seqno - 1));
            }
            if seqno < last {
                pieces.push((seqno + 1, last));
            }
            missing.splice(index..=index, pieces);
        }
        missing.is_empty()
    }

    fn len(&self) -> usize {
        self.missing
            .lock()
            .unwrap()
            .iter()
            .map(|(first, last)| (last - first + 1) as usize)
            .sum()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn runs(&self) -> Vec<(Seqno, Seqno)> {
        self.missing.lock().unwrap().clone()
    }
}

impl TimedTask for Entry {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_interval(&self) -> Duration {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        self.intervals[index.min(self.intervals.len() - 1)]
    }

    fn run(&self) {
        for (first, last) in self.runs() {
            tracing::trace!("Retransmitting [{} - {}] from {}", first, last, self.sender);
            self.command.retransmit(first, last, self.sender);
        }
    }
}

/// Keeps asking `sender` for missing seqnos until they show up.
///
/// Every `add(first, last)` creates an entry on the shared scheduler. The
/// entry fires after `intervals[0]`, then `intervals[1]`, ... repeating the
/// last interval forever.
pub struct Retransmitter {
    sender: Address,
    command: Arc<dyn RetransmitCommand>,
    scheduler: Arc<TimeScheduler>,
    intervals: Arc<[Duration]>,
    entries: Mutex<Vec<Arc<Entry>>>,
}

impl Retransmitter {
    pub fn new(
        sender: Address,
        command: Arc<dyn RetransmitCommand>,
        scheduler: Arc<TimeScheduler>,
        intervals: Vec<Duration>,
    ) -> Self {
        let intervals: Arc<[Duration]> = if intervals.is_empty() {
            Arc::from(vec![Duration::from_millis(1000)])
        } else {
            Arc::from(intervals)
        };

        Self {
            sender,
            command,
            scheduler,
            intervals,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Starts tracking `[first, last]` (inclusive).
    pub fn add(&self, first: Seqno, last: Seqno) {
        if first > last {
            tracing::warn!("Ignoring empty retransmission range [{} - {}]", first, last);
            return;
        }

        let entry = Arc::new(Entry {
            sender: self.sender,
            missing: Mutex::new(vec![(first, last)]),
            intervals: self.intervals.clone(),
            next: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            command: self.command.clone(),
        });

        self.entries.lock().unwrap().push(entry.clone());
        self.scheduler.add(entry);
    }

    /// Marks `seqno` as received/acked. Returns false if it was not tracked.
    pub fn remove(&self, seqno: Seqno) -> bool {
        let mut entries = self.entries.lock().unwrap();

        let Some(index) = entries.iter().position(|entry| entry.contains(seqno)) else {
            return false;
        };

        if entries[index].remove(seqno) {
            entries[index].cancel();
            entries.remove(index);
        }

        true
    }

    /// Cancels every entry.
    pub fn reset(&self) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            entry.cancel();
        }
        entries.clear();
    }

    /// Total number of seqnos still awaiting retransmission.
    pub fn size(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.len())
            .sum()
    }
}

impl Drop for Retransmitter {
    fn drop(&mut self) {
        self.reset();
    }
}
