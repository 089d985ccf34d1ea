use crate::message::{Address, Seqno};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-sender sequence number bookkeeping.
///
/// - `low`: lowest seqno still retained.
/// - `high`: highest seqno deliverable without gaps.
/// - `high_seen`: highest seqno received, possibly past a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub sender: Address,
    pub low: Seqno,
    pub high: Seqno,
    pub high_seen: Seqno,
}

/// What a member has (NAKACK) or what everyone has (STABLE), indexed by sender.
///
/// Published digests are treated as immutable: callers clone before changing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    entries: Vec<DigestEntry>,
}

impl Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(size),
        }
    }

    /// Adds (or overwrites) `sender` with `high_seen == high`.
    pub fn add(&mut self, sender: Address, low: Seqno, high: Seqno) {
        self.add_entry(DigestEntry {
            sender,
            low,
            high,
            high_seen: high,
        });
    }

    pub fn add_entry(&mut self, entry: DigestEntry) {
        match self.index_of(&entry.sender) {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn index_of(&self, sender: &Address) -> Option<usize> {
        self.entries.iter().position(|e| &e.sender == sender)
    }

    pub fn get(&self, sender: &Address) -> Option<&DigestEntry> {
        self.entries.iter().find(|e| &e.sender == sender)
    }

    pub fn entry_at(&self, index: usize) -> Option<&DigestEntry> {
        self.entries.get(index)
    }

    pub fn contains(&self, sender: &Address) -> bool {
        self.index_of(sender).is_some()
    }

    pub fn set_high_seen(&mut self, sender: &Address, high_seen: Seqno) {
        if let Some(index) = self.index_of(sender) {
            self.entries[index].high_seen = high_seen;
        }
    }

    pub fn remove(&mut self, sender: &Address) {
        self.entries.retain(|e| &e.sender != sender);
    }

    /// Merges `other` into `self`: unknown senders are added, known ones keep
    /// the lowest `low` and the highest `high`/`high_seen`.
    pub fn merge(&mut self, other: &Digest) {
        for entry in other.iter() {
            match self.index_of(&entry.sender) {
                Some(index) => {
                    let mine = &mut self.entries[index];
                    mine.low = mine.low.min(entry.low);
                    mine.high = mine.high.max(entry.high);
                    mine.high_seen = mine.high_seen.max(entry.high_seen);
                }
                None => self.entries.push(*entry),
            }
        }
    }

    pub fn senders(&self) -> Vec<Address> {
        self.entries.iter().map(|e| e.sender).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DigestEntry> {
        self.entries.iter()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}: [{} : {} ({})]", e.sender, e.low, e.high, e.high_seen))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
