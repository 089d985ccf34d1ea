//! CAUSAL: causal ordering of multicasts with vector clocks.
//!
//! Every outgoing multicast carries a copy of the sender's vector clock after
//! incrementing its own entry. A receiver delivers a message only when it is
//! the next one from its sender and everything the sender had seen is already
//! delivered locally; otherwise it waits in a delay queue that is rechecked
//! after every delivery.
//!
//! Every installed view resizes the clock to the new membership and resets
//! all counts to zero, so members that installed the same view agree on the
//! starting point. Columns of departed members are kept at zero. Messages
//! still delayed under the old view are released in queue order when the new
//! view is installed.

use crate::membership::View;
use crate::message::{Address, Event, Header, Message};
use crate::stack::Protocol;
use crate::stack::protocol::Links;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const NAME: &str = "CAUSAL";

/// A vector clock owned by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorTimeStamp {
    owner: Address,
    values: BTreeMap<Address, u64>,
}

impl VectorTimeStamp {
    pub fn new(owner: Address) -> Self {
        let mut values = BTreeMap::new();
        values.insert(owner, 0);
        Self { owner, values }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    /// Counter for `mbr`; unknown members count as 0.
    pub fn get(&self, mbr: &Address) -> u64 {
        self.values.get(mbr).copied().unwrap_or(0)
    }

    pub fn set(&mut self, mbr: Address, value: u64) {
        self.values.insert(mbr, value);
    }

    /// Increments the owner's entry and returns the new value.
    pub fn increment(&mut self) -> u64 {
        let value = self.values.entry(self.owner).or_insert(0);
        *value += 1;
        *value
    }

    /// Adds members that are missing, starting at 0. Existing counts are kept.
    pub fn merge_members(&mut self, members: &[Address]) {
        for mbr in members {
            self.values.entry(*mbr).or_insert(0);
        }
    }

    /// Sets every entry, departed members included, back to zero.
    pub fn reset_counts(&mut self) {
        for value in self.values.values_mut() {
            *value = 0;
        }
    }

    /// Entry-wise maximum with `other`.
    pub fn max(&mut self, other: &VectorTimeStamp) {
        for (mbr, value) in &other.values {
            let current = self.values.entry(*mbr).or_insert(0);
            *current = (*current).max(*value);
        }
    }

    /// True if a message stamped with `stamp` can be delivered on top of this
    /// clock: it is the very next message from its sender and the sender had
    /// seen nothing we have not delivered.
    pub fn is_causally_next(&self, stamp: &VectorTimeStamp) -> bool {
        let sender = stamp.owner;
        if stamp.get(&sender) != self.get(&sender) + 1 {
            return false;
        }
        stamp
            .values
            .iter()
            .filter(|(mbr, _)| **mbr != sender)
            .all(|(mbr, value)| *value <= self.get(mbr))
    }

    /// Entry-wise `<=` with at least one entry strictly smaller.
    pub fn happened_before(&self, other: &VectorTimeStamp) -> bool {
        let mut strictly = false;
        let mbrs: BTreeSet<&Address> = self.values.keys().chain(other.values.keys()).collect();
        for mbr in mbrs {
            let (mine, theirs) = (self.get(mbr), other.get(mbr));
            if mine > theirs {
                return false;
            }
            strictly |= mine < theirs;
        }
        strictly
    }

    /// Sum of all entries; orders the delay queue.
    pub fn sum(&self) -> u64 {
        self.values.values().sum()
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }
}

impl fmt::Display for VectorTimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .values
            .iter()
            .map(|(mbr, value)| format!("{}:{}", mbr, value))
            .collect();
        write!(f, "[{}]", entries.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalHeader {
    pub stamp: VectorTimeStamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CausalConfig {}

#[derive(Default)]
struct CausalState {
    clock: Option<VectorTimeStamp>,
    /// Waiting messages, ordered by stamp sum.
    delayed: Vec<(VectorTimeStamp, Message)>,
}

impl CausalState {
    /// Delivers `msg` if possible, then everything in the delay queue that it
    /// unblocked. Returns the messages in delivery order.
    fn receive(&mut self, stamp: VectorTimeStamp, msg: Message) -> Vec<Message> {
        let Some(clock) = self.clock.as_mut() else {
            return vec![msg];
        };

        if !clock.is_causally_next(&stamp) {
            tracing::trace!("{}: delaying message stamped {} (clock {})", NAME, stamp, clock);
            let pos = self
                .delayed
                .partition_point(|(queued, _)| queued.sum() <= stamp.sum());
            self.delayed.insert(pos, (stamp, msg));
            return Vec::new();
        }

        clock.max(&stamp);
        let mut deliverable = vec![msg];

        while let Some(pos) = self
            .delayed
            .iter()
            .position(|(queued, _)| clock.is_causally_next(queued))
        {
            let (queued, msg) = self.delayed.remove(pos);
            clock.max(&queued);
            deliverable.push(msg);
        }
        deliverable
    }

    /// Resizes the clock to `view` and zeroes it. Returns the messages that
    /// were waiting under the previous view.
    fn view_change(&mut self, view: &View) -> Vec<Message> {
        let Some(clock) = self.clock.as_mut() else {
            return Vec::new();
        };
        clock.merge_members(view.members());
        clock.reset_counts();

        if !self.delayed.is_empty() {
            tracing::debug!(
                "{}: view {} installed, releasing {} message(s) stamped in the old view",
                NAME,
                view.vid(),
                self.delayed.len()
            );
        }
        self.delayed.drain(..).map(|(_, msg)| msg).collect()
    }

    fn reset(&mut self) {
        if let Some(clock) = self.clock.as_ref() {
            let owner = clock.owner();
            *self = CausalState {
                clock: Some(VectorTimeStamp::new(owner)),
                ..CausalState::default()
            };
        }
    }
}

pub struct Causal {
    links: Arc<Links>,
    state: Mutex<CausalState>,
}

impl Causal {
    pub fn new(_config: CausalConfig) -> Arc<Self> {
        Arc::new(Self {
            links: Links::new(NAME),
            state: Mutex::new(CausalState::default()),
        })
    }

    pub fn clock(&self) -> Option<VectorTimeStamp> {
        self.state.lock().unwrap().clock.clone()
    }

    pub fn delayed_count(&self) -> usize {
        self.state.lock().unwrap().delayed.len()
    }

    fn send(&self, mut msg: Message) {
        let stamp = {
            let mut st = self.state.lock().unwrap();
            st.clock.as_mut().map(|clock| {
                clock.increment();
                clock.clone()
            })
        };

        match stamp {
            Some(stamp) => msg.put_header(NAME, Header::Causal(CausalHeader { stamp })),
            None => tracing::warn!("{}: no local address yet, sending unstamped", NAME),
        }
        self.pass_down(Event::Msg(msg));
    }

    fn receive(&self, stamp: VectorTimeStamp, msg: Message) {
        let deliverable = {
            let mut st = self.state.lock().unwrap();
            let own = st.clock.as_ref().map(|clock| clock.owner()) == Some(stamp.owner());
            if own {
                // already counted when it was sent
                vec![msg]
            } else {
                st.receive(stamp, msg)
            }
        };

        for msg in deliverable {
            self.pass_up(Event::Msg(msg));
        }
    }
}

impl Protocol for Causal {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::Causal(hdr)) => self.receive(hdr.stamp, msg),
                Some(other) => {
                    tracing::warn!("{}: unexpected header under our name: {:?}", NAME, other)
                }
                None => self.pass_up(Event::Msg(msg)),
            },
            Event::SetLocalAddress(addr) => {
                {
                    let mut st = self.state.lock().unwrap();
                    if st.clock.as_ref().map(|clock| clock.owner()) != Some(addr) {
                        st.clock = Some(VectorTimeStamp::new(addr));
                    }
                }
                self.pass_up(Event::SetLocalAddress(addr));
            }
            Event::ViewChange(view) => {
                let released = self.state.lock().unwrap().view_change(&view);
                for msg in released {
                    self.pass_up(Event::Msg(msg));
                }
                self.pass_up(Event::ViewChange(view));
            }
            Event::Exit => {
                self.state.lock().unwrap().reset();
                self.pass_up(Event::Exit);
            }
            other => self.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Msg(msg) if msg.is_multicast() => self.send(msg),
            Event::Disconnect(addr) => {
                self.state.lock().unwrap().reset();
                self.pass_down(Event::Disconnect(addr));
            }
            other => self.pass_down(other),
        }
    }
}
