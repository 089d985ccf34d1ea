//! STABLE: distributed garbage collection for NAKACK.
//!
//! Each member periodically multicasts its NAKACK digest. Members fold the
//! gossips of one round into a running digest (minimum `low`/`high`, maximum
//! `high_seen`); once every member of the view has been heard from the
//! result is stable. After a random delay one member multicasts it as a
//! STABILITY message, and every receiver passes it down to NAKACK, which
//! trims its send log. A member that receives someone else's STABILITY
//! first cancels its own pending one.
//!
//! Gossip only runs while there is traffic: after `max_gossip_runs` rounds
//! without new application messages it stops until the next one.

use crate::membership::{Digest, DigestEntry};
use crate::message::{Address, Event, EventType, Header, Message};
use crate::scheduler::{TimeScheduler, TimedTask};
use crate::stack::Protocol;
use crate::stack::config::millis;
use crate::stack::protocol::Links;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const NAME: &str = "STABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StableType {
    StableGossip,
    Stability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableHeader {
    pub kind: StableType,
    pub digest: Digest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StableConfig {
    /// Average ms between two gossips of one member, scaled by group size.
    pub desired_avg_gossip: u64,
    /// Upper bound in ms of the random delay before a STABILITY is sent.
    pub stability_delay: u64,
    /// Idle gossip rounds before gossiping stops.
    pub max_gossip_runs: u32,
}

impl Default for StableConfig {
    fn default() -> Self {
        Self {
            desired_avg_gossip: 20_000,
            stability_delay: 6_000,
            max_gossip_runs: 3,
        }
    }
}

/// Periodic gossip; the interval is re-drawn after every run.
struct GossipTask {
    stable: Weak<Stable>,
    cancelled: AtomicBool,
}

impl TimedTask for GossipTask {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_interval(&self) -> Duration {
        match self.stable.upgrade() {
            Some(stable) => stable.gossip_interval(),
            None => Duration::from_millis(1),
        }
    }

    fn run(&self) {
        match self.stable.upgrade() {
            Some(stable) => stable.gossip_tick(),
            None => self.cancelled.store(true, Ordering::SeqCst),
        }
    }
}

/// One-shot STABILITY broadcast.
struct StabilityTask {
    stable: Weak<Stable>,
    digest: Digest,
    delay: Duration,
    cancelled: AtomicBool,
}

impl TimedTask for StabilityTask {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn next_interval(&self) -> Duration {
        self.delay
    }

    fn run(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(stable) = self.stable.upgrade() {
            stable.send_stability(self.digest.clone());
        }
    }
}

#[derive(Default)]
struct StableState {
    members: Vec<Address>,
    /// Folded digest of the current round.
    running: BTreeMap<Address, DigestEntry>,
    /// Members whose gossip for the current round is still outstanding.
    heard_from: Vec<Address>,
    gossip_task: Option<Arc<GossipTask>>,
    stability_task: Option<Arc<StabilityTask>>,
    gossip_runs_left: u32,
}

impl StableState {
    fn reset_round(&mut self) {
        self.running.clear();
        self.heard_from = self.members.clone();
    }

    fn round_digest(&self) -> Digest {
        let mut digest = Digest::with_capacity(self.running.len());
        for entry in self.running.values() {
            digest.add_entry(*entry);
        }
        digest
    }
}

pub struct Stable {
    config: StableConfig,
    links: Arc<Links>,
    scheduler: Arc<TimeScheduler>,
    self_ref: Weak<Stable>,
    state: Mutex<StableState>,
}

impl Stable {
    pub fn new(config: StableConfig, scheduler: Arc<TimeScheduler>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            links: Links::new(NAME),
            scheduler,
            self_ref: self_ref.clone(),
            state: Mutex::new(StableState::default()),
        })
    }

    /// Random delay with a mean of `desired_avg_gossip * group size`.
    fn gossip_interval(&self) -> Duration {
        let size = self.state.lock().unwrap().members.len().max(1) as u64;
        let upper = (2 * self.config.desired_avg_gossip * size).max(2);
        millis(rand::thread_rng().gen_range(1..upper))
    }

    /// Application traffic was seen: keep (or start) gossiping.
    fn activity(&self) {
        let task = {
            let mut st = self.state.lock().unwrap();
            st.gossip_runs_left = self.config.max_gossip_runs;
            if st.gossip_task.is_some() || st.members.is_empty() {
                return;
            }
            let task = Arc::new(GossipTask {
                stable: self.self_ref.clone(),
                cancelled: AtomicBool::new(false),
            });
            st.gossip_task = Some(task.clone());
            task
        };

        tracing::debug!("{}: starting gossip", NAME);
        self.scheduler.add(task);
    }

    fn gossip_tick(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.gossip_runs_left == 0 {
                if let Some(task) = st.gossip_task.take() {
                    task.cancelled.store(true, Ordering::SeqCst);
                }
                tracing::debug!(
                    "{}: no traffic for {} gossip round(s), stopping gossip",
                    NAME,
                    self.config.max_gossip_runs
                );
                return;
            }
            st.gossip_runs_left -= 1;
        }

        self.pass_down(Event::GetDigestStable);
    }

    fn send_gossip(&self, digest: Digest) {
        tracing::trace!("{}: gossiping {}", NAME, digest);
        let mut msg = Message::multicast(Vec::new());
        msg.put_header(
            NAME,
            Header::Stable(StableHeader {
                kind: StableType::StableGossip,
                digest,
            }),
        );
        self.pass_down(Event::Msg(msg));
    }

    fn handle_gossip(&self, sender: Address, digest: &Digest) {
        let stable = {
            let mut st = self.state.lock().unwrap();
            if !st.heard_from.contains(&sender) {
                tracing::trace!(
                    "{}: ignoring gossip from {} (not a member or already counted)",
                    NAME,
                    sender
                );
                return;
            }

            for entry in digest.iter() {
                if !st.members.contains(&entry.sender) {
                    continue;
                }
                st.running
                    .entry(entry.sender)
                    .and_modify(|folded| {
                        folded.low = folded.low.min(entry.low);
                        folded.high = folded.high.min(entry.high);
                        folded.high_seen = folded.high_seen.max(entry.high_seen);
                    })
                    .or_insert(*entry);
            }

            st.heard_from.retain(|m| *m != sender);
            self.complete_round(&mut st)
        };

        if let Some(digest) = stable {
            self.schedule_stability(digest);
        }
    }

    /// Closes the round if nobody is outstanding, returning the stable digest.
    fn complete_round(&self, st: &mut StableState) -> Option<Digest> {
        if !st.heard_from.is_empty() || st.running.is_empty() {
            return None;
        }
        let digest = st.round_digest();
        st.reset_round();
        Some(digest)
    }

    fn schedule_stability(&self, digest: Digest) {
        let delay = match self.config.stability_delay {
            0 => Duration::ZERO,
            max => millis(rand::thread_rng().gen_range(0..=max)),
        };

        tracing::debug!("{}: round complete, STABILITY in {:?}: {}", NAME, delay, digest);

        let task = Arc::new(StabilityTask {
            stable: self.self_ref.clone(),
            digest,
            delay,
            cancelled: AtomicBool::new(false),
        });

        let previous = self
            .state
            .lock()
            .unwrap()
            .stability_task
            .replace(task.clone());
        if let Some(previous) = previous {
            previous.cancelled.store(true, Ordering::SeqCst);
        }

        self.scheduler.add(task);
    }

    fn send_stability(&self, digest: Digest) {
        tracing::debug!("{}: sending STABILITY {}", NAME, digest);
        let mut msg = Message::multicast(Vec::new());
        msg.put_header(
            NAME,
            Header::Stable(StableHeader {
                kind: StableType::Stability,
                digest,
            }),
        );
        self.pass_down(Event::Msg(msg));
    }

    fn handle_stability(&self, digest: Digest) {
        {
            let mut st = self.state.lock().unwrap();
            if let Some(task) = st.stability_task.take() {
                task.cancelled.store(true, Ordering::SeqCst);
            }
            st.reset_round();
        }

        tracing::debug!("{}: stable digest {}", NAME, digest);
        self.pass_down(Event::Stable(digest));
    }

    fn suspect(&self, mbr: Address) {
        let stable = {
            let mut st = self.state.lock().unwrap();
            st.heard_from.retain(|m| *m != mbr);
            self.complete_round(&mut st)
        };

        if let Some(digest) = stable {
            self.schedule_stability(digest);
        }
    }

    fn view_change(&self, members: &[Address]) {
        {
            let mut st = self.state.lock().unwrap();
            st.members = members.to_vec();
            st.reset_round();
        }
        self.activity();
    }

    fn stop_tasks(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(task) = st.gossip_task.take() {
            task.cancelled.store(true, Ordering::SeqCst);
        }
        if let Some(task) = st.stability_task.take() {
            task.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_gossiping(&self) -> bool {
        self.state.lock().unwrap().gossip_task.is_some()
    }

    /// Members whose gossip the current round is still waiting for.
    pub fn outstanding(&self) -> Vec<Address> {
        self.state.lock().unwrap().heard_from.clone()
    }
}

impl Protocol for Stable {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn required_down_services(&self) -> Vec<EventType> {
        vec![EventType::GetDigestStable, EventType::Stable]
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::Stable(hdr)) => match hdr.kind {
                    StableType::StableGossip => match msg.src {
                        Some(sender) => self.handle_gossip(sender, &hdr.digest),
                        None => tracing::warn!("{}: gossip without a sender", NAME),
                    },
                    StableType::Stability => self.handle_stability(hdr.digest),
                },
                Some(other) => {
                    tracing::warn!("{}: unexpected header under our name: {:?}", NAME, other)
                }
                None => {
                    self.activity();
                    self.pass_up(Event::Msg(msg));
                }
            },
            Event::GetDigestStableOk(digest) => self.send_gossip(digest),
            Event::Suspect(mbr) => {
                self.suspect(mbr);
                self.pass_up(Event::Suspect(mbr));
            }
            other => self.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Msg(msg) => {
                self.activity();
                self.pass_down(Event::Msg(msg));
            }
            Event::ViewChange(view) => {
                self.view_change(view.members());
                self.pass_down(Event::ViewChange(view));
            }
            Event::Disconnect(addr) => {
                self.stop_tasks();
                *self.state.lock().unwrap() = StableState::default();
                self.pass_down(Event::Disconnect(addr));
            }
            other => self.pass_down(other),
        }
    }

    fn stop(&self) {
        self.stop_tasks();
    }
}
