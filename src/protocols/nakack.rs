//! NAKACK: reliable, per-sender ordered multicast.
//!
//! Every outgoing multicast gets the next local seqno and is kept in a send
//! log. Receivers hold one `NakReceiverWindow` per sender and deliver only
//! contiguous runs. Gaps are recovered by unicasting `XmitReq` to the
//! original sender, which answers with one or more `XmitRsp` bundles taken
//! from its send log. The log is trimmed when STABLE reports what everybody
//! has seen.

use crate::membership::{Digest, DigestEntry, View};
use crate::message::{Address, Event, EventType, Header, Message, Seqno};
use crate::retransmission::{NakReceiverWindow, RetransmitCommand, Retransmitter};
use crate::scheduler::TimeScheduler;
use crate::stack::Protocol;
use crate::stack::config::millis_list;
use crate::stack::protocol::Links;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

pub const NAME: &str = "NAKACK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NakAckType {
    Msg,
    XmitReq,
    XmitRsp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NakAckHeader {
    pub kind: NakAckType,
    pub seqno: Seqno,
    /// Inclusive seqno range for `XmitReq` / `XmitRsp`.
    pub range: Option<(Seqno, Seqno)>,
}

impl NakAckHeader {
    pub fn msg(seqno: Seqno) -> Self {
        Self {
            kind: NakAckType::Msg,
            seqno,
            range: None,
        }
    }

    pub fn xmit_req(first: Seqno, last: Seqno) -> Self {
        Self {
            kind: NakAckType::XmitReq,
            seqno: first,
            range: Some((first, last)),
        }
    }

    pub fn xmit_rsp(first: Seqno, last: Seqno) -> Self {
        Self {
            kind: NakAckType::XmitRsp,
            seqno: first,
            range: Some((first, last)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NakAckConfig {
    /// Retransmission backoff in ms; the last value repeats.
    pub retransmit_timeout: Vec<u64>,
    /// Number of stable messages kept in the send log for late retransmissions.
    pub gc_lag: i64,
    /// Upper bound in bytes for one `XmitRsp` bundle.
    pub max_xmit_size: usize,
}

impl Default for NakAckConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: vec![600, 1200, 2400, 4800],
            gc_lag: 20,
            max_xmit_size: 8192,
        }
    }
}

/// Asks the original sender for a missing range.
struct XmitRequester {
    links: Arc<Links>,
}

impl RetransmitCommand for XmitRequester {
    fn retransmit(&self, first: Seqno, last: Seqno, sender: Address) {
        send_xmit_req(&self.links, sender, first, last);
    }
}

fn send_xmit_req(links: &Links, sender: Address, first: Seqno, last: Seqno) {
    tracing::debug!("{}: XMIT_REQ [{} - {}] to {}", NAME, first, last, sender);
    let mut msg = Message::unicast(sender, Vec::new());
    msg.put_header(NAME, Header::NakAck(NakAckHeader::xmit_req(first, last)));
    links.pass_down(Event::Msg(msg));
}

pub struct NakAck {
    config: NakAckConfig,
    links: Arc<Links>,
    scheduler: Arc<TimeScheduler>,
    local_addr: RwLock<Option<Address>>,
    /// Next seqno to assign to an outgoing multicast.
    seqno: Mutex<Seqno>,
    sent_msgs: Mutex<BTreeMap<Seqno, Message>>,
    received_msgs: DashMap<Address, NakReceiverWindow>,
    members: RwLock<Vec<Address>>,
}

impl NakAck {
    pub fn new(config: NakAckConfig, scheduler: Arc<TimeScheduler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            links: Links::new(NAME),
            scheduler,
            local_addr: RwLock::new(None),
            seqno: Mutex::new(0),
            sent_msgs: Mutex::new(BTreeMap::new()),
            received_msgs: DashMap::new(),
            members: RwLock::new(Vec::new()),
        })
    }

    fn local_addr(&self) -> Option<Address> {
        *self.local_addr.read().unwrap()
    }

    fn new_window(&self, sender: Address, start: Seqno) -> NakReceiverWindow {
        let command = Arc::new(XmitRequester {
            links: self.links.clone(),
        });
        let retransmitter = Retransmitter::new(
            sender,
            command,
            self.scheduler.clone(),
            millis_list(&self.config.retransmit_timeout),
        );
        NakReceiverWindow::new(sender, start, Some(retransmitter))
    }

    // --- Sending ---

    fn send(&self, mut msg: Message) {
        msg.src = self.local_addr();

        {
            let mut seqno = self.seqno.lock().unwrap();
            msg.put_header(NAME, Header::NakAck(NakAckHeader::msg(*seqno)));
            self.sent_msgs.lock().unwrap().insert(*seqno, msg.clone());
            tracing::trace!("{}: sending #{}", NAME, *seqno);
            *seqno += 1;
        }

        self.pass_down(Event::Msg(msg));
    }

    // --- Receiving ---

    fn handle_message(&self, seqno: Seqno, msg: Message) {
        let Some(sender) = msg.src else {
            tracing::warn!("{}: discarding #{} without a sender", NAME, seqno);
            return;
        };

        let deliverable = {
            let Some(mut window) = self.received_msgs.get_mut(&sender) else {
                tracing::debug!(
                    "{}: discarding #{} from {}: sender has no window (not a member)",
                    NAME,
                    seqno,
                    sender
                );
                return;
            };

            window.add(seqno, msg);

            let mut deliverable = Vec::new();
            while let Some(next) = window.remove() {
                deliverable.push(next);
            }
            deliverable
        };

        for msg in deliverable {
            self.pass_up(Event::Msg(msg));
        }
    }

    /// Answers an `XmitReq` from the send log, splitting the answer into
    /// bundles no larger than `max_xmit_size`.
    fn handle_xmit_req(&self, requester: Address, first: Seqno, last: Seqno) {
        if first > last {
            tracing::warn!(
                "{}: dropping XMIT_REQ from {} with inverted range [{} - {}]",
                NAME,
                requester,
                first,
                last
            );
            return;
        }

        let msgs: Vec<(Seqno, Message)> = self
            .sent_msgs
            .lock()
            .unwrap()
            .range(first..=last)
            .map(|(seqno, msg)| (*seqno, msg.clone()))
            .collect();

        let requested = (last - first + 1).max(0) as usize;
        if msgs.len() < requested {
            tracing::warn!(
                "{}: {} asked for [{} - {}] but only {} message(s) are still in the send log",
                NAME,
                requester,
                first,
                last,
                msgs.len()
            );
        }

        let mut bundle: Vec<(Seqno, Message)> = Vec::new();
        let mut bundle_size = 0;
        for (seqno, msg) in msgs {
            let size = msg.size();
            if !bundle.is_empty() && bundle_size + size > self.config.max_xmit_size {
                self.send_xmit_rsp(requester, std::mem::take(&mut bundle));
                bundle_size = 0;
            }
            bundle_size += size;
            bundle.push((seqno, msg));
        }
        if !bundle.is_empty() {
            self.send_xmit_rsp(requester, bundle);
        }
    }

    fn send_xmit_rsp(&self, requester: Address, bundle: Vec<(Seqno, Message)>) {
        let (Some((first, _)), Some((last, _))) = (bundle.first(), bundle.last()) else {
            return;
        };
        let (first, last) = (*first, *last);
        let msgs: Vec<Message> = bundle.into_iter().map(|(_, msg)| msg).collect();

        let payload = match bincode::serialize(&msgs) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("{}: failed to serialize XMIT_RSP bundle: {}", NAME, e);
                return;
            }
        };

        tracing::debug!(
            "{}: XMIT_RSP [{} - {}] ({} bytes) to {}",
            NAME,
            first,
            last,
            payload.len(),
            requester
        );

        let mut rsp = Message::new(Some(requester), self.local_addr(), payload);
        rsp.put_header(NAME, Header::NakAck(NakAckHeader::xmit_rsp(first, last)));
        self.pass_down(Event::Msg(rsp));
    }

    fn handle_xmit_rsp(&self, rsp: Message) {
        let msgs: Vec<Message> = match bincode::deserialize(&rsp.payload) {
            Ok(msgs) => msgs,
            Err(e) => {
                tracing::warn!("{}: malformed XMIT_RSP from {:?}: {}", NAME, rsp.src, e);
                return;
            }
        };

        for mut msg in msgs {
            if let Some(Header::NakAck(hdr)) = msg.remove_header(NAME)
                && hdr.kind == NakAckType::Msg
            {
                self.handle_message(hdr.seqno, msg);
            }
        }
    }

    // --- Digests ---

    /// Per sender: lowest retained, highest deliverable, highest received.
    pub fn digest(&self) -> Digest {
        let mut digest = Digest::with_capacity(self.received_msgs.len());
        for entry in self.received_msgs.iter() {
            let window = entry.value();
            digest.add_entry(DigestEntry {
                sender: *entry.key(),
                low: window.lowest_seen(),
                high: window.highest_deliverable(),
                high_seen: window.highest_received(),
            });
        }
        digest
    }

    /// Replaces every window with the ones described by `digest`.
    fn set_digest(&self, digest: &Digest) {
        self.reset_windows();
        for entry in digest.iter() {
            let window = self.new_window(entry.sender, entry.high + 1);
            self.received_msgs.insert(entry.sender, window);
        }
        tracing::debug!("{}: digest set to {}", NAME, digest);
    }

    /// Adds windows for senders we do not know yet; existing windows are kept.
    fn merge_digest(&self, digest: &Digest) {
        for entry in digest.iter() {
            if !self.received_msgs.contains_key(&entry.sender) {
                let window = self.new_window(entry.sender, entry.high + 1);
                self.received_msgs.insert(entry.sender, window);
            }
        }
    }

    /// Garbage-collects what everybody has seen and asks for anything we
    /// missed at the tail of a sender's stream.
    fn stable(&self, digest: &Digest) {
        let local = self.local_addr();
        let mut requests = Vec::new();

        for entry in digest.iter() {
            if Some(entry.sender) == local {
                let cutoff = entry.high - self.config.gc_lag;
                let mut sent = self.sent_msgs.lock().unwrap();
                let before = sent.len();
                *sent = sent.split_off(&(cutoff + 1));
                tracing::debug!(
                    "{}: stable up to #{}, removed {} message(s) below #{} from the send log",
                    NAME,
                    entry.high,
                    before - sent.len(),
                    cutoff + 1
                );
            }

            if let Some(mut window) = self.received_msgs.get_mut(&entry.sender) {
                window.stable(entry.high);

                let my_high = window.highest_received();
                if Some(entry.sender) != local && entry.high_seen > my_high {
                    requests.push((entry.sender, my_high + 1, entry.high_seen));
                }
            }
        }

        for (sender, first, last) in requests {
            tracing::debug!(
                "{}: {} sent up to #{} but we only saw #{}, requesting retransmission",
                NAME,
                sender,
                last,
                first - 1
            );
            send_xmit_req(&self.links, sender, first, last);
        }
    }

    // --- Membership ---

    fn view_change(&self, view: &View) {
        let new_mbrs = view.members();
        let local = self.local_addr();

        let departed: Vec<Address> = self
            .received_msgs
            .iter()
            .map(|entry| *entry.key())
            .filter(|sender| !new_mbrs.contains(sender))
            .collect();

        for sender in departed {
            if let Some((_, mut window)) = self.received_msgs.remove(&sender) {
                window.reset();
                tracing::debug!("{}: removed window of departed member {}", NAME, sender);
            }
        }

        for mbr in new_mbrs {
            if !self.received_msgs.contains_key(mbr) {
                let start = if Some(*mbr) == local {
                    *self.seqno.lock().unwrap()
                } else {
                    0
                };
                let window = self.new_window(*mbr, start);
                self.received_msgs.insert(*mbr, window);
            }
        }

        *self.members.write().unwrap() = new_mbrs.to_vec();
    }

    fn reset_windows(&self) {
        for mut entry in self.received_msgs.iter_mut() {
            entry.value_mut().reset();
        }
        self.received_msgs.clear();
    }

    /// Drops all state, as after leaving the group.
    fn reset(&self) {
        self.reset_windows();
        self.sent_msgs.lock().unwrap().clear();
        *self.seqno.lock().unwrap() = 0;
        self.members.write().unwrap().clear();
    }

    pub fn sent_log_seqnos(&self) -> Vec<Seqno> {
        self.sent_msgs.lock().unwrap().keys().copied().collect()
    }

    pub fn members(&self) -> Vec<Address> {
        self.members.read().unwrap().clone()
    }
}

impl Protocol for NakAck {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn provided_down_services(&self) -> Vec<EventType> {
        vec![
            EventType::GetDigest,
            EventType::GetDigestStable,
            EventType::SetDigest,
            EventType::MergeDigest,
            EventType::Stable,
        ]
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::NakAck(hdr)) => match hdr.kind {
                    NakAckType::Msg => self.handle_message(hdr.seqno, msg),
                    NakAckType::XmitReq => match (msg.src, hdr.range) {
                        (Some(requester), Some((first, last))) => {
                            self.handle_xmit_req(requester, first, last)
                        }
                        _ => tracing::warn!("{}: malformed XMIT_REQ from {:?}", NAME, msg.src),
                    },
                    NakAckType::XmitRsp => self.handle_xmit_rsp(msg),
                },
                Some(other) => {
                    tracing::warn!("{}: unexpected header under our name: {:?}", NAME, other)
                }
                None => self.pass_up(Event::Msg(msg)),
            },
            Event::SetLocalAddress(addr) => {
                *self.local_addr.write().unwrap() = Some(addr);
                self.pass_up(Event::SetLocalAddress(addr));
            }
            other => self.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Msg(msg) if msg.is_multicast() => self.send(msg),
            Event::GetDigest => self.pass_up(Event::GetDigestOk(self.digest())),
            Event::GetDigestStable => self.pass_up(Event::GetDigestStableOk(self.digest())),
            Event::SetDigest(digest) => self.set_digest(&digest),
            Event::MergeDigest(digest) => self.merge_digest(&digest),
            Event::Stable(digest) => self.stable(&digest),
            Event::ViewChange(view) => {
                self.view_change(&view);
                self.pass_down(Event::ViewChange(view));
            }
            Event::Disconnect(addr) => {
                self.reset();
                self.pass_down(Event::Disconnect(addr));
            }
            other => self.pass_down(other),
        }
    }

    fn stop(&self) {
        self.reset_windows();
    }
}
