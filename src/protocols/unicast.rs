//! UNICAST: reliable, FIFO point-to-point delivery.
//!
//! One connection per peer. The sending side numbers messages from 1 and
//! keeps each one in an `AckSenderWindow` until the peer acks it. The
//! receiving side acks every data message it accepts and delivers through an
//! `AckReceiverWindow` in seqno order. The first message on a connection is
//! flagged so the receiver knows where the peer's numbering starts, and every
//! header carries the sender's connection id so a restarted connection (same
//! peer, numbering back at 1) is told apart from stale duplicates.

use crate::message::{Address, Event, Header, Message, Seqno};
use crate::retransmission::{AckReceiverWindow, AckSenderWindow, ResendFn};
use crate::scheduler::TimeScheduler;
use crate::stack::Protocol;
use crate::stack::config::millis_list;
use crate::stack::protocol::Links;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

pub const NAME: &str = "UNICAST";

const FIRST_SEQNO: Seqno = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnicastType {
    Data,
    DataAck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnicastHeader {
    pub kind: UnicastType,
    pub seqno: Seqno,
    /// Set on the message that opens a connection.
    pub first: bool,
    pub conn_id: u32,
}

impl UnicastHeader {
    pub fn data(seqno: Seqno, first: bool, conn_id: u32) -> Self {
        Self {
            kind: UnicastType::Data,
            seqno,
            first,
            conn_id,
        }
    }

    pub fn ack(seqno: Seqno, conn_id: u32) -> Self {
        Self {
            kind: UnicastType::DataAck,
            seqno,
            first: false,
            conn_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnicastConfig {
    /// Retransmission backoff in ms; the last value repeats.
    pub timeout: Vec<u64>,
    /// Maximum unacked messages per peer; 0 disables throttling.
    pub window_size: usize,
    /// Queued messages are released once fewer than this many are unacked.
    pub min_threshold: usize,
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            timeout: vec![800, 1600, 3200, 6400],
            window_size: 0,
            min_threshold: 0,
        }
    }
}

struct Connection {
    next_seqno: Seqno,
    send_conn_id: u32,
    sent: Option<AckSenderWindow>,
    recv_conn_id: u32,
    received: Option<AckReceiverWindow>,
}

impl Connection {
    fn new(send_conn_id: u32) -> Self {
        Self {
            next_seqno: FIRST_SEQNO,
            send_conn_id,
            sent: None,
            recv_conn_id: 0,
            received: None,
        }
    }

    fn reset(&mut self) {
        if let Some(sent) = self.sent.take() {
            sent.reset();
        }
        if let Some(mut received) = self.received.take() {
            received.reset();
        }
    }
}

/// What happened to an incoming data message.
enum Receipt {
    /// Accepted or a duplicate: ack it. Carries whatever is now deliverable.
    Accepted(Vec<Message>),
    /// No connection yet and not flagged as first: drop without acking so the
    /// sender keeps retransmitting.
    Rejected,
}

pub struct Unicast {
    config: UnicastConfig,
    links: Arc<Links>,
    scheduler: Arc<TimeScheduler>,
    local_addr: RwLock<Option<Address>>,
    connections: DashMap<Address, Connection>,
    members: RwLock<Vec<Address>>,
    next_conn_id: AtomicU32,
}

impl Unicast {
    pub fn new(config: UnicastConfig, scheduler: Arc<TimeScheduler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            links: Links::new(NAME),
            scheduler,
            local_addr: RwLock::new(None),
            connections: DashMap::new(),
            members: RwLock::new(Vec::new()),
            next_conn_id: AtomicU32::new(rand::random::<u32>() | 1),
        })
    }

    fn local_addr(&self) -> Option<Address> {
        *self.local_addr.read().unwrap()
    }

    fn new_connection(&self) -> Connection {
        Connection::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    fn resend_fn(&self) -> ResendFn {
        let links = self.links.clone();
        Arc::new(move |seqno, msg| {
            tracing::trace!("{}: retransmitting #{} to {:?}", NAME, seqno, msg.dest);
            links.pass_down(Event::Msg(msg));
        })
    }

    fn send(&self, dest: Address, mut msg: Message) {
        msg.src = self.local_addr();

        let send_now = {
            let mut conn = self
                .connections
                .entry(dest)
                .or_insert_with(|| self.new_connection());
            let seqno = conn.next_seqno;
            conn.next_seqno += 1;

            if conn.sent.is_none() {
                conn.sent = Some(AckSenderWindow::new(
                    dest,
                    self.resend_fn(),
                    self.scheduler.clone(),
                    millis_list(&self.config.timeout),
                    self.config.window_size,
                    self.config.min_threshold,
                ));
            }

            msg.put_header(
                NAME,
                Header::Unicast(UnicastHeader::data(
                    seqno,
                    seqno == FIRST_SEQNO,
                    conn.send_conn_id,
                )),
            );
            match conn.sent.as_ref() {
                Some(window) => window.add(seqno, msg.clone()),
                None => false,
            }
        };

        if send_now {
            self.pass_down(Event::Msg(msg));
        }
    }

    fn send_ack(&self, dest: Address, seqno: Seqno, conn_id: u32) {
        let mut ack = Message::new(Some(dest), self.local_addr(), Vec::new());
        ack.put_header(NAME, Header::Unicast(UnicastHeader::ack(seqno, conn_id)));
        self.pass_down(Event::Msg(ack));
    }

    fn receive_data(&self, src: Address, hdr: &UnicastHeader, msg: Message) -> Receipt {
        let mut conn = self
            .connections
            .entry(src)
            .or_insert_with(|| self.new_connection());

        let current = conn.received.is_some() && conn.recv_conn_id == hdr.conn_id;
        if !current {
            if !hdr.first {
                tracing::debug!(
                    "{}: discarding #{} from {}: connection {} not opened yet",
                    NAME,
                    hdr.seqno,
                    src,
                    hdr.conn_id
                );
                return Receipt::Rejected;
            }
            if conn.received.is_some() {
                tracing::debug!("{}: {} opened a new connection {}", NAME, src, hdr.conn_id);
            }
            conn.recv_conn_id = hdr.conn_id;
            conn.received = Some(AckReceiverWindow::new(hdr.seqno));
        }

        let Some(window) = conn.received.as_mut() else {
            return Receipt::Rejected;
        };

        if !window.add(hdr.seqno, msg) {
            tracing::trace!("{}: duplicate #{} from {}", NAME, hdr.seqno, src);
        }

        let mut deliverable = Vec::new();
        while let Some(next) = window.remove() {
            deliverable.push(next);
        }
        Receipt::Accepted(deliverable)
    }

    fn handle_ack(&self, src: Address, seqno: Seqno, conn_id: u32) {
        let released = self
            .connections
            .get(&src)
            .filter(|conn| conn.send_conn_id == conn_id)
            .and_then(|conn| conn.sent.as_ref().map(|window| window.ack(seqno)))
            .unwrap_or_default();

        for (_, msg) in released {
            self.pass_down(Event::Msg(msg));
        }
    }

    /// Closes connections to members that were in the previous view but not
    /// in this one. Peers that never were members (joining clients) keep theirs.
    fn view_change(&self, members: &[Address]) {
        let departed: Vec<Address> = {
            let mut current = self.members.write().unwrap();
            let departed = current
                .iter()
                .filter(|peer| !members.contains(peer))
                .copied()
                .collect();
            *current = members.to_vec();
            departed
        };

        for peer in departed {
            if let Some((_, mut conn)) = self.connections.remove(&peer) {
                conn.reset();
                tracing::debug!("{}: closed connection to {}", NAME, peer);
            }
        }
    }

    fn reset(&self) {
        for mut entry in self.connections.iter_mut() {
            entry.value_mut().reset();
        }
        self.connections.clear();
        self.members.write().unwrap().clear();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Messages sent to `peer` that are still waiting for an ack.
    pub fn unacked(&self, peer: &Address) -> usize {
        self.connections
            .get(peer)
            .and_then(|conn| conn.sent.as_ref().map(|window| window.size()))
            .unwrap_or(0)
    }
}

impl Protocol for Unicast {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::Unicast(hdr)) => {
                    let Some(src) = msg.src else {
                        tracing::warn!("{}: discarding message without a sender", NAME);
                        return;
                    };
                    match hdr.kind {
                        UnicastType::Data => {
                            if let Receipt::Accepted(deliverable) = self.receive_data(src, &hdr, msg)
                            {
                                self.send_ack(src, hdr.seqno, hdr.conn_id);
                                for msg in deliverable {
                                    self.pass_up(Event::Msg(msg));
                                }
                            }
                        }
                        UnicastType::DataAck => self.handle_ack(src, hdr.seqno, hdr.conn_id),
                    }
                }
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
            Event::Msg(msg) => match msg.dest {
                Some(dest) if !dest.is_multicast() => self.send(dest, msg),
                _ => self.pass_down(Event::Msg(msg)),
            },
            Event::ViewChange(view) => {
                self.view_change(view.members());
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
        self.reset();
    }
}
