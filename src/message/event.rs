//! The inter-layer event.
//!
//! An `Event` is what travels between two adjacent layers. Each variant carries
//! its own argument, so a layer never has to downcast a payload.

use super::address::Address;
use super::message::Message;
use crate::membership::{Digest, PingRsp, View};

#[derive(Debug, Clone)]
pub enum Event {
    /// A message travelling down (send) or up (receive).
    Msg(Message),
    /// Join the named group. Consumed by GMS.
    Connect(String),
    ConnectOk,
    /// Leave the group. Carries the local address.
    Disconnect(Address),
    DisconnectOk,
    /// A newly installed view. Passed both up and down by GMS.
    ViewChange(View),
    /// Emitted by the transport once it is bound, before any `Connect`.
    SetLocalAddress(Address),
    Suspect(Address),
    Unsuspect(Address),
    /// Discovery request, answered by `FindInitialMbrsOk`.
    FindInitialMbrs,
    FindInitialMbrsOk(Vec<PingRsp>),
    /// A prospective view the coordinator is about to cast. Lets the transport
    /// reach joiners before the view is installed.
    TmpView(View),
    /// The local process became a group member and should answer discovery.
    BecomeServer,
    /// Agreed stability digest: everything up to `high` was seen by everyone.
    Stable(Digest),
    GetDigest,
    GetDigestOk(Digest),
    /// Digest request issued by STABLE, kept apart from GMS's `GetDigest`.
    GetDigestStable,
    GetDigestStableOk(Digest),
    SetDigest(Digest),
    MergeDigest(Digest),
    /// The process was excluded from the group (shunned).
    Exit,
}

/// Fieldless mirror of [`Event`], used to declare provided/required services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    Msg,
    Connect,
    ConnectOk,
    Disconnect,
    DisconnectOk,
    ViewChange,
    SetLocalAddress,
    Suspect,
    Unsuspect,
    FindInitialMbrs,
    FindInitialMbrsOk,
    TmpView,
    BecomeServer,
    Stable,
    GetDigest,
    GetDigestOk,
    GetDigestStable,
    GetDigestStableOk,
    SetDigest,
    MergeDigest,
    Exit,
}

impl Event {
    pub fn kind(&self) -> EventType {
        match self {
            Event::Msg(_) => EventType::Msg,
            Event::Connect(_) => EventType::Connect,
            Event::ConnectOk => EventType::ConnectOk,
            Event::Disconnect(_) => EventType::Disconnect,
            Event::DisconnectOk => EventType::DisconnectOk,
            Event::ViewChange(_) => EventType::ViewChange,
            Event::SetLocalAddress(_) => EventType::SetLocalAddress,
            Event::Suspect(_) => EventType::Suspect,
            Event::Unsuspect(_) => EventType::Unsuspect,
            Event::FindInitialMbrs => EventType::FindInitialMbrs,
            Event::FindInitialMbrsOk(_) => EventType::FindInitialMbrsOk,
            Event::TmpView(_) => EventType::TmpView,
            Event::BecomeServer => EventType::BecomeServer,
            Event::Stable(_) => EventType::Stable,
            Event::GetDigest => EventType::GetDigest,
            Event::GetDigestOk(_) => EventType::GetDigestOk,
            Event::GetDigestStable => EventType::GetDigestStable,
            Event::GetDigestStableOk(_) => EventType::GetDigestStableOk,
            Event::SetDigest(_) => EventType::SetDigest,
            Event::MergeDigest(_) => EventType::MergeDigest,
            Event::Exit => EventType::Exit,
        }
    }
}
