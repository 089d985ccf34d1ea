//! Protocol headers carried inside a [`Message`](super::Message).
//!
//! Each protocol owns exactly one header type and stores it in the message
//! under its own name. The set is closed so the whole message serializes
//! with bincode without any type registry.

use serde::{Deserialize, Serialize};

use crate::protocols::causal::CausalHeader;
use crate::protocols::gms::GmsHeader;
use crate::protocols::nakack::NakAckHeader;
use crate::protocols::ping::PingHeader;
use crate::protocols::stable::StableHeader;
use crate::protocols::unicast::UnicastHeader;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Header {
    NakAck(NakAckHeader),
    Unicast(UnicastHeader),
    Gms(GmsHeader),
    Stable(StableHeader),
    Causal(CausalHeader),
    Ping(PingHeader),
}
