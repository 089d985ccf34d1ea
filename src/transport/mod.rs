//! Transports
//!
//! The bottom layer of every stack. A transport puts serialized messages on
//! the wire, stamps the local address as source, and emulates multicast by
//! sending one copy to every known member (plus a loopback copy to itself).
//!
//! ## Submodules
//! - **`udp`**: Real datagram transport over a tokio `UdpSocket`.
//! - **`loopback`**: In-process network for tests, with optional loss and reordering.

pub mod loopback;
pub mod udp;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use udp::UdpTransport;

use crate::membership::View;
use crate::message::Address;

use std::sync::RwLock;

/// Who a multicast goes to.
///
/// Members come from installed views. A `TmpView` adds the members of a view
/// that is about to be cast, so joiners receive the multicast announcing it.
#[derive(Default)]
pub(crate) struct Fanout {
    members: RwLock<Vec<Address>>,
}

impl Fanout {
    pub fn set_view(&self, view: &View) {
        *self.members.write().unwrap() = view.members().to_vec();
    }

    pub fn add_tmp_view(&self, view: &View) {
        let mut members = self.members.write().unwrap();
        for mbr in view.members() {
            if !members.contains(mbr) {
                members.push(*mbr);
            }
        }
    }

    pub fn clear(&self) {
        self.members.write().unwrap().clear();
    }

    /// Every member plus `local`, without duplicates.
    pub fn targets(&self, local: Address) -> Vec<Address> {
        let mut targets = self.members.read().unwrap().clone();
        if !targets.contains(&local) {
            targets.push(local);
        }
        targets
    }
}

#[cfg(test)]
mod tests;
