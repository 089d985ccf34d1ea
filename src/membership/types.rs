use crate::message::Address;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifies a view: the member that created it and a Lamport timestamp.
///
/// Ordered by `id` first, then by creator, so two coordinators racing to
/// create view `n` still produce totally ordered ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    pub coord: Address,
    pub id: u64,
}

impl ViewId {
    pub fn new(coord: Address, id: u64) -> Self {
        Self { coord, id }
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.coord.cmp(&other.coord))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.coord, self.id)
    }
}

/// An installed group membership. Never mutated after it has been published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    vid: ViewId,
    members: Vec<Address>,
}

impl View {
    pub fn new(vid: ViewId, members: Vec<Address>) -> Self {
        Self { vid, members }
    }

    pub fn vid(&self) -> ViewId {
        self.vid
    }

    pub fn creator(&self) -> Address {
        self.vid.coord
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// The first member. `None` only for an (invalid) empty view.
    pub fn coordinator(&self) -> Option<Address> {
        self.members.first().copied()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<String> = self.members.iter().map(|m| m.to_string()).collect();
        write!(f, "{} [{}]", self.vid, members.join(", "))
    }
}

/// Ordered, duplicate-free list of members.
///
/// Insertion order is preserved so the coordinator (first element) never moves
/// unless it is removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: Vec<Address>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: &[Address]) -> Self {
        let mut membership = Self::new();
        membership.add_all(members);
        membership
    }

    /// Appends `addr` unless it is already present.
    pub fn add(&mut self, addr: Address) {
        if !self.members.contains(&addr) {
            self.members.push(addr);
        }
    }

    pub fn add_all(&mut self, addrs: &[Address]) {
        for addr in addrs {
            self.add(*addr);
        }
    }

    pub fn remove(&mut self, addr: &Address) {
        self.members.retain(|m| m != addr);
    }

    pub fn remove_all(&mut self, addrs: &[Address]) {
        self.members.retain(|m| !addrs.contains(m));
    }

    /// Replaces the contents, dropping duplicates.
    pub fn set(&mut self, addrs: &[Address]) {
        self.members.clear();
        self.add_all(addrs);
    }

    /// Removes `suspects` first, then appends `new_mbrs`.
    pub fn merge(&mut self, new_mbrs: &[Address], suspects: &[Address]) {
        self.remove_all(suspects);
        self.add_all(new_mbrs);
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    pub fn elements(&self) -> &[Address] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

/// Answer to a discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRsp {
    pub own_addr: Address,
    /// The coordinator the responder knows about, if it is a member.
    pub coord_addr: Option<Address>,
    pub is_server: bool,
}
