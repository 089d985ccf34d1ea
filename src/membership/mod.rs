//! Membership Data Model
//!
//! Immutable snapshots describing who is in the group and what each member has
//! sent. GMS produces them, NAKACK and STABLE consume them.
//!
//! ## Core Types
//! - **`View` / `ViewId`**: The agreed, ordered membership at a point in logical time.
//!   `members[0]` is always the coordinator.
//! - **`Membership`**: Ordered, duplicate-free member list used while computing the next view.
//! - **`Digest`**: Per-sender `(low, high, high_seen)` sequence number bookkeeping.
//! - **`PingRsp`**: A discovery answer from a potential member.

pub mod digest;
pub mod types;

pub use digest::{Digest, DigestEntry};
pub use types::{Membership, PingRsp, View, ViewId};
