//! Protocol Layers
//!
//! The layers a standard stack is assembled from, listed bottom-to-top in
//! their usual order.
//!
//! ## Layers
//! - **`ping`**: Discovery of initial members through a static host list.
//! - **`nakack`**: Reliable, per-sender FIFO multicast with negative acks.
//! - **`unicast`**: Reliable, FIFO point-to-point delivery with positive acks.
//! - **`stable`**: Gossip that finds out which messages everybody has, so NAKACK can drop them.
//! - **`gms`**: Group membership: joining, leaving, view installation, coordinator takeover.
//! - **`causal`**: Vector-clock causal ordering on top of everything else.

pub mod causal;
pub mod gms;
pub mod nakack;
pub mod ping;
pub mod stable;
pub mod unicast;
