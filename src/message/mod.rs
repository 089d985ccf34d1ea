//! Wire & Event Primitives
//!
//! The value types every protocol layer exchanges.
//!
//! ## Contents
//! - **`address`**: Endpoint identity (IP + port), totally ordered.
//! - **`event`**: The inter-layer signal. Every `up`/`down` call carries exactly one `Event`.
//! - **`message`**: Application payload plus the per-protocol header map.
//! - **`header`**: The closed set of protocol headers a `Message` may carry on the wire.

pub mod address;
pub mod event;
pub mod header;
pub mod message;

pub use address::Address;
pub use event::{Event, EventType};
pub use header::Header;
pub use message::Message;

/// Sequence numbers are signed: `-1` stands for "nothing sent/received yet".
pub type Seqno = i64;

#[cfg(test)]
mod tests;
