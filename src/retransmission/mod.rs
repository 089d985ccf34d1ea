//! Retransmission Primitives
//!
//! Generic loss-recovery building blocks shared by NAKACK and UNICAST.
//!
//! ## Submodules
//! - **`retransmitter`**: Tracks missing seqno ranges per peer and fires a caller-supplied
//!   command with increasing backoff until every seqno has been removed.
//! - **`ack_sender_window`**: Sender side of ack-based delivery. Keeps sent messages until
//!   acked, optionally throttled by a sliding window.
//! - **`ack_receiver_window`**: Receiver side of ack-based delivery. Reorders by seqno.
//! - **`nak_receiver_window`**: Receiver side of NAK-based multicast. Detects gaps and asks
//!   the retransmitter to recover them.

pub mod ack_receiver_window;
pub mod ack_sender_window;
pub mod nak_receiver_window;
pub mod retransmitter;

pub use ack_receiver_window::AckReceiverWindow;
pub use ack_sender_window::{AckSenderWindow, ResendFn};
pub use nak_receiver_window::NakReceiverWindow;
pub use retransmitter::{RetransmitCommand, Retransmitter};

#[cfg(test)]
mod tests;
