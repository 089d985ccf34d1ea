//! Group Communication Library
//!
//! Reliable group communication over unreliable datagrams. An application
//! opens a `Channel` on a stack of protocol layers, joins a named group and
//! gets totally consistent membership views, reliable FIFO multicast and
//! unicast, stability-driven garbage collection and causal ordering.
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems:
//!
//! - **`message`**: Addresses, messages with per-layer headers, and the events
//!   that travel up and down the stack.
//! - **`membership`**: Views, view ids, member lists and the per-sender seqno
//!   digests exchanged between layers.
//! - **`scheduler`**: Timer-driven task runner, closable queues and promises.
//! - **`retransmission`**: Sender/receiver windows and the retransmitter that
//!   backs the reliable layers.
//! - **`stack`**: The `Protocol` contract, stack wiring, configuration, the
//!   layer registry and the application-facing `Channel`.
//! - **`protocols`**: PING, NAKACK, UNICAST, STABLE, GMS and CAUSAL.
//! - **`transport`**: UDP and an in-process loopback network.

pub mod membership;
pub mod message;
pub mod protocols;
pub mod retransmission;
pub mod scheduler;
pub mod stack;
pub mod transport;
