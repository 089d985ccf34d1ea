//! Protocol Stack Orchestration
//!
//! Wires protocol layers into a pipeline and exposes it to the application.
//!
//! ## Architecture Overview
//! Layers are declared bottom-to-top. Each layer talks only to its two
//! neighbours through `pass_up` / `pass_down`. By default every layer gets a
//! private up queue and down queue, each drained by its own tokio task, so a
//! slow layer never blocks the layers around it. With `queued = false` events
//! are handed over inline instead (used by tests and tiny stacks).
//!
//! ## Submodules
//! - **`protocol`**: The `Protocol` contract and the `Links` a layer uses to reach its neighbours.
//! - **`stack`**: `ProtocolStack`, which validates, wires, starts and stops the layers.
//! - **`registry`**: Maps layer names (e.g. "NAKACK") to constructors.
//! - **`config`**: Serde-backed stack and layer configuration.
//! - **`channel`**: The application-facing handle (`connect`, `send`, `receive`, ...).
//! - **`errors`**: `StackError`, the error type shared by setup and channel operations.

pub mod channel;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod registry;
pub mod stack;

pub use channel::Channel;
pub use config::{LayerSpec, StackConfig};
pub use errors::StackError;
pub use protocol::{Direction, EventSink, Links, Protocol};
pub use registry::ProtocolRegistry;
pub use stack::ProtocolStack;


#[cfg(test)]
mod scenarios;
