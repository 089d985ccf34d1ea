//! Concurrency Primitives
//!
//! The building blocks every timer- or queue-driven layer relies on.
//!
//! ## Submodules
//! - **`time_scheduler`**: A single worker that runs dynamically rescheduled tasks
//!   (retransmission entries, gossip rounds). Suspends itself when idle.
//! - **`queue`**: A closable FIFO drained by a layer's up/down worker.
//! - **`promise`**: Single-shot result slot that wakes every waiter (join responses,
//!   digest fetches, discovery results).

pub mod promise;
pub mod queue;
pub mod time_scheduler;

pub use promise::Promise;
pub use queue::{Queue, QueueClosed};
pub use time_scheduler::{TimeScheduler, TimedTask};
