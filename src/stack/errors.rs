use crate::message::EventType;
use crate::scheduler::QueueClosed;

/// Errors surfaced by stack setup and by channel operations.
///
/// Configuration errors (`UnknownProtocol`, `InvalidProperties`,
/// `DuplicateLayer`, `MissingService`, `EmptyStack`) only ever occur while
/// the stack is being built. `Closed` is the ordinary, non-fatal answer to an
/// operation on something that has been shut down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StackError {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("invalid properties for {layer}: {reason}")]
    InvalidProperties { layer: String, reason: String },

    #[error("duplicate layer '{0}'")]
    DuplicateLayer(String),

    #[error("{layer} requires {event:?} to be provided by a layer {side} it")]
    MissingService {
        layer: String,
        event: EventType,
        side: &'static str,
    },

    #[error("protocol stack has no layers")]
    EmptyStack,

    #[error("channel is closed")]
    Closed,

    #[error("channel is not connected")]
    NotConnected,

    #[error("payload of {size} bytes exceeds the transport limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl From<QueueClosed> for StackError {
    fn from(_: QueueClosed) -> Self {
        StackError::Closed
    }
}
