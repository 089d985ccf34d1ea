use super::errors::StackError;
use crate::message::{Event, EventType};
use crate::scheduler::Queue;

use std::sync::{Arc, RwLock};

/// Anything that can accept an event: the next layer (inline or through its
/// queue) or the application on top of the stack.
pub trait EventSink: Send + Sync {
    fn handle(&self, evt: Event) -> Result<(), StackError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A layer's connections to its neighbours, set by the stack when it is wired.
///
/// Kept behind an `Arc` so timer callbacks (retransmission, gossip) can send
/// events without holding a reference to the layer itself.
pub struct Links {
    layer: &'static str,
    up: RwLock<Option<Arc<dyn EventSink>>>,
    down: RwLock<Option<Arc<dyn EventSink>>>,
}

impl Links {
    pub fn new(layer: &'static str) -> Arc<Self> {
        Arc::new(Self {
            layer,
            up: RwLock::new(None),
            down: RwLock::new(None),
        })
    }

    pub fn set_up(&self, sink: Arc<dyn EventSink>) {
        *self.up.write().unwrap() = Some(sink);
    }

    pub fn set_down(&self, sink: Arc<dyn EventSink>) {
        *self.down.write().unwrap() = Some(sink);
    }

    pub fn clear(&self) {
        *self.up.write().unwrap() = None;
        *self.down.write().unwrap() = None;
    }

    pub fn try_pass_up(&self, evt: Event) -> Result<(), StackError> {
        let sink = self.up.read().unwrap().clone();
        match sink {
            Some(sink) => sink.handle(evt),
            None => Err(StackError::NotConnected),
        }
    }

    pub fn try_pass_down(&self, evt: Event) -> Result<(), StackError> {
        let sink = self.down.read().unwrap().clone();
        match sink {
            Some(sink) => sink.handle(evt),
            None => Err(StackError::NotConnected),
        }
    }

    pub fn pass_up(&self, evt: Event) {
        let kind = evt.kind();
        if let Err(e) = self.try_pass_up(evt) {
            tracing::debug!("{}: dropped {:?} going up: {}", self.layer, kind, e);
        }
    }

    pub fn pass_down(&self, evt: Event) {
        let kind = evt.kind();
        if let Err(e) = self.try_pass_down(evt) {
            tracing::debug!("{}: dropped {:?} going down: {}", self.layer, kind, e);
        }
    }
}

/// The contract every layer implements.
///
/// `up` receives events from the layer below, `down` from the layer above.
/// A layer either consumes an event or forwards it (possibly transformed)
/// with `pass_up` / `pass_down`. Implementations must not hold their own
/// locks while passing events on: with inline wiring the neighbour runs on
/// the same call stack.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn links(&self) -> &Arc<Links>;

    fn up(&self, evt: Event);

    fn down(&self, evt: Event);

    /// Called once the whole stack is wired, top layer first.
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    /// Largest application payload this layer can carry, if it has a limit.
    /// Only the bottom layer's answer is used.
    fn max_payload(&self) -> Option<usize> {
        None
    }

    /// Events this layer handles when they come up from below.
    fn provided_up_services(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// Events this layer handles when they come down from above.
    fn provided_down_services(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// Events this layer sends up that some layer above must handle.
    fn required_up_services(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// Events this layer sends down that some layer below must handle.
    fn required_down_services(&self) -> Vec<EventType> {
        Vec::new()
    }

    fn pass_up(&self, evt: Event) {
        self.links().pass_up(evt);
    }

    fn pass_down(&self, evt: Event) {
        self.links().pass_down(evt);
    }
}

/// Hands events straight to the neighbour on the caller's task.
pub(crate) struct InlineSink {
    pub target: Arc<dyn Protocol>,
    pub direction: Direction,
}

impl EventSink for InlineSink {
    fn handle(&self, evt: Event) -> Result<(), StackError> {
        match self.direction {
            Direction::Up => self.target.up(evt),
            Direction::Down => self.target.down(evt),
        }
        Ok(())
    }
}

/// Enqueues events for the neighbour's worker task.
pub(crate) struct QueuedSink {
    pub queue: Arc<Queue<Event>>,
}

impl EventSink for QueuedSink {
    fn handle(&self, evt: Event) -> Result<(), StackError> {
        self.queue.add(evt).map_err(StackError::from)
    }
}
