//! Application-facing handle on a protocol stack.
//!
//! A `Channel` owns the stack, sits above its top layer and turns the event
//! stream into a small API: connect to a group, send, receive the next
//! message/view/suspicion, disconnect.

use super::config::StackConfig;
use super::errors::StackError;
use super::protocol::{EventSink, Protocol};
use super::registry::ProtocolRegistry;
use super::stack::ProtocolStack;
use crate::membership::View;
use crate::message::{Address, Event, Message};
use crate::scheduler::{Promise, Queue, TimeScheduler};

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// State shared between the channel and the sink the top layer delivers into.
struct ChannelState {
    local_addr: RwLock<Option<Address>>,
    view: RwLock<Option<View>>,
    connected: AtomicBool,
    inbox: Queue<Event>,
    address_ready: Promise<Address>,
    connect_ok: Promise<()>,
    disconnect_ok: Promise<()>,
}

/// Receives everything the top layer passes up.
struct Upcall {
    state: Arc<ChannelState>,
}

impl EventSink for Upcall {
    fn handle(&self, evt: Event) -> Result<(), StackError> {
        match evt {
            Event::SetLocalAddress(addr) => {
                *self.state.local_addr.write().unwrap() = Some(addr);
                self.state.address_ready.set_result(addr);
                Ok(())
            }
            Event::ConnectOk => {
                self.state.connect_ok.set_result(());
                Ok(())
            }
            Event::DisconnectOk => {
                self.state.disconnect_ok.set_result(());
                Ok(())
            }
            Event::ViewChange(view) => {
                *self.state.view.write().unwrap() = Some(view.clone());
                self.state.inbox.add(Event::ViewChange(view))?;
                Ok(())
            }
            Event::Exit => {
                tracing::warn!("Excluded from the group");
                self.state.connected.store(false, Ordering::SeqCst);
                *self.state.view.write().unwrap() = None;
                self.state.inbox.add(Event::Exit)?;
                Ok(())
            }
            evt @ (Event::Msg(_) | Event::Suspect(_) | Event::Unsuspect(_)) => {
                self.state.inbox.add(evt)?;
                Ok(())
            }
            other => {
                tracing::trace!("Channel ignoring {:?}", other.kind());
                Ok(())
            }
        }
    }
}

pub struct Channel {
    stack: ProtocolStack,
    state: Arc<ChannelState>,
    closed: AtomicBool,
    timeout: Duration,
}

impl Channel {
    /// Builds a channel from a configuration using the given registry.
    pub fn new(config: &StackConfig, registry: &ProtocolRegistry) -> Result<Self> {
        let scheduler = TimeScheduler::new();
        let layers = registry.create_all(config, &scheduler)?;
        Self::from_layers(layers, scheduler, config.queued, config.connect_timeout())
    }

    /// Builds a channel from already constructed layers (bottom first).
    pub fn from_layers(
        layers: Vec<Arc<dyn Protocol>>,
        scheduler: Arc<TimeScheduler>,
        queued: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let stack = ProtocolStack::new(layers, scheduler, queued)?;

        Ok(Self {
            stack,
            state: Arc::new(ChannelState {
                local_addr: RwLock::new(None),
                view: RwLock::new(None),
                connected: AtomicBool::new(false),
                inbox: Queue::new(),
                address_ready: Promise::new(),
                connect_ok: Promise::new(),
                disconnect_ok: Promise::new(),
            }),
            closed: AtomicBool::new(false),
            timeout,
        })
    }

    /// Starts the stack if needed and joins `group`. Returns once a view that
    /// contains this member has been installed.
    pub async fn connect(&self, group: &str) -> Result<(), StackError> {
        self.ensure_open()?;
        if self.is_connected() {
            return Ok(());
        }

        let upcall = Arc::new(Upcall {
            state: self.state.clone(),
        });
        self.stack.start(upcall).map_err(|e| {
            tracing::error!("Failed to start protocol stack: {}", e);
            StackError::Closed
        })?;

        self.state
            .address_ready
            .get_result(self.timeout)
            .await
            .ok_or(StackError::Timeout("local address"))?;

        tracing::info!("Connecting to group '{}'", group);
        self.state.connect_ok.reset();
        self.stack.down(Event::Connect(group.to_string()))?;

        self.state
            .connect_ok
            .get_result(self.timeout)
            .await
            .ok_or(StackError::Timeout("CONNECT_OK"))?;

        self.state.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to group '{}' as {:?}", group, self.local_address());
        Ok(())
    }

    pub fn send(&self, msg: Message) -> Result<(), StackError> {
        self.ensure_open()?;
        if !self.is_connected() {
            return Err(StackError::NotConnected);
        }
        // an oversized message would take a seqno and then never arrive
        if let Some(max) = self.stack.max_payload()
            && msg.payload.len() > max
        {
            return Err(StackError::MessageTooLarge {
                size: msg.payload.len(),
                max,
            });
        }
        self.stack.down(Event::Msg(msg))
    }

    /// Sends `payload` to `dest`, or to the whole group when `dest` is `None`.
    pub fn send_to(&self, dest: Option<Address>, payload: Vec<u8>) -> Result<(), StackError> {
        self.send(Message::new(dest, self.local_address(), payload))
    }

    /// Next message, view, suspicion or exit notification. `Ok(None)` on timeout.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Event>, StackError> {
        Ok(self.state.inbox.remove_timeout(timeout).await?)
    }

    /// Leaves the group. The stack stays up, so `connect` may be called again.
    pub async fn disconnect(&self) -> Result<(), StackError> {
        if !self.is_connected() {
            return Ok(());
        }
        let local = self.local_address().ok_or(StackError::NotConnected)?;

        self.state.disconnect_ok.reset();
        self.stack.down(Event::Disconnect(local))?;

        if self
            .state
            .disconnect_ok
            .get_result(self.timeout)
            .await
            .is_none()
        {
            tracing::warn!("No DISCONNECT_OK within {:?}, leaving anyway", self.timeout);
        }

        self.state.connected.store(false, Ordering::SeqCst);
        *self.state.view.write().unwrap() = None;
        Ok(())
    }

    /// Disconnects, stops every layer and closes the inbox. Further calls fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.disconnect().await {
            tracing::debug!("Disconnect during close failed: {}", e);
        }
        self.closed.store(true, Ordering::SeqCst);
        self.stack.stop();
        self.state.inbox.close(false);
    }

    pub fn local_address(&self) -> Option<Address> {
        *self.state.local_addr.read().unwrap()
    }

    pub fn view(&self) -> Option<View> {
        self.state.view.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stack(&self) -> &ProtocolStack {
        &self.stack
    }

    fn ensure_open(&self) -> Result<(), StackError> {
        if self.is_closed() {
            Err(StackError::Closed)
        } else {
            Ok(())
        }
    }
}
