//! Protocol Stack
//!
//! Validates a list of layers, wires each one to its neighbours and runs the
//! per-layer workers.
//!
//! ## Responsibilities
//! - **Validation**: Duplicate names and unmet service requirements fail here, never at runtime.
//! - **Wiring**: Bottom-to-top in declaration order; the application sink sits above the top layer.
//! - **Workers**: One tokio task per layer and direction draining that layer's queue.
//! - **Lifecycle**: Starts layers top-down (so the transport's `SetLocalAddress`
//!   finds everybody ready) and stops them the same way.

use super::errors::StackError;
use super::protocol::{Direction, EventSink, InlineSink, Protocol, QueuedSink};
use crate::message::Event;
use crate::scheduler::{Queue, TimeScheduler};

use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

pub struct ProtocolStack {
    /// Bottom (transport) first.
    layers: Vec<Arc<dyn Protocol>>,
    queued: bool,
    scheduler: Arc<TimeScheduler>,
    entry: RwLock<Option<Arc<dyn EventSink>>>,
    queues: Mutex<Vec<Arc<Queue<Event>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProtocolStack {
    pub fn new(
        layers: Vec<Arc<dyn Protocol>>,
        scheduler: Arc<TimeScheduler>,
        queued: bool,
    ) -> Result<Self, StackError> {
        Self::validate(&layers)?;

        Ok(Self {
            layers,
            queued,
            scheduler,
            entry: RwLock::new(None),
            queues: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Checks names and that every required service is provided on the correct side.
    pub fn validate(layers: &[Arc<dyn Protocol>]) -> Result<(), StackError> {
        if layers.is_empty() {
            return Err(StackError::EmptyStack);
        }

        let mut names = HashSet::new();
        for layer in layers {
            if !names.insert(layer.name()) {
                return Err(StackError::DuplicateLayer(layer.name().to_string()));
            }
        }

        for (index, layer) in layers.iter().enumerate() {
            for event in layer.required_down_services() {
                let provided = layers[..index]
                    .iter()
                    .any(|below| below.provided_down_services().contains(&event));
                if !provided {
                    return Err(StackError::MissingService {
                        layer: layer.name().to_string(),
                        event,
                        side: "below",
                    });
                }
            }

            for event in layer.required_up_services() {
                let provided = layers[index + 1..]
                    .iter()
                    .any(|above| above.provided_up_services().contains(&event));
                if !provided {
                    return Err(StackError::MissingService {
                        layer: layer.name().to_string(),
                        event,
                        side: "above",
                    });
                }
            }
        }

        Ok(())
    }

    /// Wires the layers, connects the top one to `application` and starts everything.
    /// Calling it again on a started stack is a no-op.
    pub fn start(&self, application: Arc<dyn EventSink>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut up_sinks: Vec<Arc<dyn EventSink>> = Vec::with_capacity(self.layers.len());
        let mut down_sinks: Vec<Arc<dyn EventSink>> = Vec::with_capacity(self.layers.len());

        for layer in self.layers.iter() {
            if self.queued {
                up_sinks.push(self.spawn_worker(layer.clone(), Direction::Up));
                down_sinks.push(self.spawn_worker(layer.clone(), Direction::Down));
            } else {
                up_sinks.push(Arc::new(InlineSink {
                    target: layer.clone(),
                    direction: Direction::Up,
                }));
                down_sinks.push(Arc::new(InlineSink {
                    target: layer.clone(),
                    direction: Direction::Down,
                }));
            }
        }

        let top = self.layers.len() - 1;
        for (index, layer) in self.layers.iter().enumerate() {
            let links = layer.links();
            if index == top {
                links.set_up(application.clone());
            } else {
                links.set_up(up_sinks[index + 1].clone());
            }
            if index > 0 {
                links.set_down(down_sinks[index - 1].clone());
            }
        }

        *self.entry.write().unwrap() = Some(down_sinks[top].clone());

        tracing::info!("Starting protocol stack {}", self.protocol_spec());

        for layer in self.layers.iter().rev() {
            layer.start()?;
            tracing::debug!("Started layer {}", layer.name());
        }

        Ok(())
    }

    fn spawn_worker(&self, layer: Arc<dyn Protocol>, direction: Direction) -> Arc<dyn EventSink> {
        let queue = Arc::new(Queue::new());
        self.queues.lock().unwrap().push(queue.clone());

        let worker_queue = queue.clone();
        let handle = tokio::spawn(async move {
            Self::worker_loop(layer, direction, worker_queue).await;
        });
        self.workers.lock().unwrap().push(handle);

        Arc::new(QueuedSink { queue })
    }

    /// Drains one layer's queue in FIFO order until the queue is closed.
    async fn worker_loop(layer: Arc<dyn Protocol>, direction: Direction, queue: Arc<Queue<Event>>) {
        tracing::trace!("{} {:?} worker started", layer.name(), direction);

        loop {
            match queue.remove().await {
                Ok(evt) => match direction {
                    Direction::Up => layer.up(evt),
                    Direction::Down => layer.down(evt),
                },
                Err(_) => break,
            }
        }

        tracing::trace!("{} {:?} worker stopped", layer.name(), direction);
    }

    /// Sends an event into the top layer's down path.
    pub fn down(&self, evt: Event) -> Result<(), StackError> {
        let entry = self.entry.read().unwrap().clone();
        match entry {
            Some(entry) => entry.handle(evt),
            None => Err(StackError::NotConnected),
        }
    }

    /// Payload limit of the transport at the bottom of the stack.
    pub fn max_payload(&self) -> Option<usize> {
        self.layers.first().and_then(|bottom| bottom.max_payload())
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        for layer in self.layers.iter().rev() {
            layer.stop();
        }

        for queue in self.queues.lock().unwrap().drain(..) {
            queue.close(false);
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
        for layer in self.layers.iter() {
            layer.links().clear();
        }
        *self.entry.write().unwrap() = None;
        self.scheduler.stop();

        tracing::info!("Protocol stack stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn layers(&self) -> &[Arc<dyn Protocol>] {
        &self.layers
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.layers.iter().find(|l| l.name() == name).cloned()
    }

    pub fn scheduler(&self) -> &Arc<TimeScheduler> {
        &self.scheduler
    }

    pub fn protocol_spec(&self) -> String {
        self.layers
            .iter()
            .map(|l| l.name())
            .collect::<Vec<_>>()
            .join(":")
    }
}
