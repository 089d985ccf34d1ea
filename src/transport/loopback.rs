//! In-process transport.
//!
//! A [`LoopbackNetwork`] connects any number of [`LoopbackTransport`]s inside
//! one process. Messages are serialized on send and decoded on receipt just
//! like on a real wire. The network can drop a share of the traffic and
//! delay each message by a random amount, which reorders them, so the
//! reliability layers can be exercised deterministically enough for tests.

use super::Fanout;
use crate::message::{Address, Event, Message};
use crate::stack::Protocol;
use crate::stack::protocol::Links;

use anyhow::Result;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const NAME: &str = "LOOPBACK";

const FIRST_PORT: u16 = 7800;

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    drop_rate: f64,
    max_delay: Duration,
}

pub struct LoopbackNetwork {
    endpoints: DashMap<Address, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: DashSet<Address>,
    faults: RwLock<Faults>,
    next_port: AtomicU16,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_faults(0.0, Duration::ZERO)
    }

    /// `drop_rate` in `[0, 1]` applies to every message between two different
    /// endpoints. Each message is delayed by a random duration up to `max_delay`.
    pub fn with_faults(drop_rate: f64, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            isolated: DashSet::new(),
            faults: RwLock::new(Faults {
                drop_rate: drop_rate.clamp(0.0, 1.0),
                max_delay,
            }),
            next_port: AtomicU16::new(FIRST_PORT),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.faults.write().unwrap().drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    pub fn set_max_delay(&self, max_delay: Duration) {
        self.faults.write().unwrap().max_delay = max_delay;
    }

    /// Cuts `addr` off: nothing it sends or is sent arrives anymore.
    pub fn isolate(&self, addr: Address) {
        self.isolated.insert(addr);
    }

    pub fn heal(&self, addr: &Address) {
        self.isolated.remove(addr);
    }

    pub fn allocate_address(&self) -> Address {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        Address::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn register(&self, addr: Address, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.endpoints.insert(addr, tx);
    }

    fn unregister(&self, addr: &Address) {
        self.endpoints.remove(addr);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: Address, to: Address, bytes: Vec<u8>) {
        if self.isolated.contains(&from) || self.isolated.contains(&to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let faults = *self.faults.read().unwrap();
        let mut rng = rand::thread_rng();
        if from != to && faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate) {
            tracing::trace!("{}: dropping message {} -> {}", NAME, from, to);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(tx) = self.endpoints.get(&to).map(|entry| entry.value().clone()) else {
            tracing::trace!("{}: no endpoint at {}", NAME, to);
            return;
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);

        if faults.max_delay.is_zero() {
            let _ = tx.send(bytes);
            return;
        }

        let delay = rng.gen_range(Duration::ZERO..=faults.max_delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(bytes);
        });
    }
}

pub struct LoopbackTransport {
    links: Arc<Links>,
    network: Arc<LoopbackNetwork>,
    local: Address,
    fanout: Fanout,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new(network: Arc<LoopbackNetwork>) -> Arc<Self> {
        let local = network.allocate_address();
        Arc::new(Self {
            links: Links::new(NAME),
            network,
            local,
            fanout: Fanout::default(),
            task: Mutex::new(None),
        })
    }

    /// Known before `start`, so discovery can be configured up front.
    pub fn local_addr(&self) -> Address {
        self.local
    }

    /// Passes `evt` up as if it came from below the transport, e.g. a
    /// `Suspect` raised by a failure detector.
    pub fn raise(&self, evt: Event) {
        self.pass_up(evt);
    }

    fn send(&self, mut msg: Message) {
        msg.src = Some(self.local);
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{}: failed to serialize message: {}", NAME, e);
                return;
            }
        };

        match msg.dest {
            Some(dest) if !dest.is_multicast() => self.network.deliver(self.local, dest, bytes),
            _ => {
                for target in self.fanout.targets(self.local) {
                    self.network.deliver(self.local, target, bytes.clone());
                }
            }
        }
    }
}

impl Protocol for LoopbackTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.network.register(self.local, tx);

        let links = self.links.clone();
        let handle = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                match Message::from_bytes(&bytes) {
                    Ok(msg) => links.pass_up(Event::Msg(msg)),
                    Err(e) => tracing::warn!("{}: failed to decode message: {}", NAME, e),
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);

        tracing::debug!("{}: endpoint {} up", NAME, self.local);
        self.pass_up(Event::SetLocalAddress(self.local));
        Ok(())
    }

    fn stop(&self) {
        self.network.unregister(&self.local);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.fanout.clear();
    }

    fn up(&self, evt: Event) {
        self.pass_up(evt);
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Msg(msg) => self.send(msg),
            Event::ViewChange(view) => self.fanout.set_view(&view),
            Event::TmpView(view) => self.fanout.add_tmp_view(&view),
            Event::Disconnect(_) => self.fanout.clear(),
            other => tracing::trace!("{}: ignoring {:?}", NAME, other.kind()),
        }
    }
}
