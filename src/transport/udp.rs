//! UDP transport.
//!
//! One socket per stack. Outgoing datagrams go through an unbounded channel to
//! a sender task so `down` never blocks; a receiver task decodes incoming
//! datagrams and passes them up.

use super::Fanout;
use crate::message::{Address, Event, Message};
use crate::stack::Protocol;
use crate::stack::protocol::Links;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const NAME: &str = "UDP";

/// Largest payload of a single IPv4 UDP datagram.
const MAX_DATAGRAM: usize = 65507;

/// Room left for layer headers and for the XMIT_RSP bundle framing around a
/// retransmitted message.
const HEADER_RESERVE: usize = 4096;

/// Largest application payload accepted on top of UDP.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_RESERVE;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UdpConfig {
    pub bind_addr: SocketAddr,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

type Outgoing = mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>;

pub struct UdpTransport {
    config: UdpConfig,
    links: Arc<Links>,
    local_addr: RwLock<Option<Address>>,
    fanout: Fanout,
    outgoing: Mutex<Option<Outgoing>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(config: UdpConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            links: Links::new(NAME),
            local_addr: RwLock::new(None),
            fanout: Fanout::default(),
            outgoing: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Option<Address> {
        *self.local_addr.read().unwrap()
    }

    fn send(&self, mut msg: Message) {
        let Some(local) = self.local_addr() else {
            tracing::warn!("{}: not started, dropping message", NAME);
            return;
        };
        msg.src = Some(local);

        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("{}: failed to serialize message: {}", NAME, e);
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM {
            tracing::warn!(
                "{}: dropping message of {} bytes (max {})",
                NAME,
                bytes.len(),
                MAX_DATAGRAM
            );
            return;
        }

        let targets = match msg.dest {
            Some(dest) if !dest.is_multicast() => vec![dest],
            _ => self.fanout.targets(local),
        };

        let outgoing = self.outgoing.lock().unwrap().clone();
        let Some(outgoing) = outgoing else {
            return;
        };
        for target in targets {
            if outgoing.send((target.socket_addr(), bytes.clone())).is_err() {
                tracing::debug!("{}: sender task gone, dropping message to {}", NAME, target);
                return;
            }
        }
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        while let Some((target, bytes)) = rx.recv().await {
            if let Err(e) = socket.send_to(&bytes, target).await {
                tracing::warn!("{}: failed to send {} bytes to {}: {}", NAME, bytes.len(), target, e);
            }
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, links: Arc<Links>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => match Message::from_bytes(&buf[..len]) {
                    Ok(mut msg) => {
                        if msg.src.is_none() {
                            msg.src = Some(Address::from(src));
                        }
                        links.pass_up(Event::Msg(msg));
                    }
                    Err(e) => {
                        tracing::warn!("{}: failed to deserialize datagram from {}: {}", NAME, src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("{}: failed to receive UDP packet: {}", NAME, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Protocol for UdpTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn max_payload(&self) -> Option<usize> {
        Some(MAX_PAYLOAD)
    }

    fn start(&self) -> Result<()> {
        let socket = std::net::UdpSocket::bind(self.config.bind_addr)
            .with_context(|| format!("binding UDP socket to {}", self.config.bind_addr))?;
        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let local = Address::from(socket.local_addr()?);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outgoing.lock().unwrap() = Some(tx);
        *self.local_addr.write().unwrap() = Some(local);

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(tokio::spawn(Self::send_loop(socket.clone(), rx)));
            tasks.push(tokio::spawn(Self::receive_loop(socket, self.links.clone())));
        }

        tracing::info!("{}: listening on {}", NAME, local);
        self.pass_up(Event::SetLocalAddress(local));
        Ok(())
    }

    fn stop(&self) {
        self.outgoing.lock().unwrap().take();
        for task in self.tasks.lock().unwrap().drain(..) {
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
