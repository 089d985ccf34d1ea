//! PING: discovery of the initial members.
//!
//! On `FindInitialMbrs` a GET_MBRS_REQ is sent to every configured host. Each
//! running stack answers with its own address, the coordinator it knows of
//! and whether it is already a group member. Responses are collected until
//! `num_initial_members` have arrived or `timeout` expires, then passed up as
//! `FindInitialMbrsOk`.

use crate::membership::PingRsp;
use crate::message::{Address, Event, EventType, Header, Message};
use crate::stack::Protocol;
use crate::stack::config::millis;
use crate::stack::protocol::Links;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Notify;

pub const NAME: &str = "PING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingType {
    GetMbrsReq,
    GetMbrsRsp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingHeader {
    pub kind: PingType,
    pub rsp: Option<PingRsp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PingConfig {
    pub initial_hosts: Vec<SocketAddr>,
    /// How long to collect responses (ms).
    pub timeout: u64,
    /// Stop collecting early once this many responses arrived.
    pub num_initial_members: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            initial_hosts: Vec::new(),
            timeout: 3000,
            num_initial_members: 2,
        }
    }
}

pub struct Ping {
    config: PingConfig,
    links: Arc<Links>,
    self_ref: Weak<Ping>,
    local_addr: RwLock<Option<Address>>,
    coord: RwLock<Option<Address>>,
    is_server: AtomicBool,
    responses: Mutex<Vec<PingRsp>>,
    arrived: Notify,
}

impl Ping {
    pub fn new(config: PingConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            links: Links::new(NAME),
            self_ref: self_ref.clone(),
            local_addr: RwLock::new(None),
            coord: RwLock::new(None),
            is_server: AtomicBool::new(false),
            responses: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        })
    }

    fn local_addr(&self) -> Option<Address> {
        *self.local_addr.read().unwrap()
    }

    fn own_response(&self) -> Option<PingRsp> {
        let own_addr = self.local_addr()?;
        let is_server = self.is_server.load(Ordering::SeqCst);
        Some(PingRsp {
            own_addr,
            coord_addr: if is_server {
                *self.coord.read().unwrap()
            } else {
                None
            },
            is_server,
        })
    }

    fn start_discovery(&self) {
        let Some(ping) = self.self_ref.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { ping.find_initial_members().await });
            }
            Err(_) => tracing::error!("{}: cannot run discovery outside a tokio runtime", NAME),
        }
    }

    async fn find_initial_members(self: Arc<Self>) {
        self.responses.lock().unwrap().clear();
        let local = self.local_addr();

        let mut sent = 0;
        for host in &self.config.initial_hosts {
            let dest = Address::from(*host);
            if Some(dest) == local {
                continue;
            }
            let mut msg = Message::unicast(dest, Vec::new());
            msg.put_header(
                NAME,
                Header::Ping(PingHeader {
                    kind: PingType::GetMbrsReq,
                    rsp: None,
                }),
            );
            self.pass_down(Event::Msg(msg));
            sent += 1;
        }

        if sent > 0 {
            let deadline = tokio::time::Instant::now() + millis(self.config.timeout);
            loop {
                let notified = self.arrived.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.responses.lock().unwrap().len() >= self.config.num_initial_members {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
        }

        let rsps = self.responses.lock().unwrap().clone();
        tracing::debug!("{}: discovery found {} member(s): {:?}", NAME, rsps.len(), rsps);
        self.pass_up(Event::FindInitialMbrsOk(rsps));
    }

    fn handle_request(&self, requester: Address) {
        let Some(rsp) = self.own_response() else {
            return;
        };
        let mut msg = Message::new(Some(requester), Some(rsp.own_addr), Vec::new());
        msg.put_header(
            NAME,
            Header::Ping(PingHeader {
                kind: PingType::GetMbrsRsp,
                rsp: Some(rsp),
            }),
        );
        self.pass_down(Event::Msg(msg));
    }

    fn handle_response(&self, rsp: PingRsp) {
        {
            let mut responses = self.responses.lock().unwrap();
            if responses.iter().any(|r| r.own_addr == rsp.own_addr) {
                return;
            }
            responses.push(rsp);
        }
        self.arrived.notify_waiters();
    }
}

impl Protocol for Ping {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn provided_down_services(&self) -> Vec<EventType> {
        vec![EventType::FindInitialMbrs]
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::Ping(hdr)) => match hdr.kind {
                    PingType::GetMbrsReq => match msg.src {
                        Some(requester) => self.handle_request(requester),
                        None => tracing::warn!("{}: GET_MBRS_REQ without a sender", NAME),
                    },
                    PingType::GetMbrsRsp => match hdr.rsp {
                        Some(rsp) => self.handle_response(rsp),
                        None => tracing::warn!("{}: empty GET_MBRS_RSP from {:?}", NAME, msg.src),
                    },
                },
                Some(other) => {
                    tracing::warn!("{}: unexpected header under our name: {:?}", NAME, other)
                }
                None => self.pass_up(Event::Msg(msg)),
            },
            Event::SetLocalAddress(addr) => {
                *self.local_addr.write().unwrap() = Some(addr);
                self.pass_up(Event::SetLocalAddress(addr));
            }
            other => self.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::FindInitialMbrs => self.start_discovery(),
            Event::BecomeServer => {
                self.is_server.store(true, Ordering::SeqCst);
                self.pass_down(Event::BecomeServer);
            }
            Event::ViewChange(view) => {
                *self.coord.write().unwrap() = view.coordinator();
                self.pass_down(Event::ViewChange(view));
            }
            Event::Disconnect(addr) => {
                self.is_server.store(false, Ordering::SeqCst);
                *self.coord.write().unwrap() = None;
                self.pass_down(Event::Disconnect(addr));
            }
            other => self.pass_down(other),
        }
    }
}
