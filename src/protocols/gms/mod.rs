//! GMS: group membership.
//!
//! Keeps every member's view of the group consistent. The first member
//! becomes coordinator; later members find it through discovery and send it a
//! JOIN_REQ. The coordinator serializes all membership changes, multicasts
//! each new view, and hands joiners the view plus a digest to start their
//! NAKACK windows from. Participants leave through the coordinator and take
//! over when the coordinator is suspected and they are next in line.
//!
//! ## Roles
//! The layer is a state machine over [`Role`]: `Client` (not a member),
//! `Participant` and `Coordinator`. All role data lives in one `GmsState`
//! behind a single lock; every role-specific handler lives in its own
//! submodule.
//!
//! ## Submodules
//! - **`client`**: Discovery, coordinator selection and the join loop.
//! - **`coord`**: JOIN/LEAVE handling and view computation on the coordinator.
//! - **`participant`**: Leaving, suspicion handling and coordinator takeover.
//! - **`header`**: `GmsHeader` and `JoinRsp`, the wire format.

mod client;
mod coord;
mod header;
mod participant;

pub use client::determine_coord;
pub use header::{GmsHeader, GmsType, JoinRsp};
pub use participant::would_be_coordinator;

use crate::membership::{Digest, Membership, PingRsp, View};
use crate::message::{Address, Event, EventType, Header, Message};
use crate::scheduler::Promise;
use crate::stack::Protocol;
use crate::stack::protocol::Links;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

pub const NAME: &str = "GMS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GmsConfig {
    /// How long a joiner waits for discovery results and for a JOIN_RSP (ms).
    pub join_timeout: u64,
    /// Pause between two join attempts (ms).
    pub join_retry_timeout: u64,
    /// How long a leaving participant waits for LEAVE_RSP (ms).
    pub leave_timeout: u64,
    /// How long the coordinator waits for NAKACK's digest (ms).
    pub digest_timeout: u64,
    /// How long a departing coordinator keeps running after casting its last view (ms).
    pub coord_leave_grace: u64,
    /// Never become coordinator of a new group; keep retrying discovery instead.
    pub disable_initial_coord: bool,
    /// Leave (and report `Exit`) when a view arrives that no longer contains us.
    pub shun: bool,
}

impl Default for GmsConfig {
    fn default() -> Self {
        Self {
            join_timeout: 5000,
            join_retry_timeout: 2000,
            leave_timeout: 5000,
            digest_timeout: 5000,
            coord_leave_grace: 500,
            disable_initial_coord: false,
            shun: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Participant { suspected: Vec<Address> },
    Coordinator { suspected: Vec<Address> },
}

impl Role {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Role::Coordinator { .. })
    }

    pub fn is_member(&self) -> bool {
        !matches!(self, Role::Client)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Participant { .. } => write!(f, "participant"),
            Role::Coordinator { .. } => write!(f, "coordinator"),
        }
    }
}

struct GmsState {
    local_addr: Option<Address>,
    group: Option<String>,
    view: Option<View>,
    members: Membership,
    /// Highest view id seen so far.
    ltime: u64,
    role: Role,
    joining: bool,
    leaving: bool,
}

impl GmsState {
    fn new() -> Self {
        Self {
            local_addr: None,
            group: None,
            view: None,
            members: Membership::new(),
            ltime: 0,
            role: Role::Client,
            joining: false,
            leaving: false,
        }
    }

    /// Back to a non-member; keeps the local address and logical time.
    fn become_client(&mut self) {
        self.view = None;
        self.members.clear();
        self.role = Role::Client;
        self.joining = false;
        self.leaving = false;
    }
}

enum Installed {
    /// Carries whether suspected members still have to be excluded.
    Yes(bool),
    Stale,
    Excluded,
}

pub struct Gms {
    config: GmsConfig,
    links: Arc<Links>,
    self_ref: Weak<Gms>,
    state: Mutex<GmsState>,
    /// Serializes view changes on the coordinator.
    view_lock: tokio::sync::Mutex<()>,
    initial_mbrs: Promise<Vec<PingRsp>>,
    join_rsp: Promise<JoinRsp>,
    leave_rsp: Promise<()>,
    digest: Promise<Digest>,
}

impl Gms {
    pub fn new(config: GmsConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            links: Links::new(NAME),
            self_ref: self_ref.clone(),
            state: Mutex::new(GmsState::new()),
            view_lock: tokio::sync::Mutex::new(()),
            initial_mbrs: Promise::new(),
            join_rsp: Promise::new(),
            leave_rsp: Promise::new(),
            digest: Promise::new(),
        })
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.state.lock().unwrap().local_addr
    }

    pub fn view(&self) -> Option<View> {
        self.state.lock().unwrap().view.clone()
    }

    pub fn role(&self) -> Role {
        self.state.lock().unwrap().role.clone()
    }

    pub fn members(&self) -> Vec<Address> {
        self.state.lock().unwrap().members.elements().to_vec()
    }

    pub fn group(&self) -> Option<String> {
        self.state.lock().unwrap().group.clone()
    }

    fn is_coordinator(&self) -> bool {
        self.state.lock().unwrap().role.is_coordinator()
    }

    /// Runs `task` on the current tokio runtime with a strong reference to us.
    fn spawn<F, Fut>(&self, what: &str, task: F)
    where
        F: FnOnce(Arc<Gms>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(gms) = self.self_ref.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task(gms));
            }
            Err(_) => tracing::error!("{}: cannot {} outside a tokio runtime", NAME, what),
        }
    }

    fn send_gms(&self, dest: Address, hdr: GmsHeader) {
        let mut msg = Message::unicast(dest, Vec::new());
        msg.put_header(NAME, Header::Gms(hdr));
        self.pass_down(Event::Msg(msg));
    }

    /// Makes `view` the current view if it is newer than ours and contains us.
    ///
    /// After installing, the member heading the view (ignoring suspected
    /// members) is coordinator and everybody else a participant. Returns
    /// whether the view was installed.
    pub(crate) fn install_view(&self, view: View) -> bool {
        let outcome = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;
            let Some(local) = st.local_addr else {
                tracing::warn!("{}: cannot install {} without a local address", NAME, view);
                return false;
            };

            if let Some(current) = &st.view
                && view.vid() <= current.vid()
            {
                Installed::Stale
            } else if !view.contains(&local) {
                Installed::Excluded
            } else {
                st.ltime = st.ltime.max(view.vid().id);
                st.members.set(view.members());
                st.view = Some(view.clone());

                let suspected = match &mut st.role {
                    Role::Client => Vec::new(),
                    Role::Participant { suspected } | Role::Coordinator { suspected } => {
                        suspected.retain(|m| view.contains(m));
                        std::mem::take(suspected)
                    }
                };
                let coordinator = would_be_coordinator(local, view.members(), &suspected);
                let exclude_suspects = coordinator && !suspected.is_empty();
                let was = st.role.clone();
                st.role = if coordinator {
                    Role::Coordinator { suspected }
                } else {
                    Role::Participant { suspected }
                };
                if coordinator && !was.is_coordinator() {
                    tracing::info!("{}: {} is now coordinator (was {})", NAME, local, was);
                }
                Installed::Yes(exclude_suspects)
            }
        };

        match outcome {
            Installed::Yes(exclude_suspects) => {
                tracing::info!("{}: installed view {}", NAME, view);
                self.pass_down(Event::ViewChange(view.clone()));
                self.pass_up(Event::ViewChange(view));
                if exclude_suspects {
                    self.spawn("exclude suspects", |gms| gms.exclude_suspects());
                }
                true
            }
            Installed::Stale => {
                tracing::debug!("{}: discarding view {}: not newer than the current one", NAME, view);
                false
            }
            Installed::Excluded => {
                tracing::warn!("{}: view {} does not contain us", NAME, view);
                let shun = {
                    let st = self.state.lock().unwrap();
                    self.config.shun && st.role.is_member() && !st.leaving
                };
                if shun {
                    self.shun();
                }
                false
            }
        }
    }

    /// Drops our membership after being excluded and tells the application.
    fn shun(&self) {
        let local = {
            let mut st = self.state.lock().unwrap();
            st.become_client();
            st.local_addr
        };

        tracing::warn!("{}: excluded from the group, leaving", NAME);
        if let Some(local) = local {
            self.pass_down(Event::Disconnect(local));
        }
        self.pass_up(Event::Exit);
    }

    fn handle_view_message(&self, view: View) {
        let (member, leaving) = {
            let st = self.state.lock().unwrap();
            (st.role.is_member(), st.leaving)
        };

        if !member || leaving {
            tracing::debug!("{}: ignoring view {} (not a member or leaving)", NAME, view);
            return;
        }
        self.install_view(view);
    }

    fn handle_gms_message(&self, src: Option<Address>, hdr: GmsHeader) {
        match hdr.kind {
            GmsType::JoinReq => match hdr.mbr.or(src) {
                Some(mbr) => self.spawn("handle JOIN_REQ", move |gms| gms.handle_join_request(mbr)),
                None => tracing::warn!("{}: JOIN_REQ without a member", NAME),
            },
            GmsType::JoinRsp => match hdr.join_rsp {
                Some(rsp) => self.join_rsp.set_result(rsp),
                None => tracing::warn!("{}: JOIN_RSP without a payload from {:?}", NAME, src),
            },
            GmsType::LeaveReq => match hdr.mbr.or(src) {
                Some(mbr) => {
                    self.spawn("handle LEAVE_REQ", move |gms| gms.handle_leave_request(mbr))
                }
                None => tracing::warn!("{}: LEAVE_REQ without a member", NAME),
            },
            GmsType::LeaveRsp => self.leave_rsp.set_result(()),
            GmsType::View => match hdr.view {
                Some(view) => self.handle_view_message(view),
                None => tracing::warn!("{}: VIEW message without a view from {:?}", NAME, src),
            },
        }
    }
}

impl Protocol for Gms {
    fn name(&self) -> &'static str {
        NAME
    }

    fn links(&self) -> &Arc<Links> {
        &self.links
    }

    fn provided_up_services(&self) -> Vec<EventType> {
        vec![EventType::FindInitialMbrsOk, EventType::GetDigestOk]
    }

    fn provided_down_services(&self) -> Vec<EventType> {
        vec![EventType::Connect, EventType::Disconnect]
    }

    fn required_down_services(&self) -> Vec<EventType> {
        vec![
            EventType::FindInitialMbrs,
            EventType::GetDigest,
            EventType::SetDigest,
        ]
    }

    fn up(&self, evt: Event) {
        match evt {
            Event::Msg(mut msg) => match msg.remove_header(NAME) {
                Some(Header::Gms(hdr)) => self.handle_gms_message(msg.src, hdr),
                Some(other) => {
                    tracing::warn!("{}: unexpected header under our name: {:?}", NAME, other)
                }
                None => self.pass_up(Event::Msg(msg)),
            },
            Event::SetLocalAddress(addr) => {
                self.state.lock().unwrap().local_addr = Some(addr);
                self.pass_up(Event::SetLocalAddress(addr));
            }
            Event::Suspect(mbr) => {
                self.handle_suspect(mbr);
                self.pass_up(Event::Suspect(mbr));
            }
            Event::Unsuspect(mbr) => {
                self.handle_unsuspect(mbr);
                self.pass_up(Event::Unsuspect(mbr));
            }
            Event::FindInitialMbrsOk(rsps) => self.initial_mbrs.set_result(rsps),
            Event::GetDigestOk(digest) => self.digest.set_result(digest),
            other => self.pass_up(other),
        }
    }

    fn down(&self, evt: Event) {
        match evt {
            Event::Connect(group) => {
                tracing::info!("{}: connecting to group '{}'", NAME, group);
                self.state.lock().unwrap().group = Some(group);
                self.spawn("join", |gms| gms.join());
            }
            Event::Disconnect(mbr) => self.spawn("leave", move |gms| gms.leave(mbr)),
            other => self.pass_down(other),
        }
    }
}
