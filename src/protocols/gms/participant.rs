use super::header::GmsHeader;
use super::{Gms, NAME, Role};
use crate::message::{Address, Event};
use crate::stack::Protocol;
use crate::stack::config::millis;

use std::sync::Arc;

const MAX_LEAVE_ATTEMPTS: usize = 3;

/// True if `local` heads `members` once the suspected ones are skipped.
pub fn would_be_coordinator(local: Address, members: &[Address], suspected: &[Address]) -> bool {
    members.iter().find(|m| !suspected.contains(m)) == Some(&local)
}

impl Gms {
    pub(super) fn handle_suspect(&self, mbr: Address) {
        let exclude = {
            let mut guard = self.state.lock().unwrap();
            let st = &mut *guard;

            if Some(mbr) == st.local_addr {
                tracing::warn!("{}: we are suspected ourselves, ignoring", NAME);
                false
            } else if !st.members.contains(&mbr) {
                false
            } else {
                match &mut st.role {
                    Role::Client => false,
                    Role::Coordinator { suspected } => {
                        if !suspected.contains(&mbr) {
                            suspected.push(mbr);
                        }
                        true
                    }
                    Role::Participant { suspected } => {
                        if !suspected.contains(&mbr) {
                            suspected.push(mbr);
                        }
                        let takeover = st.local_addr.is_some_and(|local| {
                            would_be_coordinator(local, st.members.elements(), suspected)
                        });
                        if takeover {
                            let suspected = std::mem::take(suspected);
                            tracing::info!(
                                "{}: suspected {:?} include the coordinator, taking over",
                                NAME,
                                suspected
                            );
                            st.role = Role::Coordinator { suspected };
                        }
                        takeover
                    }
                }
            }
        };

        if exclude {
            self.spawn("exclude suspects", |gms| gms.exclude_suspects());
        }
    }

    pub(super) fn handle_unsuspect(&self, mbr: Address) {
        let mut st = self.state.lock().unwrap();
        if let Role::Participant { suspected } | Role::Coordinator { suspected } = &mut st.role {
            suspected.retain(|m| *m != mbr);
        }
    }

    /// Leaves the group in whatever role we have, then reports `DisconnectOk`.
    pub(super) async fn leave(self: Arc<Self>, local: Address) {
        let role = {
            let mut st = self.state.lock().unwrap();
            st.joining = false;
            if st.role.is_member() {
                st.leaving = true;
            }
            st.role.clone()
        };

        match role {
            Role::Client => tracing::debug!("{}: not a member, nothing to leave", NAME),
            Role::Coordinator { .. } => self.leave_as_coordinator(local).await,
            Role::Participant { .. } => self.leave_as_participant(local).await,
        }

        self.state.lock().unwrap().become_client();
        tracing::info!("{}: {} left the group", NAME, local);
        self.pass_down(Event::Disconnect(local));
        self.pass_up(Event::DisconnectOk);
    }

    fn current_coordinator(&self, local: Address) -> Option<Address> {
        let st = self.state.lock().unwrap();
        let suspected: &[Address] = match &st.role {
            Role::Participant { suspected } | Role::Coordinator { suspected } => suspected,
            Role::Client => &[],
        };
        st.members
            .elements()
            .iter()
            .find(|m| **m != local && !suspected.contains(m))
            .copied()
    }

    async fn leave_as_participant(&self, local: Address) {
        let timeout = millis(self.config.leave_timeout);

        for attempt in 1..=MAX_LEAVE_ATTEMPTS {
            let Some(coord) = self.current_coordinator(local) else {
                break;
            };

            tracing::info!("{}: sending LEAVE_REQ to {} (attempt {})", NAME, coord, attempt);
            self.leave_rsp.reset();
            self.send_gms(coord, GmsHeader::leave_req(local));

            if self.leave_rsp.get_result(timeout).await.is_some() {
                return;
            }
            tracing::warn!("{}: no LEAVE_RSP from {} within {:?}", NAME, coord, timeout);
        }

        tracing::warn!("{}: leaving without confirmation from the coordinator", NAME);
    }
}
