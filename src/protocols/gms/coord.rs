use super::header::{GmsHeader, JoinRsp};
use super::{Gms, NAME, Role};
use crate::membership::{Digest, View, ViewId};
use crate::message::{Address, Event, Header, Message};
use crate::stack::Protocol;
use crate::stack::config::millis;

use std::sync::Arc;

impl Gms {
    /// The next view: current members plus `joining`, minus `leaving` and
    /// every suspected member. `None` without a local address.
    pub(super) fn next_view(&self, joining: &[Address], leaving: &[Address]) -> Option<View> {
        let st = self.state.lock().unwrap();
        let local = st.local_addr?;

        let mut members = st.members.clone();
        members.add_all(joining);
        members.remove_all(leaving);
        if let Role::Coordinator { suspected } | Role::Participant { suspected } = &st.role {
            members.remove_all(suspected);
        }

        let id = st.ltime.max(st.view.as_ref().map_or(0, |v| v.vid().id)) + 1;
        Some(View::new(ViewId::new(local, id), members.elements().to_vec()))
    }

    /// Multicasts `view`. The transport is told about the new members first so
    /// joiners receive the multicast too.
    pub(super) fn cast_view(&self, view: &View) {
        tracing::debug!("{}: casting view {}", NAME, view);
        self.pass_down(Event::TmpView(view.clone()));

        let mut msg = Message::multicast(Vec::new());
        msg.put_header(NAME, Header::Gms(GmsHeader::view(view.clone())));
        self.pass_down(Event::Msg(msg));
    }

    async fn fetch_digest(&self) -> Option<Digest> {
        self.digest.reset();
        self.pass_down(Event::GetDigest);
        self.digest
            .get_result(millis(self.config.digest_timeout))
            .await
    }

    pub(super) async fn handle_join_request(self: Arc<Self>, mbr: Address) {
        let _serial = self.view_lock.lock().await;

        let (coordinator, member, view) = {
            let st = self.state.lock().unwrap();
            (
                st.role.is_coordinator(),
                st.members.contains(&mbr),
                st.view.clone(),
            )
        };
        if !coordinator {
            tracing::warn!("{}: JOIN_REQ from {} but we are not the coordinator", NAME, mbr);
            return;
        }

        let Some(mut digest) = self.fetch_digest().await else {
            tracing::error!(
                "{}: no digest within {}ms, dropping JOIN_REQ from {}",
                NAME,
                self.config.digest_timeout,
                mbr
            );
            return;
        };

        if member {
            // The joiner missed our JOIN_RSP: answer with the current view.
            if let Some(view) = view {
                tracing::info!("{}: {} is already a member, resending view {}", NAME, mbr, view);
                self.send_gms(mbr, GmsHeader::join_rsp(JoinRsp { view, digest }));
            }
            return;
        }

        digest.add(mbr, 0, -1);
        let Some(view) = self.next_view(&[mbr], &[]) else {
            return;
        };

        tracing::info!("{}: {} joins, new view {}", NAME, mbr, view);
        self.cast_view(&view);
        self.install_view(view.clone());
        self.send_gms(mbr, GmsHeader::join_rsp(JoinRsp { view, digest }));
    }

    pub(super) async fn handle_leave_request(self: Arc<Self>, mbr: Address) {
        let _serial = self.view_lock.lock().await;

        let (coordinator, member) = {
            let st = self.state.lock().unwrap();
            (st.role.is_coordinator(), st.members.contains(&mbr))
        };
        if !coordinator {
            tracing::warn!("{}: LEAVE_REQ from {} but we are not the coordinator", NAME, mbr);
            return;
        }

        if member {
            if let Some(view) = self.next_view(&[], &[mbr]) {
                tracing::info!("{}: {} leaves, new view {}", NAME, mbr, view);
                self.cast_view(&view);
                self.install_view(view);
            }
        } else {
            tracing::debug!("{}: LEAVE_REQ from non-member {}, acknowledging anyway", NAME, mbr);
        }

        self.send_gms(mbr, GmsHeader::leave_rsp());
    }

    /// Casts a view without the members currently suspected.
    pub(super) async fn exclude_suspects(self: Arc<Self>) {
        let _serial = self.view_lock.lock().await;

        let suspects: Vec<Address> = {
            let st = self.state.lock().unwrap();
            match &st.role {
                Role::Coordinator { suspected } => suspected
                    .iter()
                    .filter(|m| st.members.contains(m))
                    .copied()
                    .collect(),
                _ => return,
            }
        };
        if suspects.is_empty() {
            return;
        }

        let Some(view) = self.next_view(&[], &[]) else {
            return;
        };

        tracing::info!(
            "{}: excluding suspected member(s) {:?}, new view {}",
            NAME,
            suspects,
            view
        );
        self.cast_view(&view);
        self.install_view(view);
    }

    /// Hands the group over: casts a view without us and waits briefly so the
    /// remaining members can recover it from our send log.
    pub(super) async fn leave_as_coordinator(&self, local: Address) {
        let _serial = self.view_lock.lock().await;

        let Some(view) = self.next_view(&[], &[local]) else {
            return;
        };
        if view.size() == 0 {
            tracing::debug!("{}: last member leaving", NAME);
            return;
        }

        tracing::info!("{}: coordinator {} leaves, handing over with view {}", NAME, local, view);
        self.cast_view(&view);
        tokio::time::sleep(millis(self.config.coord_leave_grace)).await;
    }
}
