use super::header::GmsHeader;
use super::{Gms, NAME};
use crate::membership::{Digest, PingRsp, View, ViewId};
use crate::message::{Address, Event};
use crate::stack::Protocol;
use crate::stack::config::millis;

use std::collections::BTreeMap;
use std::sync::Arc;

/// Picks the coordinator named by most discovery responses. Ties go to the
/// lowest address. Returns `None` when no response names a coordinator.
pub fn determine_coord(rsps: &[PingRsp]) -> Option<Address> {
    let mut votes: BTreeMap<Address, usize> = BTreeMap::new();
    for rsp in rsps {
        if let Some(coord) = rsp.coord_addr {
            *votes.entry(coord).or_default() += 1;
        }
    }

    let (coord, count) = votes
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))?;

    if votes.len() > 1 {
        tracing::warn!(
            "{}: discovery responses name {} different coordinators, picking {} ({} of {} vote(s))",
            NAME,
            votes.len(),
            coord,
            count,
            rsps.len()
        );
    }
    Some(*coord)
}

impl Gms {
    /// Joins the group and reports `ConnectOk` once a view containing us is
    /// installed. Retries until it succeeds or a disconnect cancels it.
    pub(super) async fn join(self: Arc<Self>) {
        let Some(local) = self.local_addr() else {
            tracing::error!("{}: cannot join without a local address", NAME);
            return;
        };

        let already_member = {
            let mut st = self.state.lock().unwrap();
            if st.role.is_member() {
                true
            } else {
                st.joining = true;
                false
            }
        };
        if already_member {
            tracing::warn!("{}: {} is already a member", NAME, local);
            self.pass_up(Event::ConnectOk);
            return;
        }

        if !self.join_loop(local).await {
            tracing::info!("{}: join of {} cancelled", NAME, local);
            return;
        }

        self.state.lock().unwrap().joining = false;
        self.pass_down(Event::BecomeServer);
        self.pass_up(Event::ConnectOk);
    }

    fn is_joining(&self) -> bool {
        self.state.lock().unwrap().joining
    }

    async fn join_loop(&self, local: Address) -> bool {
        let join_timeout = millis(self.config.join_timeout);
        let retry = millis(self.config.join_retry_timeout);

        while self.is_joining() {
            let rsps = self.find_initial_members(local).await;

            if rsps.is_empty() {
                if self.config.disable_initial_coord {
                    tracing::info!("{}: no initial members found, retrying in {:?}", NAME, retry);
                    tokio::time::sleep(retry).await;
                    continue;
                }
                tracing::info!("{}: no initial members found, starting a new group", NAME);
                self.become_singleton(local);
                return true;
            }

            let coord = match determine_coord(&rsps) {
                Some(coord) if coord != local => coord,
                Some(_) => {
                    tracing::debug!("{}: stale responses name us as coordinator, retrying", NAME);
                    tokio::time::sleep(retry).await;
                    continue;
                }
                None => {
                    let lowest = rsps.iter().all(|rsp| local < rsp.own_addr);
                    if lowest && !self.config.disable_initial_coord {
                        tracing::info!(
                            "{}: no coordinator among {} response(s) and {} is the lowest address, starting a new group",
                            NAME,
                            rsps.len(),
                            local
                        );
                        self.become_singleton(local);
                        return true;
                    }
                    tracing::info!(
                        "{}: no coordinator among {} response(s) yet, retrying in {:?}",
                        NAME,
                        rsps.len(),
                        retry
                    );
                    tokio::time::sleep(retry).await;
                    continue;
                }
            };

            tracing::info!("{}: sending JOIN_REQ to {}", NAME, coord);
            self.join_rsp.reset();
            self.send_gms(coord, GmsHeader::join_req(local));

            let Some(rsp) = self.join_rsp.get_result(join_timeout).await else {
                tracing::warn!(
                    "{}: no JOIN_RSP from {} within {:?}, retrying",
                    NAME,
                    coord,
                    join_timeout
                );
                tokio::time::sleep(retry).await;
                continue;
            };

            if !self.is_joining() {
                break;
            }

            if !rsp.view.contains(&local) {
                tracing::warn!("{}: JOIN_RSP view {} does not contain us, retrying", NAME, rsp.view);
                tokio::time::sleep(retry).await;
                continue;
            }

            self.pass_down(Event::SetDigest(rsp.digest));
            if self.install_view(rsp.view) {
                return true;
            }
            tracing::warn!("{}: could not install the view from JOIN_RSP, retrying", NAME);
            tokio::time::sleep(retry).await;
        }
        false
    }

    /// Asks the discovery layer for the current members, minus ourselves.
    async fn find_initial_members(&self, local: Address) -> Vec<PingRsp> {
        self.initial_mbrs.reset();
        self.pass_down(Event::FindInitialMbrs);

        let rsps = self
            .initial_mbrs
            .get_result(millis(self.config.join_timeout))
            .await
            .unwrap_or_default();

        let rsps: Vec<PingRsp> = rsps.into_iter().filter(|rsp| rsp.own_addr != local).collect();
        tracing::debug!("{}: discovery returned {} response(s)", NAME, rsps.len());
        rsps
    }

    /// Starts a new group with us as its only member and coordinator.
    pub(super) fn become_singleton(&self, local: Address) {
        let id = self.state.lock().unwrap().ltime + 1;

        let mut digest = Digest::new();
        digest.add(local, 0, -1);
        self.pass_down(Event::SetDigest(digest));

        self.install_view(View::new(ViewId::new(local, id), vec![local]));
    }
}
