//! Administrative control: HAEnable, HADisable and TryToLeader.

use tokio::sync::oneshot;

use crate::gtid::{self, ReplicationView};
use crate::messages::{RetCode, RpcRequest, RpcResponse};
use crate::raft::{Event, RaftNode};
use crate::State;

impl RaftNode {
    pub(crate) fn handle_ha_enable(&mut self) -> RpcResponse {
        if self.ha_enabled {
            return self.response(RetCode::Ok).with_message("HA already enabled");
        }
        self.ha_enabled = true;
        tracing::info!("HA enabled on {}", self.id);
        if self.started && self.state == State::Idle {
            self.become_follower("HA enabled");
        }
        self.response(RetCode::Ok)
    }

    pub(crate) fn handle_ha_disable(&mut self) -> RpcResponse {
        if !self.ha_enabled {
            return self.response(RetCode::Ok).with_message("HA already disabled");
        }
        self.ha_enabled = false;
        tracing::info!("HA disabled on {} in state {}", self.id, self.state);
        self.become_idle("HA disabled");
        self.response(RetCode::Ok)
    }

    /// Runs the local preconditions of a leader transfer. `Err` is the
    /// immediate answer; `Ok` carries the local position to check against
    /// every peer.
    pub(crate) async fn prepare_transfer(&mut self) -> Result<ReplicationView, RpcResponse> {
        if !self.started {
            return Err(self
                .response(RetCode::InvalidState)
                .with_message("node is not started"));
        }
        if !self.ha_enabled {
            return Err(self
                .response(RetCode::HaDisabled)
                .with_message("HA is disabled on this node"));
        }
        match self.state {
            State::Leader => {
                return Err(self.response(RetCode::Ok).with_message("already leader"));
            }
            State::Candidate => {
                return Err(self
                    .response(RetCode::InvalidState)
                    .with_message(format!("election for term {} in progress", self.term)));
            }
            State::Idle => {
                return Err(self
                    .response(RetCode::InvalidState)
                    .with_message("node is idle"));
            }
            State::Follower => {}
        }

        let replication = self.sample_replication().await;
        if !replication.is_known() {
            tracing::warn!("Refusing leader transfer to {}: replication position unknown", self.id);
            return Err(self
                .response(RetCode::Unpromotable)
                .with_message("replication position unknown"));
        }
        Ok(replication)
    }

    /// Pings every peer concurrently and feeds the verdict back into the
    /// event loop. Peers that fail to answer in time count as unknown.
    pub(crate) fn spawn_transfer_check(
        &self,
        replication: ReplicationView,
        reply: oneshot::Sender<RpcResponse>,
    ) {
        let Some(tx) = self.self_tx.upgrade() else {
            let _ = reply.send(RpcResponse::fault(self.id.clone(), "node is shutting down"));
            return;
        };
        let transport = self.transport.clone();
        let peers = self.peers.clone();
        let timeout = self.config.rpc_timeout();
        let term = self.term;

        tracing::debug!(
            "Node {} checking promotability at {} against {} peers",
            self.id,
            replication,
            peers.len()
        );

        tokio::spawn(async move {
            let pings = peers.into_iter().map(|peer| {
                let transport = transport.clone();
                async move {
                    let view = match tokio::time::timeout(timeout, transport.call(&peer, RpcRequest::Ping)).await {
                        Ok(Ok(response)) => response
                            .replication()
                            .cloned()
                            .unwrap_or(ReplicationView::Unknown),
                        Ok(Err(e)) => {
                            tracing::debug!("Ping to {} failed: {}", peer, e);
                            ReplicationView::Unknown
                        }
                        Err(_) => ReplicationView::Unknown,
                    };
                    (peer, view)
                }
            });
            let views = futures::future::join_all(pings).await;
            let verdict = gtid::check_transfer(&replication, &views);

            let _ = tx.send(Event::TransferChecked {
                term,
                replication,
                verdict,
                reply,
            });
        });
    }

    pub(crate) async fn on_transfer_checked(
        &mut self,
        term: u64,
        replication: ReplicationView,
        verdict: Result<(), String>,
        reply: oneshot::Sender<RpcResponse>,
    ) {
        let response = match verdict {
            Err(reason) => {
                tracing::warn!("Refusing leader transfer to {}: {}", self.id, reason);
                self.response(RetCode::Unpromotable).with_message(reason)
            }
            Ok(()) if !self.ha_enabled => self
                .response(RetCode::HaDisabled)
                .with_message("HA was disabled during the promotability check"),
            Ok(()) if self.state == State::Leader => {
                self.response(RetCode::Ok).with_message("already leader")
            }
            Ok(()) if self.term != term || self.state != State::Follower => self
                .response(RetCode::Superseded)
                .with_message(format!(
                    "node moved to {} in term {} during the promotability check",
                    self.state, self.term
                )),
            Ok(()) => {
                tracing::info!("Leader transfer to {} accepted at {}", self.id, replication);
                self.start_election(replication, true).await;
                self.response(RetCode::Ok)
            }
        };

        self.publish();
        if reply.send(response).is_err() {
            tracing::debug!("Caller of TryToLeader on {} went away", self.id);
        }
    }
}
