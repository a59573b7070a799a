use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::gtid::{self, ReplicationView};
use crate::messages::*;
use crate::provider::PositionProvider;
use crate::transport::{RpcHandler, Transport};
use crate::{ConsensusError, Counters, NodeId, NodeStatus, RaftConfig, Result, State};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReplyKind {
    Vote,
    Heartbeat,
}

/// Everything a node reacts to. Inbound RPCs, timer expiries and replies to
/// its own outbound RPCs are all processed one at a time by the node task.
pub(crate) enum Event {
    Rpc {
        request: RpcRequest,
        reply: oneshot::Sender<RpcResponse>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Reply {
        kind: ReplyKind,
        term: u64,
        peer: NodeId,
        outcome: Result<RpcResponse>,
    },
    PingSampled {
        view: ReplicationView,
        reply: oneshot::Sender<RpcResponse>,
    },
    TransferChecked {
        term: u64,
        replication: ReplicationView,
        verdict: std::result::Result<(), String>,
        reply: oneshot::Sender<RpcResponse>,
    },
}

pub(crate) struct RaftNode {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) config: RaftConfig,
    pub(crate) transport: Arc<dyn Transport>,
    provider: Arc<dyn PositionProvider>,

    pub(crate) state: State,
    pub(crate) term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    pub(crate) ha_enabled: bool,
    pub(crate) started: bool,
    replication: ReplicationView,
    counters: Counters,

    // Candidate and leader bookkeeping
    votes: HashSet<NodeId>,
    election_deadline: Option<Instant>,
    next_heartbeat: Option<Instant>,
    leader_since: Option<Instant>,
    last_ack: HashMap<NodeId, Instant>,

    inbox: mpsc::UnboundedReceiver<Event>,
    pub(crate) self_tx: mpsc::WeakUnboundedSender<Event>,
    status_tx: watch::Sender<NodeStatus>,
}

impl RaftNode {
    pub(crate) fn spawn(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn PositionProvider>,
    ) -> (RaftHandle, JoinHandle<()>) {
        let (node, handle) = Self::new(id, peers, config, transport, provider);
        let task = tokio::spawn(node.run());
        (handle, task)
    }

    fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn PositionProvider>,
    ) -> (Self, RaftHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let initial = NodeStatus {
            id: id.clone(),
            state: State::Idle,
            term: 0,
            leader: None,
            voted_for: None,
            ha_enabled: true,
            started: false,
            peers: peers.clone(),
            replication: ReplicationView::Unknown,
            counters: Counters::default(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let node = RaftNode {
            id: id.clone(),
            peers,
            config,
            transport,
            provider,
            state: State::Idle,
            term: 0,
            voted_for: None,
            leader: None,
            ha_enabled: true,
            started: false,
            replication: ReplicationView::Unknown,
            counters: Counters::default(),
            votes: HashSet::new(),
            election_deadline: None,
            next_heartbeat: None,
            leader_since: None,
            last_ack: HashMap::new(),
            inbox,
            self_tx: tx.downgrade(),
            status_tx,
        };

        let handle = RaftHandle {
            id,
            tx,
            status: status_rx,
        };
        (node, handle)
    }

    async fn run(mut self) {
        tracing::debug!("Raft node {} event loop running", self.id);

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                event = self.inbox.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
                _ = sleep_until(wakeup) => self.on_timer().await,
            }
            self.publish();
        }

        tracing::info!("Raft node {} stopped at term {}", self.id, self.term);
    }

    /// Returns false once the node has been stopped.
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Rpc { request, reply } => self.handle_rpc(request, reply).await,
            Event::Start { reply } => {
                self.start();
                self.publish();
                let _ = reply.send(());
            }
            Event::Stop { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
            Event::Reply {
                kind: ReplyKind::Vote,
                term,
                peer,
                outcome,
            } => self.on_vote_reply(term, peer, outcome).await,
            Event::Reply {
                kind: ReplyKind::Heartbeat,
                term,
                peer,
                outcome,
            } => self.on_heartbeat_reply(term, peer, outcome),
            Event::PingSampled { view, reply } => self.on_ping_sampled(view, reply),
            Event::TransferChecked {
                term,
                replication,
                verdict,
                reply,
            } => self.on_transfer_checked(term, replication, verdict, reply).await,
        }
        true
    }

    async fn handle_rpc(&mut self, request: RpcRequest, reply: oneshot::Sender<RpcResponse>) {
        let method = request.method();
        let response = match request {
            RpcRequest::RequestVote(vote) => self.handle_request_vote(vote).await,
            RpcRequest::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat),
            // The lookup runs off the event loop so heartbeats keep flowing.
            RpcRequest::Ping => {
                self.spawn_ping(reply);
                return;
            }
            RpcRequest::Status => self
                .response(RetCode::Ok)
                .with_detail(ResponseDetail::Status(Box::new(self.snapshot()))),
            RpcRequest::HaEnable => self.handle_ha_enable(),
            RpcRequest::HaDisable => self.handle_ha_disable(),
            // Answered once every peer's position has been gathered.
            RpcRequest::TryToLeader => match self.prepare_transfer().await {
                Ok(replication) => {
                    self.spawn_transfer_check(replication, reply);
                    return;
                }
                Err(response) => response,
            },
        };

        // Callers observe the new state as soon as they hear back.
        self.publish();
        if reply.send(response).is_err() {
            tracing::debug!("Caller of {} on {} went away before the reply", method, self.id);
        }
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        tracing::info!("Starting raft node {} with peers {:?}", self.id, self.peers);
        if self.ha_enabled {
            self.become_follower("started");
        }
    }

    fn shutdown(&mut self) {
        self.become_idle("stopped");
        self.started = false;
        self.publish();
    }

    // ---- vote and heartbeat handlers ----

    async fn handle_request_vote(&mut self, vote: VoteRequest) -> RpcResponse {
        if vote.term < self.term {
            let message = format!("term {} is older than {}", vote.term, self.term);
            return self.deny_vote(&vote, RetCode::StaleTerm, message);
        }
        if vote.term > self.term {
            self.adopt_term(vote.term, "vote request");
        }

        // A candidate holds its own vote, so an equal-term rival is refused
        // and the candidate keeps campaigning.
        let conflicting = self
            .voted_for
            .as_ref()
            .filter(|voted| **voted != vote.candidate)
            .cloned();
        if let Some(voted) = conflicting {
            let message = format!("already voted for {} in term {}", voted, self.term);
            return self.deny_vote(&vote, RetCode::AlreadyVoted, message);
        }

        let local = self.sample_replication().await;
        if let Err(code) = gtid::check_vote(&vote.replication, &local) {
            let message = format!("candidate at {}, voter at {}", vote.replication, local);
            return self.deny_vote(&vote, code, message);
        }

        self.voted_for = Some(vote.candidate.clone());
        self.counters.votes_granted += 1;
        if self.state == State::Follower {
            if vote.leader_transfer {
                self.defer_election();
            } else {
                self.reset_election_timer();
            }
        }
        tracing::debug!(
            "Node {} granted vote to {} for term {}",
            self.id,
            vote.candidate,
            vote.term
        );
        self.response(RetCode::Ok)
    }

    fn deny_vote(&mut self, vote: &VoteRequest, code: RetCode, message: String) -> RpcResponse {
        self.counters.votes_denied += 1;
        tracing::debug!(
            "Node {} denied vote to {} for term {}: {} ({})",
            self.id,
            vote.candidate,
            vote.term,
            code,
            message
        );
        self.response(code).with_message(message)
    }

    fn handle_heartbeat(&mut self, heartbeat: HeartbeatRequest) -> RpcResponse {
        if heartbeat.term < self.term {
            tracing::trace!(
                "Node {} rejected stale heartbeat from {} (term {} < {})",
                self.id,
                heartbeat.leader,
                heartbeat.term,
                self.term
            );
            return self
                .response(RetCode::StaleTerm)
                .with_message(format!("term {} is older than {}", heartbeat.term, self.term));
        }
        if heartbeat.term > self.term {
            self.adopt_term(heartbeat.term, "heartbeat");
        }

        match self.state {
            State::Candidate => self.become_follower("heartbeat from leader"),
            State::Leader if heartbeat.leader != self.id => {
                tracing::warn!(
                    "Leader {} saw competing leader {} in term {}",
                    self.id,
                    heartbeat.leader,
                    self.term
                );
                self.become_follower("competing leader");
            }
            _ => {}
        }

        self.leader = Some(heartbeat.leader);
        self.counters.heartbeats_received += 1;
        if self.state == State::Follower {
            self.reset_election_timer();
        }
        self.response(RetCode::Ok)
    }

    async fn on_vote_reply(&mut self, term: u64, peer: NodeId, outcome: Result<RpcResponse>) {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("No vote from {} for term {}: {}", peer, term, e);
                return;
            }
        };

        if response.term > self.term {
            self.adopt_term(response.term, "vote reply");
            return;
        }
        if self.state != State::Candidate || term != self.term {
            return;
        }

        match response.code {
            RetCode::Ok => {
                self.votes.insert(peer);
                if self.has_quorum(self.votes.len()) {
                    self.become_leader().await;
                }
            }
            RetCode::CandidateBehind | RetCode::Unpromotable => {
                tracing::info!(
                    "Node {} abandons candidacy for term {}: {} answered {}",
                    self.id,
                    term,
                    peer,
                    response.code
                );
                self.become_follower("replication behind a peer");
            }
            code => tracing::debug!("{} denied vote for term {}: {}", peer, term, code),
        }
    }

    fn on_heartbeat_reply(&mut self, term: u64, peer: NodeId, outcome: Result<RpcResponse>) {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!("Heartbeat to {} failed: {}", peer, e);
                return;
            }
        };

        if response.term > self.term {
            self.adopt_term(response.term, "heartbeat reply");
            return;
        }
        if self.state == State::Leader && term == self.term && response.code.is_ok() {
            self.last_ack.insert(peer, Instant::now());
        }
    }

    // ---- timers ----

    fn next_wakeup(&self) -> Option<Instant> {
        match self.state {
            State::Leader => self.next_heartbeat,
            State::Follower | State::Candidate => self.election_deadline,
            State::Idle => None,
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        match self.state {
            State::Leader => {
                if self.next_heartbeat.is_some_and(|at| at <= now) && self.check_quorum(now) {
                    self.broadcast_heartbeat();
                }
            }
            State::Follower | State::Candidate => {
                if self.election_deadline.is_some_and(|at| at <= now) {
                    self.on_election_timeout().await;
                }
            }
            State::Idle => {}
        }
    }

    async fn on_election_timeout(&mut self) {
        let replication = self.sample_replication().await;
        if !replication.is_known() {
            tracing::warn!(
                "Node {} replication position unknown, not standing for election after term {}",
                self.id,
                self.term
            );
            if self.state == State::Candidate {
                self.become_follower("replication position unknown");
            } else {
                self.reset_election_timer();
            }
            return;
        }

        if self.state == State::Candidate {
            tracing::info!(
                "Election for term {} on {} timed out without a majority",
                self.term,
                self.id
            );
        }
        self.start_election(replication, false).await;
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Some(Instant::now() + self.config.random_election_timeout());
    }

    /// Pushes the deadline to the top of the range so a transfer in flight
    /// is not raced by this node.
    fn defer_election(&mut self) {
        self.election_deadline = Some(Instant::now() + self.config.max_election_timeout());
    }

    // ---- transitions ----

    pub(crate) async fn start_election(&mut self, replication: ReplicationView, leader_transfer: bool) {
        let previous = self.state;
        self.term += 1;
        self.state = State::Candidate;
        self.voted_for = Some(self.id.clone());
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.leader = None;
        self.next_heartbeat = None;
        self.leader_since = None;
        self.counters.elections_started += 1;
        self.reset_election_timer();
        let reason = if leader_transfer {
            "leader transfer"
        } else {
            "election timeout"
        };
        self.log_transition(previous, reason);
        tracing::info!(
            "Node {} starting election for term {} at position {}",
            self.id,
            self.term,
            replication
        );

        if self.has_quorum(self.votes.len()) {
            self.become_leader().await;
            return;
        }

        let request = VoteRequest {
            candidate: self.id.clone(),
            term: self.term,
            replication,
            leader_transfer,
        };
        for peer in &self.peers {
            self.dispatch(ReplyKind::Vote, peer.clone(), RpcRequest::RequestVote(request.clone()));
        }
    }

    async fn become_leader(&mut self) {
        // The provider is consulted once more before taking office.
        let replication = self.sample_replication().await;
        if !replication.is_known() {
            tracing::warn!(
                "Node {} won term {} but its replication position is unknown",
                self.id,
                self.term
            );
            self.become_follower("replication position lost before taking office");
            return;
        }

        let previous = self.state;
        self.state = State::Leader;
        self.leader = Some(self.id.clone());
        self.election_deadline = None;
        self.leader_since = Some(Instant::now());
        self.last_ack.clear();
        self.counters.elections_won += 1;
        self.log_transition(previous, "won election");
        tracing::info!(
            "Node {} became leader for term {} with {} votes",
            self.id,
            self.term,
            self.votes.len()
        );
        self.broadcast_heartbeat();
    }

    pub(crate) fn become_follower(&mut self, reason: &str) {
        if !self.started || !self.ha_enabled {
            self.become_idle(reason);
            return;
        }
        let previous = self.state;
        if previous == State::Leader {
            self.counters.step_downs += 1;
            self.leader = None;
        }
        self.state = State::Follower;
        self.votes.clear();
        self.next_heartbeat = None;
        self.leader_since = None;
        self.last_ack.clear();
        self.reset_election_timer();
        self.log_transition(previous, reason);
    }

    pub(crate) fn become_idle(&mut self, reason: &str) {
        let previous = self.state;
        if previous == State::Leader {
            self.counters.step_downs += 1;
            self.leader = None;
        }
        self.state = State::Idle;
        self.votes.clear();
        self.election_deadline = None;
        self.next_heartbeat = None;
        self.leader_since = None;
        self.last_ack.clear();
        self.log_transition(previous, reason);
    }

    /// Moves to a strictly higher term seen on the wire.
    fn adopt_term(&mut self, term: u64, source: &str) {
        tracing::debug!(
            "Node {} adopting term {} (was {}) from {}",
            self.id,
            term,
            self.term,
            source
        );
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        if matches!(self.state, State::Leader | State::Candidate) {
            self.become_follower("higher term");
        }
    }

    fn log_transition(&self, previous: State, reason: &str) {
        if previous != self.state {
            tracing::info!(
                node = %self.id,
                term = self.term,
                "{} -> {} ({})",
                previous,
                self.state,
                reason
            );
        }
    }

    // ---- leader duties ----

    fn broadcast_heartbeat(&mut self) {
        self.next_heartbeat = Some(Instant::now() + self.config.heartbeat_interval());
        self.counters.heartbeats_sent += self.peers.len() as u64;
        let request = HeartbeatRequest {
            leader: self.id.clone(),
            term: self.term,
            sent_at: Utc::now(),
        };
        tracing::trace!("Leader {} sending heartbeats for term {}", self.id, self.term);
        for peer in &self.peers {
            self.dispatch(ReplyKind::Heartbeat, peer.clone(), RpcRequest::Heartbeat(request.clone()));
        }
    }

    /// Steps down when fewer than a quorum acknowledged heartbeats within
    /// the quorum-loss window. Returns whether the node is still leader.
    fn check_quorum(&mut self, now: Instant) -> bool {
        let window = self.config.quorum_loss_window();
        let Some(since) = self.leader_since else {
            return true;
        };
        if now.duration_since(since) < window {
            return true;
        }

        let reachable = 1 + self
            .last_ack
            .values()
            .filter(|at| now.duration_since(**at) <= window)
            .count();
        if self.has_quorum(reachable) {
            return true;
        }

        tracing::warn!(
            "Leader {} lost quorum in term {} ({} of {} reachable), stepping down",
            self.id,
            self.term,
            reachable,
            self.peers.len() + 1
        );
        self.become_follower("quorum lost");
        false
    }

    fn has_quorum(&self, count: usize) -> bool {
        count >= self.config.quorum_size(self.peers.len() + 1)
    }

    /// Sends `request` to `peer` off the event loop; the outcome comes back
    /// as an [`Event::Reply`] tagged with the current term.
    fn dispatch(&self, kind: ReplyKind, peer: NodeId, request: RpcRequest) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        let timeout = self.config.rpc_timeout();
        let term = self.term;

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, transport.call(&peer, request)).await {
                Ok(result) => result,
                Err(_) => Err(ConsensusError::Timeout(peer.clone())),
            };
            let _ = tx.send(Event::Reply {
                kind,
                term,
                peer,
                outcome,
            });
        });
    }

    // ---- helpers ----

    pub(crate) async fn sample_replication(&mut self) -> ReplicationView {
        let view = lookup_replication(&self.id, self.provider.as_ref(), self.config.provider_timeout()).await;
        self.replication = view.clone();
        view
    }

    fn spawn_ping(&self, reply: oneshot::Sender<RpcResponse>) {
        let Some(tx) = self.self_tx.upgrade() else {
            let _ = reply.send(RpcResponse::fault(self.id.clone(), "node is shutting down"));
            return;
        };
        let id = self.id.clone();
        let provider = self.provider.clone();
        let timeout = self.config.provider_timeout();

        tokio::spawn(async move {
            let view = lookup_replication(&id, provider.as_ref(), timeout).await;
            let _ = tx.send(Event::PingSampled { view, reply });
        });
    }

    fn on_ping_sampled(&mut self, view: ReplicationView, reply: oneshot::Sender<RpcResponse>) {
        self.replication = view.clone();
        self.publish();
        let response = self
            .response(RetCode::Ok)
            .with_detail(ResponseDetail::Replication(view));
        if reply.send(response).is_err() {
            tracing::debug!("Caller of Ping on {} went away before the reply", self.id);
        }
    }

    pub(crate) fn response(&self, code: RetCode) -> RpcResponse {
        RpcResponse::new(self.id.clone(), self.term, self.state, code)
    }

    fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            state: self.state,
            term: self.term,
            leader: self.leader.clone(),
            voted_for: self.voted_for.clone(),
            ha_enabled: self.ha_enabled,
            started: self.started,
            peers: self.peers.clone(),
            replication: self.replication.clone(),
            counters: self.counters.clone(),
        }
    }

    pub(crate) fn publish(&self) {
        let snapshot = self.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn lookup_replication(id: &NodeId, provider: &dyn PositionProvider, timeout: Duration) -> ReplicationView {
    match tokio::time::timeout(timeout, provider.position()).await {
        Ok(Ok(position)) => ReplicationView::Known(position),
        Ok(Err(e)) => {
            tracing::debug!("Node {} replication status unavailable: {}", id, e);
            ReplicationView::Unknown
        }
        Err(_) => {
            tracing::debug!("Node {} replication status lookup timed out", id);
            ReplicationView::Unknown
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Cheap, cloneable access to a running node.
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Start { reply })?;
        rx.await.map_err(|_| ConsensusError::Stopped(self.id.clone()))
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Stop { reply })?;
        rx.await.map_err(|_| ConsensusError::Stopped(self.id.clone()))
    }

    /// Delivers `request` to the node and waits for its response.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Rpc { request, reply })?;
        rx.await.map_err(|_| ConsensusError::Stopped(self.id.clone()))
    }

    pub async fn ha_enable(&self) -> Result<RpcResponse> {
        self.call(RpcRequest::HaEnable).await
    }

    pub async fn ha_disable(&self) -> Result<RpcResponse> {
        self.call(RpcRequest::HaDisable).await
    }

    pub async fn try_to_leader(&self) -> Result<RpcResponse> {
        self.call(RpcRequest::TryToLeader).await
    }

    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| ConsensusError::Stopped(self.id.clone()))
    }
}

#[async_trait]
impl RpcHandler for RaftHandle {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let method = request.method();
        match self.call(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("{} on {} failed: {}", method, self.id, e);
                RpcResponse::fault(self.id.clone(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::GtidPosition;
    use crate::provider::{FixedPosition, PingFailure};
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    fn single(provider: Arc<dyn PositionProvider>, peers: Vec<NodeId>) -> (RaftHandle, MemoryNetwork) {
        let network = MemoryNetwork::new();
        let id = NodeId::from("n1");
        let transport = Arc::new(network.transport_for(id.clone()));
        let (handle, _task) = RaftNode::spawn(id, peers, RaftConfig::for_testing(), transport, provider);
        (handle, network)
    }

    fn vote(candidate: &str, term: u64, log_file: &str, offset: u64) -> RpcRequest {
        RpcRequest::RequestVote(VoteRequest {
            candidate: NodeId::from(candidate),
            term,
            replication: ReplicationView::Known(GtidPosition::new(log_file, offset)),
            leader_transfer: false,
        })
    }

    async fn wait_for_state(handle: &RaftHandle, state: State) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while handle.state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn created_idle_and_start_makes_follower() {
        let (handle, _net) = single(Arc::new(FixedPosition::default()), vec![NodeId::from("n2")]);
        assert_eq!(handle.state(), State::Idle);

        handle.start().await.unwrap();
        wait_for_state(&handle, State::Follower).await;
        assert!(handle.status().started);
    }

    #[tokio::test]
    async fn single_node_elects_itself() {
        let (handle, _net) = single(Arc::new(FixedPosition::default()), vec![]);
        handle.start().await.unwrap();
        wait_for_state(&handle, State::Leader).await;

        let status = handle.status();
        assert_eq!(status.term, 1);
        assert_eq!(status.leader, Some(NodeId::from("n1")));
        assert_eq!(status.counters.elections_won, 1);
    }

    #[tokio::test]
    async fn unknown_position_never_stands_for_election() {
        let (handle, _net) = single(Arc::new(PingFailure), vec![]);
        handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let status = handle.status();
        assert_eq!(status.state, State::Follower);
        assert_eq!(status.term, 0);
        assert_eq!(status.counters.elections_started, 0);
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let (handle, _net) = single(
            Arc::new(FixedPosition::new("mysql-bin.000001", 100)),
            vec![NodeId::from("n2"), NodeId::from("n3")],
        );
        handle.start().await.unwrap();

        let first = handle.call(vote("n2", 5, "mysql-bin.000001", 100)).await.unwrap();
        assert_eq!(first.code, RetCode::Ok);
        assert_eq!(first.term, 5);

        let again = handle.call(vote("n2", 5, "mysql-bin.000001", 100)).await.unwrap();
        assert_eq!(again.code, RetCode::Ok);

        let other = handle.call(vote("n3", 5, "mysql-bin.000001", 200)).await.unwrap();
        assert_eq!(other.code, RetCode::AlreadyVoted);

        let stale = handle.call(vote("n3", 4, "mysql-bin.000001", 200)).await.unwrap();
        assert_eq!(stale.code, RetCode::StaleTerm);
        assert_eq!(stale.term, 5);
    }

    #[tokio::test]
    async fn refuses_candidate_behind_but_adopts_its_term() {
        let (handle, _net) = single(
            Arc::new(FixedPosition::new("mysql-bin.000001", 124)),
            vec![NodeId::from("n2"), NodeId::from("n3")],
        );
        handle.start().await.unwrap();

        let response = handle.call(vote("n2", 3, "mysql-bin.000001", 123)).await.unwrap();
        assert_eq!(response.code, RetCode::CandidateBehind);
        assert_eq!(handle.status().term, 3);
        assert_eq!(handle.status().voted_for, None);
    }

    #[tokio::test]
    async fn refuses_unknown_candidate_as_unpromotable() {
        let (handle, _net) = single(Arc::new(FixedPosition::default()), vec![NodeId::from("n2")]);
        handle.start().await.unwrap();

        let request = RpcRequest::RequestVote(VoteRequest {
            candidate: NodeId::from("n2"),
            term: 1,
            replication: ReplicationView::Unknown,
            leader_transfer: false,
        });
        let response = handle.call(request).await.unwrap();
        assert_eq!(response.code, RetCode::Unpromotable);
    }

    #[tokio::test]
    async fn voter_with_unknown_position_abstains() {
        let (handle, _net) = single(Arc::new(PingFailure), vec![NodeId::from("n2")]);
        handle.start().await.unwrap();

        let response = handle.call(vote("n2", 1, "mysql-bin.000001", 1)).await.unwrap();
        assert_eq!(response.code, RetCode::ReplicationUnknown);
    }

    #[tokio::test]
    async fn heartbeat_sets_leader_and_stale_heartbeat_is_rejected() {
        let (handle, _net) = single(Arc::new(FixedPosition::default()), vec![NodeId::from("n2")]);
        handle.start().await.unwrap();

        let heartbeat = |term| {
            RpcRequest::Heartbeat(HeartbeatRequest {
                leader: NodeId::from("n2"),
                term,
                sent_at: Utc::now(),
            })
        };
        let response = handle.call(heartbeat(4)).await.unwrap();
        assert_eq!(response.code, RetCode::Ok);
        assert_eq!(handle.status().leader, Some(NodeId::from("n2")));
        assert_eq!(handle.status().term, 4);

        let response = handle.call(heartbeat(2)).await.unwrap();
        assert_eq!(response.code, RetCode::StaleTerm);
        assert_eq!(response.term, 4);
    }

    #[tokio::test]
    async fn ping_reports_replication() {
        let (handle, _net) = single(Arc::new(FixedPosition::new("mysql-bin.000002", 9)), vec![]);
        let response = handle.call(RpcRequest::Ping).await.unwrap();
        assert_eq!(
            response.replication(),
            Some(&ReplicationView::Known(GtidPosition::new("mysql-bin.000002", 9)))
        );
    }

    fn detached(provider: Arc<dyn PositionProvider>, peers: &[&str]) -> (RaftNode, RaftHandle) {
        let network = MemoryNetwork::new();
        let id = NodeId::from("n1");
        let transport = Arc::new(network.transport_for(id.clone()));
        let peers = peers.iter().map(|p| NodeId::from(*p)).collect();
        RaftNode::new(id, peers, RaftConfig::for_testing(), transport, provider)
    }

    fn at(offset: u64) -> ReplicationView {
        ReplicationView::Known(GtidPosition::new("mysql-bin.000001", offset))
    }

    fn vote_reply(peer: &str, term: u64, code: RetCode) -> Event {
        Event::Reply {
            kind: ReplyKind::Vote,
            term,
            peer: NodeId::from(peer),
            outcome: Ok(RpcResponse::new(NodeId::from(peer), term, State::Follower, code)),
        }
    }

    async fn candidate() -> (RaftNode, RaftHandle) {
        let (mut node, handle) = detached(
            Arc::new(FixedPosition::new("mysql-bin.000001", 100)),
            &["n2", "n3"],
        );
        node.start();
        node.start_election(at(100), false).await;
        assert_eq!(node.state, State::Candidate);
        (node, handle)
    }

    #[tokio::test]
    async fn ha_disable_during_vote_collection_forces_idle() {
        let (mut node, _handle) = candidate().await;
        let term = node.term;

        assert_eq!(node.handle_ha_disable().code, RetCode::Ok);
        assert_eq!(node.state, State::Idle);

        for peer in ["n2", "n3"] {
            assert!(node.handle_event(vote_reply(peer, term, RetCode::Ok)).await);
        }
        assert_eq!(node.state, State::Idle);
        assert_eq!(node.counters.elections_won, 0);
        assert!(node.election_deadline.is_none());
    }

    #[tokio::test]
    async fn lagging_candidate_abandons_campaign_on_first_denial() {
        for code in [RetCode::CandidateBehind, RetCode::Unpromotable] {
            let (mut node, _handle) = candidate().await;
            let term = node.term;

            assert!(node.handle_event(vote_reply("n2", term, code)).await);
            assert_eq!(node.state, State::Follower);
            assert_eq!(node.term, term);

            // A late grant for the abandoned term changes nothing.
            assert!(node.handle_event(vote_reply("n3", term, RetCode::Ok)).await);
            assert_eq!(node.state, State::Follower);
        }
    }

    #[tokio::test]
    async fn lost_race_keeps_candidate_campaigning() {
        let (mut node, _handle) = candidate().await;
        let term = node.term;

        assert!(node.handle_event(vote_reply("n2", term, RetCode::AlreadyVoted)).await);
        assert_eq!(node.state, State::Candidate);

        assert!(node.handle_event(vote_reply("n3", term, RetCode::Ok)).await);
        assert_eq!(node.state, State::Leader);
    }

    #[tokio::test]
    async fn equal_term_vote_request_does_not_unseat_candidate() {
        let (mut node, _handle) = candidate().await;
        let term = node.term;

        let response = node
            .handle_request_vote(VoteRequest {
                candidate: NodeId::from("n2"),
                term,
                replication: at(200),
                leader_transfer: false,
            })
            .await;
        assert_eq!(response.code, RetCode::AlreadyVoted);
        assert_eq!(node.state, State::Candidate);
        assert_eq!(node.term, term);
        assert_eq!(node.voted_for, Some(NodeId::from("n1")));

        // An equal-term heartbeat does.
        let response = node.handle_heartbeat(HeartbeatRequest {
            leader: NodeId::from("n2"),
            term,
            sent_at: Utc::now(),
        });
        assert_eq!(response.code, RetCode::Ok);
        assert_eq!(node.state, State::Follower);
        assert_eq!(node.leader, Some(NodeId::from("n2")));
    }

    #[tokio::test]
    async fn transfer_vote_pushes_election_deadline_to_the_limit() {
        let (mut node, _handle) = detached(
            Arc::new(FixedPosition::new("mysql-bin.000001", 100)),
            &["n2", "n3"],
        );
        node.start();
        let limit = node.config.max_election_timeout();

        let before = Instant::now();
        let response = node
            .handle_request_vote(VoteRequest {
                candidate: NodeId::from("n2"),
                term: 1,
                replication: at(100),
                leader_transfer: true,
            })
            .await;
        assert_eq!(response.code, RetCode::Ok);
        assert!(node.election_deadline.unwrap() >= before + limit);

        let response = node
            .handle_request_vote(VoteRequest {
                candidate: NodeId::from("n3"),
                term: 2,
                replication: at(100),
                leader_transfer: false,
            })
            .await;
        assert_eq!(response.code, RetCode::Ok);
        assert!(node.election_deadline.unwrap() <= Instant::now() + limit);
    }

    #[tokio::test]
    async fn transfer_verdict_for_an_older_term_is_superseded() {
        let (mut node, _handle) = detached(Arc::new(FixedPosition::default()), &["n2", "n3"]);
        node.start();
        node.handle_heartbeat(HeartbeatRequest {
            leader: NodeId::from("n2"),
            term: 2,
            sent_at: Utc::now(),
        });

        let (reply, rx) = oneshot::channel();
        let event = Event::TransferChecked {
            term: 0,
            replication: at(100),
            verdict: Ok(()),
            reply,
        };
        assert!(node.handle_event(event).await);

        let response = rx.await.unwrap();
        assert_eq!(response.code, RetCode::Superseded);
        assert_eq!(node.state, State::Follower);
        assert_eq!(node.term, 2);
        assert_eq!(node.counters.elections_started, 0);
    }

    #[tokio::test]
    async fn failed_transfer_verdict_leaves_node_untouched() {
        let (mut node, _handle) = detached(Arc::new(FixedPosition::default()), &["n2"]);
        node.start();

        let (reply, rx) = oneshot::channel();
        let event = Event::TransferChecked {
            term: 0,
            replication: at(1),
            verdict: Err("replication position behind n2".to_string()),
            reply,
        };
        assert!(node.handle_event(event).await);

        let response = rx.await.unwrap();
        assert_eq!(response.code, RetCode::Unpromotable);
        assert_eq!(response.message.as_deref(), Some("replication position behind n2"));
        assert_eq!(node.state, State::Follower);
        assert_eq!(node.term, 0);
    }

    #[tokio::test]
    async fn stopped_node_answers_with_fault() {
        let (handle, _net) = single(Arc::new(FixedPosition::default()), vec![]);
        handle.start().await.unwrap();
        handle.stop().await.unwrap();

        assert_eq!(handle.state(), State::Idle);
        assert!(matches!(
            handle.call(RpcRequest::Ping).await,
            Err(ConsensusError::Stopped(_))
        ));
        let response = RpcHandler::handle(&handle, RpcRequest::Status).await;
        assert_eq!(response.code, RetCode::Internal);
    }
}
