#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use haraft::consensus::provider::FixedPosition;
use haraft::consensus::{
    ConsensusManager, MemoryNetwork, NodeId, NodeStatus, PositionProvider, RaftConfig, RaftHandle, State,
};

pub const CONVERGE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn fixed(offset: u64) -> Arc<dyn PositionProvider> {
    Arc::new(FixedPosition::new("mysql-bin.000001", offset))
}

/// An in-process cluster over [`MemoryNetwork`].
pub struct Cluster {
    pub network: MemoryNetwork,
    pub ids: Vec<NodeId>,
    pub managers: Vec<ConsensusManager>,
}

impl Cluster {
    pub async fn equal(size: usize) -> Self {
        Self::start((0..size).map(|_| fixed(100)).collect()).await
    }

    pub async fn start(providers: Vec<Arc<dyn PositionProvider>>) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let ids: Vec<NodeId> = (0..providers.len())
            .map(|i| NodeId::new(format!("node-{}", i)))
            .collect();

        let mut managers = Vec::new();
        for (i, provider) in providers.into_iter().enumerate() {
            let peers = ids.iter().filter(|id| **id != ids[i]).cloned().collect();
            let manager = ConsensusManager::new(
                ids[i].clone(),
                peers,
                RaftConfig::for_testing(),
                Arc::new(network.transport_for(ids[i].clone())),
                provider,
            )
            .await
            .expect("valid cluster config");
            network.register(ids[i].clone(), Arc::new(manager.handle())).await;
            managers.push(manager);
        }
        for manager in &managers {
            manager.start().await.expect("node starts");
        }

        Self {
            network,
            ids,
            managers,
        }
    }

    pub fn handle(&self, i: usize) -> RaftHandle {
        self.managers[i].handle()
    }

    pub fn status(&self, i: usize) -> NodeStatus {
        self.managers[i].status()
    }

    pub fn states(&self) -> Vec<State> {
        self.managers.iter().map(|m| m.status().state).collect()
    }

    /// Waits until exactly one of `members` leads and every other member
    /// follows it in the same term. Returns the leader's index.
    pub async fn wait_for_leader_among(&self, members: &[usize]) -> usize {
        let deadline = Instant::now() + CONVERGE;
        loop {
            if let Some(leader) = self.settled_leader(members) {
                return leader;
            }
            assert!(
                Instant::now() < deadline,
                "no single leader among {:?}: {:?}",
                members,
                self.states()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self) -> usize {
        let all: Vec<usize> = (0..self.managers.len()).collect();
        self.wait_for_leader_among(&all).await
    }

    fn settled_leader(&self, members: &[usize]) -> Option<usize> {
        let statuses: Vec<(usize, NodeStatus)> = members.iter().map(|i| (*i, self.status(*i))).collect();
        let leaders: Vec<&(usize, NodeStatus)> =
            statuses.iter().filter(|(_, s)| s.state == State::Leader).collect();
        let [(leader, leader_status)] = leaders.as_slice() else {
            return None;
        };
        let settled = statuses.iter().all(|(i, s)| {
            i == leader
                || (s.state == State::Follower
                    && s.term == leader_status.term
                    && s.leader.as_ref() == Some(&leader_status.id))
        });
        settled.then_some(*leader)
    }

    pub async fn wait_for_state(&self, i: usize, state: State) {
        wait_until(|| self.status(i).state == state, &format!("node {} to become {}", i, state)).await;
    }

    pub async fn shutdown(self) {
        for manager in &self.managers {
            let _ = manager.shutdown().await;
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + CONVERGE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
