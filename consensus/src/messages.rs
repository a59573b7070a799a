use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::gtid::ReplicationView;
use crate::{NodeId, NodeStatus, State};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate: NodeId,
    pub term: u64,
    pub replication: ReplicationView,
    /// Set when the candidacy was started by an administrative transfer.
    pub leader_transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub leader: NodeId,
    pub term: u64,
    pub sent_at: DateTime<Utc>,
}

/// Every method a node answers. One handler per variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum RpcRequest {
    RequestVote(VoteRequest),
    Heartbeat(HeartbeatRequest),
    Ping,
    Status,
    HaEnable,
    HaDisable,
    TryToLeader,
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "RequestVote",
            RpcRequest::Heartbeat(_) => "Heartbeat",
            RpcRequest::Ping => "Ping",
            RpcRequest::Status => "Status",
            RpcRequest::HaEnable => "HAEnable",
            RpcRequest::HaDisable => "HADisable",
            RpcRequest::TryToLeader => "TryToLeader",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetCode {
    Ok,
    /// The request carried an older term than the receiver's.
    StaleTerm,
    /// The voter already granted its vote to another candidate this term.
    AlreadyVoted,
    /// The candidate's replication position lags the voter's.
    CandidateBehind,
    /// The node's replication position is unknown or behind a peer.
    Unpromotable,
    /// The voter cannot read its own replication position.
    ReplicationUnknown,
    HaDisabled,
    InvalidState,
    /// A higher term or HA-disable overtook the request.
    Superseded,
    Internal,
}

impl RetCode {
    pub fn is_ok(self) -> bool {
        self == RetCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetCode::Ok => "OK",
            RetCode::StaleTerm => "STALE_TERM",
            RetCode::AlreadyVoted => "ALREADY_VOTED",
            RetCode::CandidateBehind => "CANDIDATE_BEHIND",
            RetCode::Unpromotable => "UNPROMOTABLE",
            RetCode::ReplicationUnknown => "REPLICATION_UNKNOWN",
            RetCode::HaDisabled => "HA_DISABLED",
            RetCode::InvalidState => "INVALID_STATE",
            RetCode::Superseded => "SUPERSEDED",
            RetCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponseDetail {
    None,
    Replication(ReplicationView),
    Status(Box<NodeStatus>),
}

/// Reply to any [`RpcRequest`]. `term` and `state` describe the responder
/// after it processed the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub from: NodeId,
    pub term: u64,
    pub state: State,
    pub code: RetCode,
    pub message: Option<String>,
    pub detail: ResponseDetail,
}

impl RpcResponse {
    pub fn new(from: NodeId, term: u64, state: State, code: RetCode) -> Self {
        Self {
            from,
            term,
            state,
            code,
            message: None,
            detail: ResponseDetail::None,
        }
    }

    /// Response for a request that could not be processed at all.
    pub fn fault(from: NodeId, message: impl Into<String>) -> Self {
        Self::new(from, 0, State::Idle, RetCode::Internal).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, detail: ResponseDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn replication(&self) -> Option<&ReplicationView> {
        match &self.detail {
            ResponseDetail::Replication(view) => Some(view),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&NodeStatus> {
        match &self.detail {
            ResponseDetail::Status(status) => Some(status),
            _ => None,
        }
    }
}
