//! TCP transport for cluster RPCs.
//!
//! Every request and response travels as one frame: a big-endian `u32`
//! length followed by that many bytes of JSON.

pub mod codec;
mod client;
mod server;

pub use client::TcpTransport;
pub use server::RpcServer;

use consensus::ConsensusError;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<NetworkError> for ConsensusError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Serialization(e) => ConsensusError::Serialization(e),
            other => ConsensusError::Network(other.to_string()),
        }
    }
}
