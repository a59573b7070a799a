pub mod cli;
pub mod config;
pub mod error;
pub mod node;

pub use config::Config;
pub use error::{HaraftError, Result};
pub use node::Node;

// Re-export key types from workspace crates
pub use api;
pub use consensus;
pub use mysql;
pub use network;
