use thiserror::Error;

#[derive(Error, Debug)]
pub enum HaraftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::ConsensusError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql::MysqlError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, HaraftError>;
