//! Replication position lookups against a local MySQL server.
//!
//! A replica reports how far it has read its source's binlog
//! (`SHOW SLAVE STATUS`); a server that is not replicating reports its own
//! binlog head (`SHOW MASTER STATUS`). Any failure leaves the position
//! unknown, which makes the node unpromotable.

mod status;

pub use status::{master_position, slave_position};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Executor;
use std::time::Duration;

use consensus::{GtidPosition, PositionProvider, ProviderError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout_ms: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            connect_timeout_ms: 1000,
        }
    }
}

impl MysqlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(MysqlError::InvalidConfig("mysql host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(MysqlError::InvalidConfig("mysql port must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MysqlError::InvalidConfig(
                "mysql connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
    }
}

pub type Result<T> = std::result::Result<T, MysqlError>;

#[derive(Debug, thiserror::Error)]
pub enum MysqlError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<MysqlError> for ProviderError {
    fn from(err: MysqlError) -> Self {
        match err {
            MysqlError::Database(
                e @ (sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)),
            ) => ProviderError::Unreachable(e.to_string()),
            other => ProviderError::Unavailable(other.to_string()),
        }
    }
}

/// Reads the local server's replication position over a small lazy pool.
pub struct MysqlPositionProvider {
    pool: MySqlPool,
    address: String,
}

impl MysqlPositionProvider {
    /// Does not connect; the first lookup does.
    pub fn new(config: &MysqlConfig) -> Result<Self> {
        config.validate()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect_lazy_with(config.connect_options());

        Ok(Self {
            pool,
            address: format!("{}:{}", config.host, config.port),
        })
    }

    async fn lookup(&self) -> Result<Option<GtidPosition>> {
        if let Some(row) = self.pool.fetch_optional("SHOW SLAVE STATUS").await? {
            return Ok(Some(slave_position(&row)?));
        }
        match self.pool.fetch_optional("SHOW MASTER STATUS").await? {
            Some(row) => Ok(Some(master_position(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PositionProvider for MysqlPositionProvider {
    async fn position(&self) -> std::result::Result<GtidPosition, ProviderError> {
        match self.lookup().await {
            Ok(Some(position)) => {
                tracing::trace!("MySQL at {} is at {}", self.address, position);
                Ok(position)
            }
            Ok(None) => Err(ProviderError::Unavailable(format!(
                "MySQL at {} reports neither replica nor binlog status",
                self.address
            ))),
            Err(e) => {
                tracing::debug!("Replication lookup on {} failed: {}", self.address, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MysqlConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_host() {
        let config = MysqlConfig {
            host: String::new(),
            ..MysqlConfig::default()
        };
        assert!(matches!(config.validate(), Err(MysqlError::InvalidConfig(_))));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: MysqlConfig = serde_json::from_str(r#"{"port": 3307}"#).unwrap();
        assert_eq!(config.port, 3307);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn io_errors_read_as_unreachable() {
        let err = MysqlError::Database(sqlx::Error::PoolTimedOut);
        assert!(matches!(ProviderError::from(err), ProviderError::Unreachable(_)));

        let err = MysqlError::Database(sqlx::Error::RowNotFound);
        assert!(matches!(ProviderError::from(err), ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_unknown() {
        let config = MysqlConfig {
            port: 1,
            connect_timeout_ms: 200,
            ..MysqlConfig::default()
        };
        let provider = MysqlPositionProvider::new(&config).unwrap();
        assert!(provider.position().await.is_err());
    }
}
