//! The replication status seam, plus in-process providers for embedded
//! clusters and tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::gtid::GtidPosition;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Replication source unreachable: {0}")]
    Unreachable(String),

    #[error("Replication status unavailable: {0}")]
    Unavailable(String),
}

/// Reports the local data engine's replication position.
///
/// Any error means the position is unknown and the node is unpromotable.
#[async_trait]
pub trait PositionProvider: Send + Sync + 'static {
    async fn position(&self) -> Result<GtidPosition, ProviderError>;
}

/// Always reports the same position.
#[derive(Debug, Clone)]
pub struct FixedPosition(pub GtidPosition);

impl FixedPosition {
    pub fn new(log_file: impl Into<String>, offset: u64) -> Self {
        Self(GtidPosition::new(log_file, offset))
    }
}

impl Default for FixedPosition {
    fn default() -> Self {
        Self::new("", 0)
    }
}

#[async_trait]
impl PositionProvider for FixedPosition {
    async fn position(&self) -> Result<GtidPosition, ProviderError> {
        Ok(self.0.clone())
    }
}

/// Behaves like a data engine that does not answer pings.
#[derive(Debug, Clone, Default)]
pub struct PingFailure;

#[async_trait]
impl PositionProvider for PingFailure {
    async fn position(&self) -> Result<GtidPosition, ProviderError> {
        Err(ProviderError::Unreachable("ping failed".to_string()))
    }
}

#[derive(Debug, Default)]
struct Shared {
    position: Option<GtidPosition>,
    delay: Duration,
}

/// A position that can be changed at runtime; `None` reads as unreachable.
/// A non-zero delay makes every lookup stall first, like a slow server.
#[derive(Debug, Clone, Default)]
pub struct SharedPosition {
    inner: Arc<Mutex<Shared>>,
}

impl SharedPosition {
    pub fn new(position: Option<GtidPosition>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Shared {
                position,
                delay: Duration::ZERO,
            })),
        }
    }

    pub fn set(&self, position: Option<GtidPosition>) {
        self.update(|shared| shared.position = position);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.update(|shared| shared.delay = delay);
    }

    fn update(&self, apply: impl FnOnce(&mut Shared)) {
        match self.inner.lock() {
            Ok(mut guard) => apply(&mut *guard),
            Err(poisoned) => apply(&mut *poisoned.into_inner()),
        }
    }

    fn current(&self) -> (Option<GtidPosition>, Duration) {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (guard.position.clone(), guard.delay)
    }
}

#[async_trait]
impl PositionProvider for SharedPosition {
    async fn position(&self) -> Result<GtidPosition, ProviderError> {
        let (position, delay) = self.current();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        position.ok_or_else(|| ProviderError::Unreachable("no position".to_string()))
    }
}
