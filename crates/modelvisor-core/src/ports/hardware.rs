//! Hardware inventory ports.

use async_trait::async_trait;
use thiserror::Error;

use super::RepositoryError;
use crate::domain::{ComputeDevice, HardwareRecord};

/// Enumerates compute devices present on this machine.
///
/// Implementations shell out to vendor tools and may block; callers run
/// them off the async executor.
pub trait DeviceProbe: Send + Sync {
    fn enumerate(&self) -> Vec<ComputeDevice>;
}

/// Persistence for per-device activation rows, keyed by device UUID.
#[async_trait]
pub trait HardwareRepository: Send + Sync {
    /// All rows ordered by priority.
    async fn list(&self) -> Result<Vec<HardwareRecord>, RepositoryError>;

    /// Insert or replace the row for `record.uuid`.
    async fn upsert(&self, record: &HardwareRecord) -> Result<(), RepositoryError>;

    /// Delete the row for `uuid`.
    async fn remove(&self, uuid: &str) -> Result<(), RepositoryError>;
}

/// Errors raised by the hardware activation controller.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Invalid GPU index provided.")]
    InvalidActivationConfig(Vec<i64>),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Failed to spawn replacement server: {0}")]
    RestartSpawn(String),

    #[error("Replacement server at {url} not reachable after {attempts} attempts")]
    RestartUnreachable { url: String, attempts: u32 },

    #[error("Device probe failed: {0}")]
    Probe(String),
}
