//! Error taxonomy for the scheduling engine

use thiserror::Error;

use crate::resource::ResourceVector;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error taxonomy for the scheduling engine (see spec §7)
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no capacity available, shortage: {shortage:?}")]
    NoCapacity { shortage: ResourceVector },

    #[error("capacity exhausted on server {server_id} (lost commit race)")]
    CapacityExhausted { server_id: String },

    #[error("unknown placement strategy: {0}")]
    StrategyUnknown(String),

    #[error("unknown request: {0}")]
    UnknownRequest(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("reservation {0} evicted by rebalancer")]
    Evicted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no placement found while evacuating reservation {0}")]
    MigrationFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Errors the scheduler recovers from internally without surfacing to the caller
    /// as a terminal failure (`CapacityExhausted` is retried with a fresh snapshot;
    /// `Cancelled` is a normal outcome of a race, not a bug).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::CapacityExhausted { .. } | EngineError::Cancelled
        )
    }

    /// Whether this error should also surface an `AllocationFailed`/`Released` event
    /// rather than being handled purely as a local return value.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, EngineError::CapacityExhausted { .. })
    }
}
