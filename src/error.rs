//! Crate-wide error taxonomy.
//!
//! Mirrors spec §7: `configuration` and `internal-invariant` errors are
//! fatal (constructors return `Err`, or the engine sets its dysfunctional
//! bit); `network`, `protocol` and `storage` errors are recovered locally by
//! the component that hit them and surfaced to the application through a
//! callback rather than by unwinding the call stack.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;

impl From<sled::Error> for MeshError {
    fn from(e: sled::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for MeshError {
    fn from(e: bincode::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

impl MeshError {
    /// Errors in this class are, per spec §7, non-fatal: the caller should
    /// close/expire the affected peer or transfer and keep running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeshError::Network(_) | MeshError::Protocol(_) | MeshError::Storage(_)
        )
    }
}
