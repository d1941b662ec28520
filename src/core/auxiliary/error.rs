//! Auxiliary error types

use crate::core::lifecycle::AuxiliaryState;
use thiserror::Error;

/// Usage and configuration errors raised by an auxiliary.
///
/// Protocol loss (no ack, NACK, timeout) is never reported through this
/// type; those surface as `false` or the caller's timeout result.
#[derive(Error, Debug)]
pub enum AuxiliaryError {
    /// Transport could not be opened or the handshake was never acked
    #[error("Auxiliary {name} could not be created: {reason}")]
    Creation {
        /// Auxiliary name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Command issued while the instance is not running
    #[error("Auxiliary {0} is not started")]
    NotStarted(String),

    /// Lifecycle transition not allowed from the current state
    #[error("Auxiliary {name}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Auxiliary name
        name: String,
        /// Current state
        from: AuxiliaryState,
        /// Requested state
        to: AuxiliaryState,
    },

    /// Loop thread could not be spawned
    #[error("Failed to spawn loop thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result alias for auxiliary operations
pub type AuxiliaryResult<T> = Result<T, AuxiliaryError>;
