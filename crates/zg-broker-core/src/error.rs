//! Error types for broker domain operations.

use crate::ids::IdError;
use crate::usage::SettlementState;

/// Result type for broker domain operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur when building or mutating domain values.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Invalid identifier or address.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Signature blob is not a JSON array of integers.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Request hash is not `0x`-prefixed hex.
    #[error("invalid request hash: {0}")]
    InvalidRequestHash(String),

    /// A settlement state change that the state machine does not allow.
    #[error("invalid settlement transition from {from} to {to}")]
    InvalidTransition {
        /// The current state.
        from: SettlementState,
        /// The requested state.
        to: SettlementState,
    },

    /// A settlement state name that is not recognised.
    #[error("unknown settlement state: {0}")]
    UnknownState(String),

    /// Arithmetic overflow while accumulating fees.
    #[error("fee overflow")]
    FeeOverflow,
}
