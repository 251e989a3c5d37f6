//! Error types for usage record storage.

use zg_broker_core::{BrokerError, SettlementPair, UsageRecordId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// A record with this ID already exists.
    #[error("duplicate record: {0}")]
    Duplicate(UsageRecordId),

    /// Nonce replay or reordering for a (user, provider) pair.
    #[error("nonce {nonce} for {pair} is not greater than last nonce {last}")]
    NonceNotIncreasing {
        /// The pair the nonce belongs to.
        pair: SettlementPair,
        /// The rejected nonce.
        nonce: u64,
        /// The highest nonce already stored.
        last: u64,
    },

    /// A claimed record was changed or re-claimed by someone else.
    #[error("settlement claim lost on {0} record(s)")]
    ClaimLost(usize),

    /// The record is in a state that does not allow the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Domain rule violation.
    #[error(transparent)]
    Domain(#[from] BrokerError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(err.to_string())
    }
}
