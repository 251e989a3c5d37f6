//! Core types and utilities for the 0G serving broker.
//!
//! This crate provides the foundational types shared by the metering front-end
//! and the settlement engine:
//!
//! - **Identifiers**: `UsageRecordId`, `InstanceId`, `AccountAddress`
//! - **Usage**: `UsageRecord`, `SettlementState`, `Claim`, `UsageFilter`
//! - **Authorization**: `Signature`, `RequestHash`
//! - **Accounts**: `UserAccount`, `SignerKey`
//!
//! # Fee Unit
//!
//! Fees are integers in the smallest currency unit of the ledger (neuron,
//! `1 A0GI = 10^18 neuron`). They are stored as `u128` so that a full
//! 18-decimal balance never needs floating point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod error;
pub mod ids;
pub mod signature;
pub mod usage;

pub use account::{SignerKey, UserAccount};
pub use error::{BrokerError, Result};
pub use ids::{AccountAddress, IdError, InstanceId, UsageRecordId};
pub use signature::{RequestHash, Signature};
pub use usage::{
    total_fee, Claim, NewUsage, SettlementPair, SettlementState, UsageFilter, UsageRecord,
};

/// Route prefix under which every billable route is served.
pub const DEFAULT_SERVICE_PREFIX: &str = "/v1/proxy";

/// Accumulated fee below which settlement of a pair is deferred.
///
/// Aligned with the top-up trigger threshold used by client SDKs.
pub const DEFAULT_SETTLE_TRIGGER_THRESHOLD: u128 = 5000;

/// Maximum number of requests folded into one proof.
pub const DEFAULT_PROOF_BATCH_SIZE: usize = 40;
