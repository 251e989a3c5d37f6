//! Settlement of delivered usage on-chain.
//!
//! A single background task ticks on a timer. Each tick settles at most one
//! (user, provider) group:
//!
//! 1. **Acknowledging**: delivered `Pending` records become `AckDelivered`
//! 2. **Selecting**: the earliest-created eligible group is picked
//! 3. **Claiming**: the group is claimed in the store for this instance
//! 4. **Reconciling**: records already covered by the on-chain nonce are
//!    marked `Settled` without resubmission
//! 5. **Verifying**: records with a bad signature become `Rejected`
//! 6. **ProofGenerating**: the prover builds calldata for the rest
//! 7. **Submitting**: the claim is renewed and the calldata is sent to the
//!    contract
//! 8. **Committing**: the submitted records become `Settled`
//!
//! A failure in any step leaves the remaining records `AckDelivered` and keeps
//! them claimed for the retry backoff. Other pairs are settled meanwhile, and
//! the group is picked again once the backoff has passed.

mod scheduler;

pub use scheduler::{SettlementEngine, SettlementSettings};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use zg_broker_core::SettlementPair;
use zg_broker_store::StoreError;

use crate::ledger::LedgerError;
use crate::prover::ProofError;

/// Steps of a settlement tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPhase {
    /// Promoting delivered records.
    Acknowledging,
    /// Picking the next group.
    Selecting,
    /// Claiming the group.
    Claiming,
    /// Matching the group against the on-chain nonce.
    Reconciling,
    /// Checking signatures.
    Verifying,
    /// Building calldata.
    ProofGenerating,
    /// Sending the settlement transaction.
    Submitting,
    /// Recording the outcome.
    Committing,
}

impl fmt::Display for SettlementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acknowledging => "acknowledging",
            Self::Selecting => "selecting",
            Self::Claiming => "claiming",
            Self::Reconciling => "reconciling",
            Self::Verifying => "verifying",
            Self::ProofGenerating => "proof generation",
            Self::Submitting => "submitting",
            Self::Committing => "committing",
        })
    }
}

/// What went wrong inside a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger read or write failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Prover failed.
    #[error(transparent)]
    Proof(#[from] ProofError),

    /// The prover returned nothing for a non-empty batch.
    #[error("no calldata for a non-empty batch")]
    MissingCalldata,
}

/// A failed settlement tick.
#[derive(Debug, thiserror::Error)]
#[error("settlement {phase} failed: {source}")]
pub struct SettlementError {
    /// The step that failed.
    pub phase: SettlementPhase,
    /// The cause.
    #[source]
    pub source: StepError,
}

/// Summary of one successful tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Nothing was eligible.
    Idle {
        /// Records promoted to `AckDelivered` this tick.
        promoted: usize,
    },
    /// Another instance claimed the group first.
    Contended {
        /// The group that was lost.
        pair: SettlementPair,
    },
    /// A group was processed.
    Settled {
        /// The settled group.
        pair: SettlementPair,
        /// Records settled by this tick's transaction.
        settled: usize,
        /// Records found already settled on-chain.
        reconciled: usize,
        /// Records rejected for a bad signature.
        rejected: usize,
        /// Hash of the settlement transaction, if one was sent.
        tx_hash: Option<String>,
    },
}

/// Scheduler state exposed over HTTP.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementStatus {
    /// Instance ID used for settlement claims.
    pub instance: Option<String>,
    /// Ticks run since startup.
    pub ticks: u64,
    /// When the last tick finished.
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Outcome of the last successful tick.
    pub last_outcome: Option<SettlementOutcome>,
    /// Error of the last tick, if it failed.
    pub last_error: Option<String>,
    /// Phase the last failure happened in.
    pub last_error_phase: Option<SettlementPhase>,
}

/// Shared handle to the scheduler's status.
pub type StatusHandle = Arc<RwLock<SettlementStatus>>;
