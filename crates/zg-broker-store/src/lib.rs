//! Usage record storage for the 0G serving broker.
//!
//! This crate persists metered usage records and implements the few atomic
//! operations the settlement engine relies on: nonce-checked inserts,
//! delivery bookkeeping, group selection and claim-guarded state changes.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process maps, used by tests and single-node demos
//! - [`PgStore`]: PostgreSQL via `sqlx`; the backend to use when several
//!   broker instances share one provider account
//! - `RocksStore`: embedded `RocksDB` (feature `rocksdb-backend`)
//!
//! # Soft Delete
//!
//! Records are never physically removed. A record with `deleted_at` set is
//! filtered out at the query boundary by every operation except
//! [`Store::list_usage`] with `include_deleted`. A deleted record still
//! consumes its nonce.
//!
//! # Example
//!
//! ```no_run
//! use zg_broker_store::{MemoryStore, Store};
//! use zg_broker_core::{NewUsage, Signature, UsageRecord};
//!
//! # async fn demo() -> zg_broker_store::Result<()> {
//! let store = MemoryStore::new();
//! let record = UsageRecord::new(NewUsage {
//!     user: "0x1111111111111111111111111111111111111111".parse().unwrap(),
//!     provider: "0x2222222222222222222222222222222222222222".parse().unwrap(),
//!     route: "/chat/completions".into(),
//!     service_name: None,
//!     input_count: 10,
//!     input_fee: 100,
//!     previous_output_fee: None,
//!     fee: 100,
//!     nonce: 1,
//!     request_hash: None,
//!     signature: Signature::new(vec![1, 2]),
//! });
//! store.insert_usage(&record).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod selection;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;
pub use selection::{GroupCriteria, SettlementGroup};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zg_broker_core::{InstanceId, SettlementPair, UsageFilter, UsageRecord, UsageRecordId};

/// The storage trait defining all usage record operations.
///
/// Every method that changes more than one record is atomic: either all
/// listed records change or none do.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Metering Operations
    // =========================================================================

    /// Insert a new `Pending` record.
    ///
    /// # Errors
    ///
    /// - `StoreError::NonceNotIncreasing` if the record's nonce is not greater
    ///   than every nonce already stored for its (user, provider) pair.
    /// - `StoreError::Duplicate` if a record with the same ID exists.
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Get a live (not deleted) record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_usage(&self, id: &UsageRecordId) -> Result<Option<UsageRecord>>;

    /// Record the measured output of a delivered response.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the record does not exist or is deleted.
    /// - `StoreError::Domain` if the record is no longer `Pending`.
    async fn record_delivery(
        &self,
        id: &UsageRecordId,
        output_count: u64,
        output_fee: u128,
        at: DateTime<Utc>,
    ) -> Result<UsageRecord>;

    /// Tombstone a `Pending` record so it is never billed.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the record does not exist or is deleted.
    /// - `StoreError::Conflict` if the record has left `Pending`.
    async fn soft_delete(&self, id: &UsageRecordId, at: DateTime<Utc>) -> Result<()>;

    /// List records matching a filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>>;

    /// Sum of the fees of a pair's live records that are not settled yet
    /// (`Pending` or `AckDelivered`).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn unsettled_fee(&self, pair: &SettlementPair) -> Result<u128>;

    // =========================================================================
    // Settlement Operations
    // =========================================================================

    /// Move every delivered `Pending` record to `AckDelivered`.
    ///
    /// Returns the number of records promoted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn promote_delivered(&self) -> Result<usize>;

    /// Find the earliest-created eligible (user, provider) group.
    ///
    /// Only live `AckDelivered` records are considered, and a pair with any
    /// record under an active claim at `now` is skipped entirely. See
    /// [`GroupCriteria`] for eligibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn next_settlement_group(
        &self,
        criteria: &GroupCriteria,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementGroup>>;

    /// Claim records for settlement by `owner` until `expires_at`.
    ///
    /// Succeeds only if every record is live, `AckDelivered` and unclaimed
    /// (or its claim lapsed before `now`), and no other record of the same
    /// pairs is under an active claim. Returns `false`, claiming nothing, if
    /// any of that does not hold.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move the expiry of `owner`'s claim on the given records to
    /// `expires_at`.
    ///
    /// Used to renew a claim before a long step and to hold a failed group
    /// back until a retry. Returns `false`, changing nothing, unless every
    /// record is still `AckDelivered` under an active claim of `owner` at
    /// `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn extend_claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop `owner`'s claim on the given records. Records claimed by another
    /// instance are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn release_claim(&self, ids: &[UsageRecordId], owner: InstanceId) -> Result<()>;

    /// Move claimed records to `Settled`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ClaimLost` if any record is not `AckDelivered`
    /// under an active claim of `owner` at `at`; nothing changes in that case.
    async fn mark_settled(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Move claimed records to `Rejected`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ClaimLost` if any record is not `AckDelivered`
    /// under an active claim of `owner` at `at`; nothing changes in that case.
    async fn mark_rejected(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()>;
}
