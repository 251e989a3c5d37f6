//! `RocksDB` storage implementation.
//!
//! Reads go straight to the database. Mutations take a process-wide write lock
//! and commit through a single `WriteBatch`, which gives the read-check-write
//! atomicity the settlement operations need within one process.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use tokio::sync::Mutex;

use zg_broker_core::{
    total_fee, Claim, InstanceId, SettlementPair, SettlementState, UsageFilter, UsageRecord,
    UsageRecordId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::selection::{self, GroupCriteria, SettlementGroup};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Load any record, deleted or not.
    fn load(&self, id: &UsageRecordId) -> Result<Option<UsageRecord>> {
        let cf = self.cf(cf::USAGE_RECORDS)?;
        self.db
            .get_cf(&cf, keys::usage_key(id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn load_live(&self, id: &UsageRecordId) -> Result<UsageRecord> {
        self.load(id)?
            .filter(|r| !r.is_deleted())
            .ok_or(StoreError::NotFound)
    }

    /// All records in creation order.
    fn scan(&self) -> Result<Vec<UsageRecord>> {
        let cf = self.cf(cf::USAGE_RECORDS)?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
                Self::deserialize(&value)
            })
            .collect()
    }

    /// Write records in one batch.
    fn write_records<'a>(&self, records: impl IntoIterator<Item = &'a UsageRecord>) -> Result<()> {
        let cf = self.cf(cf::USAGE_RECORDS)?;
        let mut batch = WriteBatch::default();
        for record in records {
            batch.put_cf(&cf, keys::usage_key(&record.id), Self::serialize(record)?);
        }
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn finish(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        next: SettlementState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut updated = Vec::with_capacity(ids.len());
        let mut lost = 0;
        for id in ids {
            match self.load(id)? {
                Some(record) if selection::is_held_by(&record, owner, at) => {
                    updated.push(record);
                }
                _ => lost += 1,
            }
        }
        if lost > 0 {
            return Err(StoreError::ClaimLost(lost));
        }

        for record in &mut updated {
            record.transition(next, at)?;
        }
        self.write_records(&updated)
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.load(&record.id)?.is_some() {
            return Err(StoreError::Duplicate(record.id));
        }

        let pair = record.pair();
        let cf_nonces = self.cf(cf::PAIR_NONCES)?;
        let nonce_key = keys::pair_nonce_key(&pair);
        let last = self
            .db
            .get_cf(&cf_nonces, &nonce_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|v| {
                keys::decode_nonce(&v)
                    .ok_or_else(|| StoreError::Serialization("corrupt pair nonce".into()))
            })
            .transpose()?;
        if let Some(last) = last {
            if record.nonce <= last {
                return Err(StoreError::NonceNotIncreasing {
                    pair,
                    nonce: record.nonce,
                    last,
                });
            }
        }

        let cf_records = self.cf(cf::USAGE_RECORDS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, keys::usage_key(&record.id), Self::serialize(record)?);
        batch.put_cf(&cf_nonces, &nonce_key, keys::encode_nonce(record.nonce));
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn get_usage(&self, id: &UsageRecordId) -> Result<Option<UsageRecord>> {
        Ok(self.load(id)?.filter(|r| !r.is_deleted()))
    }

    async fn record_delivery(
        &self,
        id: &UsageRecordId,
        output_count: u64,
        output_fee: u128,
        at: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_live(id)?;
        record.record_delivery(output_count, output_fee, at)?;
        self.write_records([&record])?;
        Ok(record)
    }

    async fn soft_delete(&self, id: &UsageRecordId, at: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_live(id)?;
        if record.state != SettlementState::Pending {
            return Err(StoreError::Conflict(format!(
                "cannot delete record {id} in state {}",
                record.state
            )));
        }
        record.deleted_at = Some(at);
        self.write_records([&record])
    }

    async fn list_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let matching = self.scan()?.into_iter().filter(|r| filter.matches(r));
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn unsettled_fee(&self, pair: &SettlementPair) -> Result<u128> {
        let records = self.scan()?;
        let open = records.iter().filter(|r| {
            !r.is_deleted()
                && r.pair() == *pair
                && matches!(
                    r.state,
                    SettlementState::Pending | SettlementState::AckDelivered
                )
        });
        Ok(total_fee(open)?)
    }

    async fn promote_delivered(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut promoted = Vec::new();
        for mut record in self.scan()? {
            if !record.is_deleted()
                && record.state == SettlementState::Pending
                && record.delivered_at.is_some()
            {
                record.transition(SettlementState::AckDelivered, now)?;
                promoted.push(record);
            }
        }
        self.write_records(&promoted)?;
        Ok(promoted.len())
    }

    async fn next_settlement_group(
        &self,
        criteria: &GroupCriteria,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementGroup>> {
        Ok(selection::select_group(self.scan()?, criteria, now))
    }

    async fn claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let held = selection::held_pairs(&self.scan()?, now);
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id)? {
                Some(mut record)
                    if selection::is_selectable(&record, now) && !held.contains(&record.pair()) =>
                {
                    record.claim = Some(Claim { owner, expires_at });
                    claimed.push(record);
                }
                _ => return Ok(false),
            }
        }
        self.write_records(&claimed)?;
        Ok(true)
    }

    async fn extend_claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut extended = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id)? {
                Some(mut record) if selection::is_held_by(&record, owner, now) => {
                    record.claim = Some(Claim { owner, expires_at });
                    extended.push(record);
                }
                _ => return Ok(false),
            }
        }
        self.write_records(&extended)?;
        Ok(true)
    }

    async fn release_claim(&self, ids: &[UsageRecordId], owner: InstanceId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut released = Vec::new();
        for id in ids {
            if let Some(mut record) = self.load(id)? {
                if record.claim.is_some_and(|c| c.owner == owner) {
                    record.claim = None;
                    released.push(record);
                }
            }
        }
        self.write_records(&released)
    }

    async fn mark_settled(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.finish(ids, owner, SettlementState::Settled, at).await
    }

    async fn mark_rejected(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.finish(ids, owner, SettlementState::Rejected, at).await
    }
}
