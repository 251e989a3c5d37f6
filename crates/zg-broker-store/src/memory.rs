//! In-memory storage implementation.
//!
//! Every operation takes one lock over the whole state, so multi-record
//! updates are trivially atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use zg_broker_core::{
    total_fee, Claim, InstanceId, SettlementPair, SettlementState, UsageFilter, UsageRecord,
    UsageRecordId,
};

use crate::error::{Result, StoreError};
use crate::selection::{self, GroupCriteria, SettlementGroup};
use crate::Store;

#[derive(Default)]
struct Inner {
    /// Keyed by ULID, so iteration is creation order.
    records: BTreeMap<UsageRecordId, UsageRecord>,
    last_nonce: HashMap<SettlementPair, u64>,
}

impl Inner {
    fn live_mut(&mut self, id: &UsageRecordId) -> Result<&mut UsageRecord> {
        self.records
            .get_mut(id)
            .filter(|r| !r.is_deleted())
            .ok_or(StoreError::NotFound)
    }

    fn finish(
        &mut self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        next: SettlementState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let lost = ids
            .iter()
            .filter(|id| {
                !self
                    .records
                    .get(id)
                    .is_some_and(|r| selection::is_held_by(r, owner, at))
            })
            .count();
        if lost > 0 {
            return Err(StoreError::ClaimLost(lost));
        }

        for id in ids {
            self.live_mut(id)?.transition(next, at)?;
        }
        Ok(())
    }
}

/// In-memory `Store`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }

        let pair = record.pair();
        if let Some(&last) = inner.last_nonce.get(&pair) {
            if record.nonce <= last {
                return Err(StoreError::NonceNotIncreasing {
                    pair,
                    nonce: record.nonce,
                    last,
                });
            }
        }

        inner.last_nonce.insert(pair, record.nonce);
        inner.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_usage(&self, id: &UsageRecordId) -> Result<Option<UsageRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(id).filter(|r| !r.is_deleted()).cloned())
    }

    async fn record_delivery(
        &self,
        id: &UsageRecordId,
        output_count: u64,
        output_fee: u128,
        at: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.live_mut(id)?;
        let mut updated = record.clone();
        updated.record_delivery(output_count, output_fee, at)?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn soft_delete(&self, id: &UsageRecordId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner.live_mut(id)?;
        if record.state != SettlementState::Pending {
            return Err(StoreError::Conflict(format!(
                "cannot delete record {id} in state {}",
                record.state
            )));
        }
        record.deleted_at = Some(at);
        Ok(())
    }

    async fn list_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let inner = self.inner.read().await;
        let matching = inner.records.values().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn unsettled_fee(&self, pair: &SettlementPair) -> Result<u128> {
        let inner = self.inner.read().await;
        let open = inner.records.values().filter(|r| {
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
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut promoted = 0;
        for record in inner.records.values_mut() {
            if !record.is_deleted()
                && record.state == SettlementState::Pending
                && record.delivered_at.is_some()
            {
                record.transition(SettlementState::AckDelivered, now)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn next_settlement_group(
        &self,
        criteria: &GroupCriteria,
        now: DateTime<Utc>,
    ) -> Result<Option<SettlementGroup>> {
        let inner = self.inner.read().await;
        let candidates = inner
            .records
            .values()
            .filter(|r| selection::is_unsettled(r))
            .cloned();
        Ok(selection::select_group(candidates, criteria, now))
    }

    async fn claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let held = selection::held_pairs(inner.records.values(), now);
        let available = ids.iter().all(|id| {
            inner.records.get(id).is_some_and(|r| {
                selection::is_selectable(r, now) && !held.contains(&r.pair())
            })
        });
        if !available {
            return Ok(false);
        }

        for id in ids {
            inner.live_mut(id)?.claim = Some(Claim { owner, expires_at });
        }
        Ok(true)
    }

    async fn extend_claim(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let held = ids.iter().all(|id| {
            inner
                .records
                .get(id)
                .is_some_and(|r| selection::is_held_by(r, owner, now))
        });
        if !held {
            return Ok(false);
        }

        for id in ids {
            inner.live_mut(id)?.claim = Some(Claim { owner, expires_at });
        }
        Ok(true)
    }

    async fn release_claim(&self, ids: &[UsageRecordId], owner: InstanceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            if let Some(record) = inner.records.get_mut(id) {
                if record.claim.is_some_and(|c| c.owner == owner) {
                    record.claim = None;
                }
            }
        }
        Ok(())
    }

    async fn mark_settled(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .finish(ids, owner, SettlementState::Settled, at)
    }

    async fn mark_rejected(
        &self,
        ids: &[UsageRecordId],
        owner: InstanceId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .finish(ids, owner, SettlementState::Rejected, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use zg_broker_core::{NewUsage, Signature};

    fn record(nonce: u64, fee: u128) -> UsageRecord {
        UsageRecord::new(NewUsage {
            user: "0x1111111111111111111111111111111111111111".parse().unwrap(),
            provider: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            route: "/chat/completions".into(),
            service_name: None,
            input_count: 1,
            input_fee: fee,
            previous_output_fee: None,
            fee,
            nonce,
            request_hash: None,
            signature: Signature::new(vec![7]),
        })
    }

    fn criteria() -> GroupCriteria {
        GroupCriteria {
            threshold: 0,
            force_after: Duration::seconds(600),
            limit: 40,
        }
    }

    async fn delivered(store: &MemoryStore, nonce: u64) -> UsageRecord {
        let r = record(nonce, 10);
        store.insert_usage(&r).await.unwrap();
        store
            .record_delivery(&r.id, 1, 5, Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn nonce_must_increase() {
        let store = MemoryStore::new();
        store.insert_usage(&record(5, 10)).await.unwrap();

        let err = store.insert_usage(&record(5, 10)).await.unwrap_err();
        assert!(matches!(err, StoreError::NonceNotIncreasing { nonce: 5, last: 5, .. }));

        let err = store.insert_usage(&record(3, 10)).await.unwrap_err();
        assert!(matches!(err, StoreError::NonceNotIncreasing { nonce: 3, .. }));

        store.insert_usage(&record(6, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_records_are_hidden_but_keep_nonce() {
        let store = MemoryStore::new();
        let r = record(1, 10);
        store.insert_usage(&r).await.unwrap();
        store.soft_delete(&r.id, Utc::now()).await.unwrap();

        assert!(store.get_usage(&r.id).await.unwrap().is_none());
        assert!(store.list_usage(&UsageFilter::default()).await.unwrap().is_empty());
        assert!(matches!(
            store.insert_usage(&record(1, 10)).await,
            Err(StoreError::NonceNotIncreasing { .. })
        ));

        let all = store
            .list_usage(&UsageFilter {
                include_deleted: true,
                ..UsageFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delivery_then_promotion() {
        let store = MemoryStore::new();
        let r = delivered(&store, 1).await;
        assert_eq!(r.fee, 15);
        assert_eq!(r.state, SettlementState::Pending);

        let undelivered = record(2, 10);
        store.insert_usage(&undelivered).await.unwrap();

        assert_eq!(store.promote_delivered().await.unwrap(), 1);
        let r = store.get_usage(&r.id).await.unwrap().unwrap();
        assert_eq!(r.state, SettlementState::AckDelivered);
        let u = store.get_usage(&undelivered.id).await.unwrap().unwrap();
        assert_eq!(u.state, SettlementState::Pending);
    }

    #[tokio::test]
    async fn claim_prevents_double_selection() {
        let store = MemoryStore::new();
        delivered(&store, 1).await;
        delivered(&store, 2).await;
        store.promote_delivered().await.unwrap();

        let now = Utc::now();
        let group = store
            .next_settlement_group(&criteria(), now)
            .await
            .unwrap()
            .unwrap();
        let ids = group.ids();

        let first = InstanceId::generate();
        let second = InstanceId::generate();
        let expiry = now + Duration::seconds(900);
        assert!(store.claim(&ids, first, expiry, now).await.unwrap());
        assert!(!store.claim(&ids, second, expiry, now).await.unwrap());
        assert!(store
            .next_settlement_group(&criteria(), now)
            .await
            .unwrap()
            .is_none());

        store.release_claim(&ids, first).await.unwrap();
        assert!(store.claim(&ids, second, expiry, now).await.unwrap());
    }

    #[tokio::test]
    async fn mark_settled_requires_owned_claim() {
        let store = MemoryStore::new();
        let r = delivered(&store, 1).await;
        store.promote_delivered().await.unwrap();

        let owner = InstanceId::generate();
        let now = Utc::now();
        let err = store.mark_settled(&[r.id], owner, now).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost(1)));

        store
            .claim(&[r.id], owner, now + Duration::seconds(60), now)
            .await
            .unwrap();
        store.mark_settled(&[r.id], owner, now).await.unwrap();

        let settled = store.get_usage(&r.id).await.unwrap().unwrap();
        assert_eq!(settled.state, SettlementState::Settled);
        assert!(settled.claim.is_none());

        assert!(store.mark_rejected(&[r.id], owner, now).await.is_err());
    }

    #[tokio::test]
    async fn claim_on_part_of_a_pair_locks_the_rest() {
        let store = MemoryStore::new();
        let first = delivered(&store, 1).await;
        let second = delivered(&store, 2).await;
        store.promote_delivered().await.unwrap();

        let now = Utc::now();
        let expiry = now + Duration::seconds(900);
        let holder = InstanceId::generate();
        assert!(store.claim(&[first.id], holder, expiry, now).await.unwrap());

        assert!(store
            .next_settlement_group(&criteria(), now)
            .await
            .unwrap()
            .is_none());
        let other = InstanceId::generate();
        assert!(!store.claim(&[second.id], other, expiry, now).await.unwrap());

        // Once the holder's claim lapses the whole pair is free again.
        let later = expiry + Duration::seconds(1);
        let group = store
            .next_settlement_group(&criteria(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.records.len(), 2);
        assert!(store
            .claim(&group.ids(), other, later + Duration::seconds(900), later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn finishing_after_the_claim_lapsed_is_refused() {
        let store = MemoryStore::new();
        let r = delivered(&store, 1).await;
        store.promote_delivered().await.unwrap();

        let owner = InstanceId::generate();
        let now = Utc::now();
        let expiry = now + Duration::seconds(60);
        store.claim(&[r.id], owner, expiry, now).await.unwrap();

        let err = store
            .mark_settled(&[r.id], owner, expiry + Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost(1)));
        let unchanged = store.get_usage(&r.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, SettlementState::AckDelivered);
    }

    #[tokio::test]
    async fn extend_claim_needs_a_live_claim_of_the_owner() {
        let store = MemoryStore::new();
        let r = delivered(&store, 1).await;
        store.promote_delivered().await.unwrap();

        let owner = InstanceId::generate();
        let now = Utc::now();
        let expiry = now + Duration::seconds(60);
        store.claim(&[r.id], owner, expiry, now).await.unwrap();

        let stranger = InstanceId::generate();
        let renewed = now + Duration::seconds(600);
        assert!(!store.extend_claim(&[r.id], stranger, renewed, now).await.unwrap());
        assert!(store.extend_claim(&[r.id], owner, renewed, now).await.unwrap());

        // Finishing past the first expiry works under the renewed claim.
        let late = expiry + Duration::seconds(30);
        store.mark_settled(&[r.id], owner, late).await.unwrap();
        assert!(!store.extend_claim(&[r.id], owner, renewed, late).await.unwrap());
    }

    #[tokio::test]
    async fn unsettled_fee_counts_open_records_of_the_pair() {
        let store = MemoryStore::new();
        let a = delivered(&store, 1).await;
        let b = record(2, 10);
        store.insert_usage(&b).await.unwrap();
        let c = record(3, 7);
        store.insert_usage(&c).await.unwrap();
        store.soft_delete(&c.id, Utc::now()).await.unwrap();

        let pair = a.pair();
        assert_eq!(store.unsettled_fee(&pair).await.unwrap(), 25);

        store.promote_delivered().await.unwrap();
        let owner = InstanceId::generate();
        let now = Utc::now();
        store
            .claim(&[a.id], owner, now + Duration::seconds(60), now)
            .await
            .unwrap();
        store.mark_settled(&[a.id], owner, now).await.unwrap();
        assert_eq!(store.unsettled_fee(&pair).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn soft_delete_only_pending() {
        let store = MemoryStore::new();
        let r = delivered(&store, 1).await;
        store.promote_delivered().await.unwrap();
        assert!(matches!(
            store.soft_delete(&r.id, Utc::now()).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
