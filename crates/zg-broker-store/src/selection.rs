//! Settlement group selection.
//!
//! Shared by the backends that select in process rather than in SQL.
//!
//! Claims lock a whole (user, provider) pair: while any of a pair's records
//! is claimed, none of its records is selected or claimed by anyone else, so
//! at most one settlement per pair is ever in flight.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zg_broker_core::{InstanceId, SettlementPair, SettlementState, UsageRecord, UsageRecordId};

/// When a (user, provider) group is worth settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCriteria {
    /// Minimum accumulated fee of the pair's unsettled records.
    pub threshold: u128,
    /// A group whose oldest record is at least this old is settled regardless
    /// of the threshold.
    pub force_after: Duration,
    /// Maximum number of records returned in one group.
    pub limit: usize,
}

/// An eligible group of `AckDelivered` records for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementGroup {
    /// The pair all records belong to.
    pub pair: SettlementPair,
    /// Records ordered by nonce, at most `limit` of them.
    pub records: Vec<UsageRecord>,
}

impl SettlementGroup {
    /// IDs of the group's records, in nonce order.
    #[must_use]
    pub fn ids(&self) -> Vec<UsageRecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Sum of the group's fees, saturating at `u128::MAX`.
    #[must_use]
    pub fn total_fee(&self) -> u128 {
        self.records
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.fee))
    }
}

/// Whether a record is waiting for settlement, claimed or not.
#[must_use]
pub fn is_unsettled(record: &UsageRecord) -> bool {
    !record.is_deleted() && record.state == SettlementState::AckDelivered
}

/// Whether a record can be picked up by the selector at `now`. Its pair may
/// still be held through another record; see [`held_pairs`].
#[must_use]
pub fn is_selectable(record: &UsageRecord, now: DateTime<Utc>) -> bool {
    is_unsettled(record) && !record.is_claimed_at(now)
}

/// Whether `record` is still under `owner`'s claim at `now`.
#[must_use]
pub fn is_held_by(record: &UsageRecord, owner: InstanceId, now: DateTime<Utc>) -> bool {
    is_unsettled(record) && record.claim.is_some_and(|c| c.owner == owner && c.is_active(now))
}

/// Pairs with at least one record under an active claim at `now`.
pub fn held_pairs<'a>(
    records: impl IntoIterator<Item = &'a UsageRecord>,
    now: DateTime<Utc>,
) -> BTreeSet<SettlementPair> {
    records
        .into_iter()
        .filter(|r| is_unsettled(r) && r.is_claimed_at(now))
        .map(UsageRecord::pair)
        .collect()
}

/// Pick the earliest-created eligible group out of `records`.
///
/// `records` must include claimed records too, so pairs held by a claim are
/// recognised and skipped whole. Ties on creation time are broken by pair
/// ordering so the choice is deterministic.
pub fn select_group(
    records: impl IntoIterator<Item = UsageRecord>,
    criteria: &GroupCriteria,
    now: DateTime<Utc>,
) -> Option<SettlementGroup> {
    let records: Vec<UsageRecord> = records.into_iter().filter(is_unsettled).collect();
    let held = held_pairs(&records, now);

    let mut groups: BTreeMap<SettlementPair, Vec<UsageRecord>> = BTreeMap::new();
    for record in records {
        if !held.contains(&record.pair()) {
            groups.entry(record.pair()).or_default().push(record);
        }
    }

    let (pair, mut records) = groups
        .into_iter()
        .filter_map(|(pair, records)| {
            let oldest = records.iter().map(|r| r.created_at).min()?;
            let total = records
                .iter()
                .fold(0u128, |acc, r| acc.saturating_add(r.fee));
            let eligible = total >= criteria.threshold || now - oldest >= criteria.force_after;
            eligible.then_some((oldest, pair, records))
        })
        .min_by_key(|(oldest, pair, _)| (*oldest, *pair))
        .map(|(_, pair, records)| (pair, records))?;

    records.sort_by_key(|r| r.nonce);
    records.truncate(criteria.limit);
    Some(SettlementGroup { pair, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zg_broker_core::{Claim, NewUsage, Signature};

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x3333333333333333333333333333333333333333";
    const PROVIDER: &str = "0x2222222222222222222222222222222222222222";

    fn record(user: &str, nonce: u64, fee: u128, age_secs: i64, now: DateTime<Utc>) -> UsageRecord {
        let mut r = UsageRecord::new(NewUsage {
            user: user.parse().unwrap(),
            provider: PROVIDER.parse().unwrap(),
            route: "/chat/completions".into(),
            service_name: None,
            input_count: 1,
            input_fee: fee,
            previous_output_fee: None,
            fee,
            nonce,
            request_hash: None,
            signature: Signature::new(vec![nonce.try_into().unwrap()]),
        });
        r.created_at = now - Duration::seconds(age_secs);
        r.state = SettlementState::AckDelivered;
        r
    }

    fn criteria(threshold: u128) -> GroupCriteria {
        GroupCriteria {
            threshold,
            force_after: Duration::seconds(600),
            limit: 40,
        }
    }

    #[test]
    fn below_threshold_and_young_is_deferred() {
        let now = Utc::now();
        let records = vec![record(ALICE, 1, 100, 10, now), record(ALICE, 2, 100, 5, now)];
        assert!(select_group(records, &criteria(5000), now).is_none());
    }

    #[test]
    fn threshold_makes_group_eligible() {
        let now = Utc::now();
        let records = vec![record(ALICE, 2, 3000, 5, now), record(ALICE, 1, 3000, 10, now)];
        let group = select_group(records, &criteria(5000), now).unwrap();
        assert_eq!(group.records.len(), 2);
        assert_eq!(group.records[0].nonce, 1);
        assert_eq!(group.total_fee(), 6000);
    }

    #[test]
    fn old_group_is_forced() {
        let now = Utc::now();
        let records = vec![record(ALICE, 1, 1, 601, now)];
        assert!(select_group(records, &criteria(5000), now).is_some());
    }

    #[test]
    fn earliest_created_group_wins() {
        let now = Utc::now();
        let records = vec![
            record(BOB, 1, 9000, 100, now),
            record(ALICE, 1, 9000, 50, now),
        ];
        let group = select_group(records, &criteria(5000), now).unwrap();
        assert_eq!(group.pair.user, BOB.parse().unwrap());
    }

    #[test]
    fn claimed_and_deleted_records_are_skipped() {
        let now = Utc::now();
        let mut claimed = record(ALICE, 1, 9000, 10, now);
        claimed.claim = Some(Claim {
            owner: InstanceId::generate(),
            expires_at: now + Duration::seconds(60),
        });
        let mut deleted = record(ALICE, 2, 9000, 10, now);
        deleted.deleted_at = Some(now);
        assert!(select_group(vec![claimed.clone(), deleted], &criteria(0), now).is_none());

        claimed.claim = Some(Claim {
            owner: InstanceId::generate(),
            expires_at: now - Duration::seconds(1),
        });
        assert!(select_group(vec![claimed], &criteria(0), now).is_some());
    }

    #[test]
    fn partly_claimed_pair_is_skipped_whole() {
        let now = Utc::now();
        let mut claimed = record(ALICE, 1, 9000, 100, now);
        claimed.claim = Some(Claim {
            owner: InstanceId::generate(),
            expires_at: now + Duration::seconds(60),
        });
        let rest = record(ALICE, 2, 9000, 90, now);
        let bob = record(BOB, 1, 9000, 10, now);

        let group = select_group(vec![claimed, rest.clone()], &criteria(0), now);
        assert!(group.is_none());

        let group = select_group(vec![rest, bob], &criteria(0), now).unwrap();
        assert_eq!(group.pair.user, ALICE.parse().unwrap());
    }

    #[test]
    fn held_pairs_ignore_lapsed_and_finished_claims() {
        let now = Utc::now();
        let claim = |secs| {
            Some(Claim {
                owner: InstanceId::generate(),
                expires_at: now + Duration::seconds(secs),
            })
        };
        let mut live = record(ALICE, 1, 1, 10, now);
        live.claim = claim(60);
        let mut lapsed = record(BOB, 1, 1, 10, now);
        lapsed.claim = claim(-1);

        let held = held_pairs([&live, &lapsed], now);
        assert_eq!(held.len(), 1);
        assert!(held.contains(&live.pair()));

        live.state = SettlementState::Settled;
        assert!(held_pairs([&live], now).is_empty());
    }

    #[test]
    fn group_is_capped_at_limit() {
        let now = Utc::now();
        let records: Vec<_> = (1..=50).map(|n| record(ALICE, n, 200, 10, now)).collect();
        let group = select_group(records, &criteria(5000), now).unwrap();
        assert_eq!(group.records.len(), 40);
        assert_eq!(group.records.last().unwrap().nonce, 40);
    }
}
