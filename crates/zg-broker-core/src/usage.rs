//! Usage record types.
//!
//! A `UsageRecord` is one billable request. It is created in `Pending` state by
//! the metering front-end and moved along the settlement state machine only by
//! the settlement scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::{AccountAddress, InstanceId, RequestHash, Signature, UsageRecordId};

/// Settlement state of a usage record.
///
/// The only legal paths are `Pending -> AckDelivered -> Settled` and
/// `Pending -> AckDelivered -> Rejected`. `Settled` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// Created by the metering front-end; response not yet delivered.
    Pending,
    /// Response delivered and acknowledged; eligible for settlement.
    AckDelivered,
    /// Included in a confirmed on-chain settlement.
    Settled,
    /// Excluded from settlement because its signature did not verify.
    Rejected,
}

impl SettlementState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::AckDelivered,
        Self::Settled,
        Self::Rejected,
    ];

    /// Get the state name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AckDelivered => "ack_delivered",
            Self::Settled => "settled",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::AckDelivered)
                | (Self::AckDelivered, Self::Settled | Self::Rejected)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Rejected)
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementState {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| BrokerError::UnknownState(s.to_string()))
    }
}

/// The (user, provider) pair that settlement batches are grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SettlementPair {
    /// The paying user.
    pub user: AccountAddress,
    /// The serving provider.
    pub provider: AccountAddress,
}

impl fmt::Display for SettlementPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.user, self.provider)
    }
}

/// A lease on a record held by the broker instance currently settling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// The instance holding the claim.
    pub owner: InstanceId,
    /// When the claim lapses if it is never released.
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    /// Whether the claim still holds at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Input for creating a new usage record.
#[derive(Debug, Clone)]
pub struct NewUsage {
    /// The paying user.
    pub user: AccountAddress,
    /// The serving provider.
    pub provider: AccountAddress,
    /// The billable route the request hit (without service prefix).
    pub route: String,
    /// Service name, for deployments that send it.
    pub service_name: Option<String>,
    /// Billable input units measured by the extractor.
    pub input_count: u64,
    /// Fee for the input side, as declared by the client.
    pub input_fee: u128,
    /// Fee for the output side of the previous request, if declared.
    pub previous_output_fee: Option<u128>,
    /// Total fee declared by the client.
    pub fee: u128,
    /// Client nonce; strictly increasing per pair.
    pub nonce: u64,
    /// Hash of the request, for deployments that send it.
    pub request_hash: Option<RequestHash>,
    /// Client signature authorizing the request.
    pub signature: Signature,
}

/// One billable request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record ID (time-ordered).
    pub id: UsageRecordId,

    /// The paying user.
    pub user: AccountAddress,

    /// The serving provider.
    pub provider: AccountAddress,

    /// The billable route the request hit.
    pub route: String,

    /// Service name, for deployments that send it.
    pub service_name: Option<String>,

    /// Billable input units.
    pub input_count: u64,

    /// Billable output units, filled in once the response is delivered.
    pub output_count: u64,

    /// Input side fee.
    pub input_fee: u128,

    /// Output side fee, filled in once the response is delivered.
    pub output_fee: u128,

    /// Output fee of the previous request, when the client declares it.
    pub previous_output_fee: Option<u128>,

    /// Total fee owed for this record.
    pub fee: u128,

    /// Client nonce.
    pub nonce: u64,

    /// Hash of the request.
    pub request_hash: Option<RequestHash>,

    /// Client signature.
    pub signature: Signature,

    /// Settlement state.
    pub state: SettlementState,

    /// Active settlement claim, if any.
    pub claim: Option<Claim>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the response was delivered to the client.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the record reached a terminal state.
    pub settled_at: Option<DateTime<Utc>>,

    /// Tombstone; deleted records are invisible to every query.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    /// Create a new `Pending` record.
    #[must_use]
    pub fn new(input: NewUsage) -> Self {
        Self {
            id: UsageRecordId::generate(),
            user: input.user,
            provider: input.provider,
            route: input.route,
            service_name: input.service_name,
            input_count: input.input_count,
            output_count: 0,
            input_fee: input.input_fee,
            output_fee: 0,
            previous_output_fee: input.previous_output_fee,
            fee: input.fee,
            nonce: input.nonce,
            request_hash: input.request_hash,
            signature: input.signature,
            state: SettlementState::Pending,
            claim: None,
            created_at: Utc::now(),
            delivered_at: None,
            settled_at: None,
            deleted_at: None,
        }
    }

    /// The pair this record settles under.
    #[must_use]
    pub fn pair(&self) -> SettlementPair {
        SettlementPair {
            user: self.user,
            provider: self.provider,
        }
    }

    /// Whether an unexpired claim is held on the record.
    #[must_use]
    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claim.is_some_and(|claim| claim.is_active(now))
    }

    /// Whether the record has been tombstoned.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Record the measured output of a delivered response.
    ///
    /// The total fee becomes `input_fee + output_fee`.
    ///
    /// # Errors
    ///
    /// Returns `FeeOverflow` if the sum does not fit, or `InvalidTransition`
    /// if the record has already left `Pending`.
    pub fn record_delivery(
        &mut self,
        output_count: u64,
        output_fee: u128,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != SettlementState::Pending {
            return Err(BrokerError::InvalidTransition {
                from: self.state,
                to: SettlementState::AckDelivered,
            });
        }
        self.fee = self
            .input_fee
            .checked_add(output_fee)
            .ok_or(BrokerError::FeeOverflow)?;
        self.output_count = output_count;
        self.output_fee = output_fee;
        self.delivered_at = Some(at);
        Ok(())
    }

    /// Move the record to `next`, enforcing the state machine.
    ///
    /// Reaching a terminal state stamps `settled_at` and drops any claim.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the move is not allowed.
    pub fn transition(&mut self, next: SettlementState, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BrokerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.settled_at = Some(at);
            self.claim = None;
        }
        Ok(())
    }
}

/// Sum the fees of a set of records.
///
/// # Errors
///
/// Returns `FeeOverflow` if the sum exceeds `u128`.
pub fn total_fee<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Result<u128> {
    records.into_iter().try_fold(0u128, |acc, record| {
        acc.checked_add(record.fee).ok_or(BrokerError::FeeOverflow)
    })
}

/// Filter for listing usage records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageFilter {
    /// Only records in this state.
    pub state: Option<SettlementState>,
    /// Only records of this user.
    pub user: Option<AccountAddress>,
    /// Include tombstoned records.
    #[serde(default)]
    pub include_deleted: bool,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

impl UsageFilter {
    /// Whether `record` passes the filter (ignoring `limit`).
    #[must_use]
    pub fn matches(&self, record: &UsageRecord) -> bool {
        if !self.include_deleted && record.is_deleted() {
            return false;
        }
        if self.state.is_some_and(|state| state != record.state) {
            return false;
        }
        if self.user.is_some_and(|user| user != record.user) {
            return false;
        }
        true
    }
}
