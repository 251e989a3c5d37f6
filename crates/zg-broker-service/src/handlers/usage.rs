//! Usage record listing.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use zg_broker_core::{total_fee, AccountAddress, SettlementState, UsageFilter, UsageRecord};

use crate::error::ApiError;
use crate::state::AppState;

/// Records returned when no limit is given.
const DEFAULT_LIMIT: usize = 100;

/// Upper bound on the `limit` query parameter.
const MAX_LIMIT: usize = 1000;

/// Query parameters of `GET /v1/usage`.
#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    /// Only records in this state (`pending`, `ack_delivered`, ...).
    pub state: Option<String>,
    /// Only records of this user.
    pub user: Option<String>,
    /// Include soft-deleted records.
    #[serde(default)]
    pub include_deleted: bool,
    /// Maximum number of records.
    pub limit: Option<usize>,
}

/// A usage record as served over HTTP. Fees are decimal strings.
#[derive(Debug, Serialize)]
pub struct UsageView {
    /// Record ID.
    pub id: String,
    /// Paying user.
    pub user: String,
    /// Serving provider.
    pub provider: String,
    /// Billable route.
    pub route: String,
    /// Service name, for general deployments.
    pub service_name: Option<String>,
    /// Measured input units.
    pub input_count: u64,
    /// Measured output units.
    pub output_count: u64,
    /// Declared input fee.
    pub input_fee: String,
    /// Computed output fee.
    pub output_fee: String,
    /// Declared total fee.
    pub fee: String,
    /// Per-pair nonce.
    pub nonce: u64,
    /// Settlement state.
    pub state: SettlementState,
    /// When the request was metered.
    pub created_at: DateTime<Utc>,
    /// When the response was delivered.
    pub delivered_at: Option<DateTime<Utc>>,
    /// When the record reached a final state.
    pub settled_at: Option<DateTime<Utc>>,
    /// When the record was discarded.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<UsageRecord> for UsageView {
    fn from(record: UsageRecord) -> Self {
        Self {
            id: record.id.to_string(),
            user: record.user.to_string(),
            provider: record.provider.to_string(),
            route: record.route,
            service_name: record.service_name,
            input_count: record.input_count,
            output_count: record.output_count,
            input_fee: record.input_fee.to_string(),
            output_fee: record.output_fee.to_string(),
            fee: record.fee.to_string(),
            nonce: record.nonce,
            state: record.state,
            created_at: record.created_at,
            delivered_at: record.delivered_at,
            settled_at: record.settled_at,
            deleted_at: record.deleted_at,
        }
    }
}

/// Response of `GET /v1/usage`.
#[derive(Debug, Serialize)]
pub struct UsageListResponse {
    /// Matching records, oldest first.
    pub records: Vec<UsageView>,
    /// Number of records returned.
    pub count: usize,
    /// Sum of the returned records' fees.
    pub total_fee: String,
}

/// List usage records.
pub async fn list_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageListResponse>, ApiError> {
    let filter = UsageFilter {
        state: query
            .state
            .as_deref()
            .map(str::parse::<SettlementState>)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        user: query
            .user
            .as_deref()
            .map(str::parse::<AccountAddress>)
            .transpose()
            .map_err(|e| ApiError::BadRequest(format!("invalid user: {e}")))?,
        include_deleted: query.include_deleted,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)),
    };

    let records = state.store.list_usage(&filter).await?;
    let total = total_fee(&records)?;

    Ok(Json(UsageListResponse {
        count: records.len(),
        total_fee: total.to_string(),
        records: records.into_iter().map(UsageView::from).collect(),
    }))
}
