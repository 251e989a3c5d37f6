//! Settlement status handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::settlement::SettlementStatus;
use crate::state::AppState;

/// Report the scheduler's last tick.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<SettlementStatus> {
    Json(state.settlement.read().await.clone())
}
