//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, proxy, settlement, usage};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent metered requests.
/// Each one holds an upstream connection for the whole inference.
const PROXY_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for the read-only API.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Metering (rate-limited)
/// - `POST {prefix}/*route` - Meter and forward a billable request
///
/// ## Inspection (rate-limited)
/// - `GET /v1/usage` - List usage records
/// - `GET /v1/settlement/status` - Settlement scheduler status
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;
    let proxy_path = format!(
        "{}/*route",
        state.config.service_prefix.trim_end_matches('/')
    );

    // Build CORS layer
    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Registered with full paths: a nested "/v1" would clash with the proxy
    // wildcard under the default prefix.
    let proxy_routes = Router::new()
        .route(&proxy_path, post(proxy::forward))
        .layer(ConcurrencyLimitLayer::new(PROXY_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        .route("/v1/usage", get(usage::list_usage))
        .route("/v1/settlement/status", get(settlement::status))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        .merge(api_routes)
        .merge(proxy_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
