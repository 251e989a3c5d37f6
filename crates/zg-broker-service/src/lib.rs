//! 0G Serving Broker HTTP service.
//!
//! This crate provides the provider-side broker of the 0G serving network:
//!
//! - Metering of billable requests (header validation, usage extraction)
//! - Forwarding of metered requests to the model server
//! - Periodic on-chain settlement of delivered usage
//!
//! # Settlement
//!
//! Usage is paid for by signed requests. The settlement engine batches the
//! delivered usage of one user, has the remote prover verify every signature
//! and fold the batch into a proof, then submits the proof to the serving
//! contract. See [`settlement`] for the tick phases.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for the router

pub mod config;
pub mod error;
pub mod extractor;
pub mod handlers;
pub mod ledger;
pub mod metadata;
pub mod prover;
pub mod routes;
pub mod settlement;
pub mod state;
pub mod upstream;

pub use config::{ConfigError, ServiceConfig};
pub use error::ApiError;
pub use extractor::{ExtractorRegistry, ReqRespExtractor, ServiceType};
pub use ledger::{CachedLedger, ChainLedger, Ledger, LedgerError, TxReceipt};
pub use metadata::{HeaderSet, MetadataValidator, RequestMetadata, ValidationError};
pub use prover::{Prover, SettlementCalldata};
pub use routes::create_router;
pub use settlement::{
    SettlementEngine, SettlementOutcome, SettlementSettings, SettlementStatus, StatusHandle,
};
pub use state::AppState;
pub use upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};
