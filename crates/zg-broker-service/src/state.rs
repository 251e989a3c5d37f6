//! Application state.

use std::sync::Arc;

use zg_broker_core::AccountAddress;
use zg_broker_store::Store;

use crate::config::{ConfigError, ServiceConfig};
use crate::extractor::ExtractorRegistry;
use crate::ledger::Ledger;
use crate::metadata::MetadataValidator;
use crate::settlement::StatusHandle;
use crate::upstream::Upstream;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// This broker's provider address.
    pub provider: AccountAddress,

    /// Extractors of the billable routes.
    pub registry: Arc<ExtractorRegistry>,

    /// Metering header validator.
    pub validator: MetadataValidator,

    /// The model server requests are forwarded to.
    pub upstream: Arc<dyn Upstream>,

    /// Account lookups for request-time balance checks. May be cached.
    pub ledger: Arc<dyn Ledger>,

    /// Status of the settlement scheduler.
    pub settlement: StatusHandle,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider address is missing or malformed.
    pub fn new(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        upstream: Arc<dyn Upstream>,
        ledger: Arc<dyn Ledger>,
        settlement: StatusHandle,
    ) -> Result<Self, ConfigError> {
        let provider = config.provider()?;
        let registry = ExtractorRegistry::new(
            &config.service_prefix,
            &config.billable_routes,
            config.service_type,
        );
        tracing::info!(
            prefix = %config.service_prefix,
            routes = ?config.billable_routes,
            service_type = %config.service_type,
            "Billable routes registered"
        );

        Ok(Self {
            store,
            provider,
            registry: Arc::new(registry),
            validator: MetadataValidator::new(config.header_set),
            upstream,
            ledger,
            settlement,
            config,
        })
    }
}
