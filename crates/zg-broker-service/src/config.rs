//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use zg_broker_core::{
    AccountAddress, DEFAULT_PROOF_BATCH_SIZE, DEFAULT_SERVICE_PREFIX,
    DEFAULT_SETTLE_TRIGGER_THRESHOLD,
};

use crate::extractor::ServiceType;
use crate::metadata::HeaderSet;

/// Timed remote calls one settlement tick makes in sequence: the account
/// read, two signer lookups, three prover steps and the submission.
pub const REMOTE_CALLS_PER_TICK: u64 = 7;

/// Errors found while validating the configuration at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting is present but unusable.
    #[error("invalid setting {key}: {reason}")]
    Invalid {
        /// Environment key of the setting.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:3080").
    pub listen_addr: String,

    /// PostgreSQL URL; selects the PostgreSQL store when set.
    pub database_url: Option<String>,

    /// `RocksDB` data directory; used when built with `rocksdb-backend`.
    pub data_dir: Option<String>,

    /// Route prefix all billable routes live under (default: "/v1/proxy").
    pub service_prefix: String,

    /// Which metering headers inbound requests must carry.
    pub header_set: HeaderSet,

    /// Billable routes, relative to the service prefix.
    pub billable_routes: Vec<String>,

    /// Kind of model served, which picks the usage extractor.
    pub service_type: ServiceType,

    /// Upstream model server requests are forwarded to.
    pub target_url: Option<String>,

    /// Price per input unit, in neuron.
    pub input_price: u128,

    /// Price per output unit, in neuron.
    pub output_price: u128,

    /// This broker's provider address.
    pub provider_address: Option<String>,

    /// JSON-RPC endpoint of the chain.
    pub ledger_rpc_url: Option<String>,

    /// Address of the serving contract.
    pub ledger_contract_address: Option<String>,

    /// Private key used to submit settlements.
    pub ledger_private_key: Option<String>,

    /// Base URL of the prover service.
    pub prover_url: Option<String>,

    /// Requests folded into one proof (default: 40).
    pub prover_batch_size: usize,

    /// Accumulated fee below which a pair is not yet settled (default: 5000).
    pub settle_trigger_threshold: u128,

    /// Seconds between settlement ticks (default: 300).
    pub settlement_interval_seconds: u64,

    /// Age after which a pair is settled regardless of its fee (default: 600).
    pub force_settlement_after_seconds: u64,

    /// Lifetime of a settlement claim (default: 900).
    pub claim_ttl_seconds: u64,

    /// How long a group whose settlement failed is left alone before it is
    /// retried (default: 900).
    pub settlement_retry_backoff_seconds: u64,

    /// Timeout for each prover or ledger call (default: 30).
    pub remote_call_timeout_seconds: u64,

    /// How long ledger account lookups are cached (default: 1200).
    pub account_cache_seconds: u64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Ledger secrets file structure.
#[derive(Debug, Deserialize)]
struct LedgerSecrets {
    private_key: String,
    #[serde(default)]
    rpc_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (ledger_private_key, secret_rpc_url) = load_ledger_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            database_url: env_opt("DATABASE_URL"),
            data_dir: env_opt("DATA_DIR"),
            service_prefix: std::env::var("SERVICE_PREFIX").unwrap_or(defaults.service_prefix),
            header_set: env_parse("DEPLOYMENT_KIND").unwrap_or(defaults.header_set),
            billable_routes: std::env::var("BILLABLE_ROUTES")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.billable_routes),
            service_type: env_parse("SERVICE_TYPE").unwrap_or(defaults.service_type),
            target_url: env_opt("TARGET_URL"),
            input_price: env_parse("INPUT_PRICE").unwrap_or(defaults.input_price),
            output_price: env_parse("OUTPUT_PRICE").unwrap_or(defaults.output_price),
            provider_address: env_opt("PROVIDER_ADDRESS"),
            ledger_rpc_url: env_opt("LEDGER_RPC_URL").or(secret_rpc_url),
            ledger_contract_address: env_opt("LEDGER_CONTRACT_ADDRESS"),
            ledger_private_key,
            prover_url: env_opt("PROVER_URL"),
            prover_batch_size: env_parse("PROVER_BATCH_SIZE").unwrap_or(defaults.prover_batch_size),
            settle_trigger_threshold: env_parse("SETTLE_TRIGGER_THRESHOLD")
                .unwrap_or(defaults.settle_trigger_threshold),
            settlement_interval_seconds: env_parse("SETTLEMENT_INTERVAL_SECONDS")
                .unwrap_or(defaults.settlement_interval_seconds),
            force_settlement_after_seconds: env_parse("FORCE_SETTLEMENT_AFTER_SECONDS")
                .unwrap_or(defaults.force_settlement_after_seconds),
            claim_ttl_seconds: env_parse("CLAIM_TTL_SECONDS").unwrap_or(defaults.claim_ttl_seconds),
            settlement_retry_backoff_seconds: env_parse("SETTLEMENT_RETRY_BACKOFF_SECONDS")
                .unwrap_or(defaults.settlement_retry_backoff_seconds),
            remote_call_timeout_seconds: env_parse("REMOTE_CALL_TIMEOUT_SECONDS")
                .unwrap_or(defaults.remote_call_timeout_seconds),
            account_cache_seconds: env_parse("ACCOUNT_CACHE_SECONDS")
                .unwrap_or(defaults.account_cache_seconds),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.cors_origins),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
        }
    }

    /// Check everything the service needs to start.
    ///
    /// # Errors
    ///
    /// Returns the first missing or unusable setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider()?;
        let contract = self
            .ledger_contract_address
            .as_deref()
            .ok_or(ConfigError::Missing("LEDGER_CONTRACT_ADDRESS"))?;
        AccountAddress::from_str(contract).map_err(|e| ConfigError::Invalid {
            key: "LEDGER_CONTRACT_ADDRESS",
            reason: e.to_string(),
        })?;
        require(self.ledger_rpc_url.as_deref(), "LEDGER_RPC_URL")?;
        require(self.ledger_private_key.as_deref(), "LEDGER_PRIVATE_KEY")?;
        require(self.prover_url.as_deref(), "PROVER_URL")?;
        require(self.target_url.as_deref(), "TARGET_URL")?;

        if !self.service_prefix.starts_with('/') {
            return Err(invalid("SERVICE_PREFIX", "must start with '/'"));
        }
        if self.billable_routes.is_empty() {
            return Err(ConfigError::Missing("BILLABLE_ROUTES"));
        }
        if let Some(route) = self.billable_routes.iter().find(|r| !r.starts_with('/')) {
            return Err(invalid(
                "BILLABLE_ROUTES",
                &format!("route {route} must start with '/'"),
            ));
        }
        if self.prover_batch_size == 0 {
            return Err(invalid("PROVER_BATCH_SIZE", "must be positive"));
        }
        if self.settlement_interval_seconds == 0 {
            return Err(invalid("SETTLEMENT_INTERVAL_SECONDS", "must be positive"));
        }
        let tick_budget = self
            .remote_call_timeout_seconds
            .saturating_mul(REMOTE_CALLS_PER_TICK);
        if self.claim_ttl_seconds <= tick_budget {
            return Err(invalid(
                "CLAIM_TTL_SECONDS",
                &format!(
                    "must exceed {REMOTE_CALLS_PER_TICK} x REMOTE_CALL_TIMEOUT_SECONDS ({tick_budget}s)"
                ),
            ));
        }
        Ok(())
    }

    /// Parse the configured provider address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is missing or malformed.
    pub fn provider(&self) -> Result<AccountAddress, ConfigError> {
        let raw = self
            .provider_address
            .as_deref()
            .ok_or(ConfigError::Missing("PROVIDER_ADDRESS"))?;
        AccountAddress::from_str(raw).map_err(|e| ConfigError::Invalid {
            key: "PROVIDER_ADDRESS",
            reason: e.to_string(),
        })
    }
}

fn require(value: Option<&str>, key: &'static str) -> Result<(), ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Load ledger secrets from file or environment.
fn load_ledger_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/ledger.json",
        "zg-broker/.secrets/ledger.json",
        "../.secrets/ledger.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<LedgerSecrets>(path) {
            tracing::info!(path = %path, "Loaded ledger secrets from file");
            return (Some(secrets.private_key), secrets.rpc_url);
        }
    }

    tracing::debug!("Ledger secrets file not found, using environment variables");
    (env_opt("LEDGER_PRIVATE_KEY"), None)
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3080".into(),
            database_url: None,
            data_dir: None,
            service_prefix: DEFAULT_SERVICE_PREFIX.into(),
            header_set: HeaderSet::Inference,
            billable_routes: vec!["/chat/completions".into()],
            service_type: ServiceType::Chatbot,
            target_url: None,
            input_price: 1,
            output_price: 1,
            provider_address: None,
            ledger_rpc_url: None,
            ledger_contract_address: None,
            ledger_private_key: None,
            prover_url: None,
            prover_batch_size: DEFAULT_PROOF_BATCH_SIZE,
            settle_trigger_threshold: DEFAULT_SETTLE_TRIGGER_THRESHOLD,
            settlement_interval_seconds: 300,
            force_settlement_after_seconds: 600,
            claim_ttl_seconds: 900,
            settlement_retry_backoff_seconds: 900,
            remote_call_timeout_seconds: 30,
            account_cache_seconds: 1200,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 60,
        }
    }
}
