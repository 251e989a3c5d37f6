//! 0G Serving Broker - metering front-end and settlement engine
//!
//! This is the main entry point for the broker service.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zg_broker_service::{
    create_router, AppState, CachedLedger, ChainLedger, HttpUpstream, Ledger, Prover,
    ServiceConfig, SettlementEngine, SettlementSettings,
};
use zg_broker_store::{MemoryStore, PgStore, Store};
use zg_prover_client::{ClientOptions, ProverClient};

/// Connections kept by the PostgreSQL pool.
const DB_MAX_CONNECTIONS: u32 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,zg_broker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting 0G Serving Broker");

    // Load and check configuration before touching any backend
    let config = ServiceConfig::from_env();
    config.validate()?;
    let provider = config.provider()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        provider = %provider,
        service_type = %config.service_type,
        deployment = %config.header_set,
        prover_batch_size = config.prover_batch_size,
        settle_trigger_threshold = %config.settle_trigger_threshold,
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    // Ledger: raw client for nonces and submissions, cached for signer keys
    let timeout = Duration::from_secs(config.remote_call_timeout_seconds);
    let contract = config
        .ledger_contract_address
        .as_deref()
        .unwrap_or_default()
        .parse()?;
    let chain: Arc<dyn Ledger> = Arc::new(ChainLedger::new(
        config.ledger_rpc_url.as_deref().unwrap_or_default(),
        &contract,
        &provider,
        config.ledger_private_key.as_deref().unwrap_or_default(),
        timeout,
    )?);
    let cached: Arc<dyn Ledger> = Arc::new(CachedLedger::new(
        Arc::clone(&chain),
        Duration::from_secs(config.account_cache_seconds),
    ));

    let prover_client = ProverClient::with_options(
        config.prover_url.as_deref().unwrap_or_default(),
        &ClientOptions::with_timeout(config.remote_call_timeout_seconds),
    )?;
    let prover = Prover::new(
        Arc::new(prover_client),
        Arc::clone(&cached),
        config.prover_batch_size,
        timeout,
    );

    let engine = SettlementEngine::new(
        Arc::clone(&store),
        prover,
        chain,
        SettlementSettings::from_config(&config),
    );
    let settlement_status = engine.status();

    let upstream = HttpUpstream::new(
        config.target_url.clone().unwrap_or_default(),
        Duration::from_secs(config.request_timeout_seconds),
    )?;

    // Build app state
    let state = AppState::new(
        store,
        config.clone(),
        Arc::new(upstream),
        cached,
        settlement_status,
    )?;

    // Start the settlement scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.spawn(shutdown_rx);

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let a running tick finish before exiting
    tracing::info!("HTTP server stopped, waiting for settlement scheduler");
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Settlement scheduler already stopped");
    }
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Settlement scheduler task failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Pick the storage backend from the configuration.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, BoxError> {
    if let Some(url) = &config.database_url {
        tracing::info!("Connecting to PostgreSQL store");
        return Ok(Arc::new(PgStore::connect(url, DB_MAX_CONNECTIONS).await?));
    }

    if let Some(dir) = &config.data_dir {
        #[cfg(feature = "rocksdb-backend")]
        {
            tracing::info!(path = %dir, "Opening RocksDB store");
            return Ok(Arc::new(zg_broker_store::RocksStore::open(dir)?));
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        tracing::warn!(
            path = %dir,
            "DATA_DIR is set but RocksDB support is not compiled in"
        );
    }

    tracing::warn!("No persistent store configured - usage records are kept in memory only");
    Ok(Arc::new(MemoryStore::new()))
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }
}
