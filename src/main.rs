//! EVM Transaction Manager - delivers signed transactions to EVM chains
//!
//! Runs one independent pipeline per configured chain and exposes an HTTP
//! API for submission and status, plus a Prometheus metrics endpoint.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use evm_txmgr::api;
use evm_txmgr::chain::ChainManager;
use evm_txmgr::config::{Settings, StorageBackend};
use evm_txmgr::metrics::{self, MetricsServer};
use evm_txmgr::state::{MemoryTxStore, PgTxStore, TxStore};
use evm_txmgr::tx::{LocalKeySigner, TxSigner};

const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting EVM Transaction Manager v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize transaction store
    let store: Arc<dyn TxStore> = match settings.database.backend {
        StorageBackend::Postgres => {
            let store = PgTxStore::new(&settings.database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory transaction store; state is lost on restart");
            Arc::new(MemoryTxStore::new())
        }
    };

    // Load signing keys
    let signer = Arc::new(LocalKeySigner::from_env(&settings.wallet.private_keys_env)?);
    for address in signer.addresses() {
        info!("Signing key loaded for {:?}", address);
    }

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // One pipeline per enabled chain
    let chain_manager = Arc::new(ChainManager::new(&settings, store.clone(), signer)?);
    chain_manager.start().await?;
    info!("Chain pipelines started");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let store = store.clone();
        let chain_manager = chain_manager.clone();
        async move {
            if let Err(e) = api::run_server(config, store, chain_manager).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
                    .await;

                let chains_ok = chain_manager
                    .health_check()
                    .await
                    .iter()
                    .all(|(_, healthy)| *healthy);

                let store_ok = match store.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Store health check failed: {}", e);
                        false
                    }
                };

                if chains_ok && store_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("EVM Transaction Manager is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    chain_manager.stop().await;

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("EVM Transaction Manager stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evm_txmgr=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("TXM_LOG_FORMAT").map_or(false, |f| f == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
