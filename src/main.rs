//! Wallet transaction engine service
//!
//! Runs the transaction controller for the configured chains and exposes it over
//! an HTTP API, with optional PostgreSQL persistence and Prometheus metrics.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use wallet_tx_engine::api::{self, AppState};
use wallet_tx_engine::chain::{ChainRegistry, PollingBlockTracker};
use wallet_tx_engine::config::Settings;
use wallet_tx_engine::controller::{StaticWalletContext, TransactionController};
use wallet_tx_engine::metrics::{self, MetricsServer};
use wallet_tx_engine::state::{StateManager, TransactionStore};
use wallet_tx_engine::tx::LocalWalletSigner;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting wallet transaction engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let store = Arc::new(TransactionStore::new(settings.engine.history_limit));

    // Restore persisted records and keep the database in sync
    let state_manager = if settings.database.enabled {
        let manager = Arc::new(StateManager::new(&settings.database).await?);
        info!("Database connection established");

        manager.run_migrations().await?;
        let records = manager.load_transactions().await?;
        info!("Restored {} transactions", records.len());
        store.restore(records).await;
        Some(manager)
    } else {
        warn!("Persistence disabled, transactions are kept in memory only");
        None
    };

    let persistence_handle = state_manager.clone().map(|manager| {
        let store = store.clone();
        tokio::spawn(async move { manager.run_persistence(store).await })
    });

    // Chain adapters
    let chains = Arc::new(ChainRegistry::from_settings(&settings)?);
    info!("Chain connections initialized");

    // Signing keys
    let key_var = settings
        .wallet
        .private_key_env
        .clone()
        .unwrap_or_else(|| "WALLET_PRIVATE_KEY".to_string());
    let signer = Arc::new(LocalWalletSigner::from_env(&key_var)?);
    let selected = signer.addresses().first().copied();

    let wallet = Arc::new(StaticWalletContext::from_settings(&settings, selected));

    let controller = Arc::new(TransactionController::new(
        settings.engine.clone(),
        store.clone(),
        chains.clone(),
        signer,
        wallet,
    ));
    info!("Transaction controller initialized");

    // Block tracking and a controller loop for every connected chain
    let mut tracker_handles = Vec::new();
    let mut controller_handles = Vec::new();
    for chain in chains.connected_chains() {
        let block_tracker = Arc::new(PollingBlockTracker::new(
            chain.clone(),
            chains.get(&chain)?,
            Duration::from_millis(settings.engine.block_poll_interval_ms),
        ));

        tracker_handles.push(tokio::spawn({
            let block_tracker = block_tracker.clone();
            async move { block_tracker.run().await }
        }));

        controller_handles.push(tokio::spawn({
            let controller = controller.clone();
            async move { controller.run(chain, block_tracker).await }
        }));
    }

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            controller: controller.clone(),
            chains: chains.clone(),
            state_manager: state_manager.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let state_manager = state_manager.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;

                let chains_ok = chains.health_check().await.iter().all(|(_, h)| *h);

                let db_ok = match &state_manager {
                    Some(manager) => match manager.health_check().await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Database health check failed: {}", e);
                            false
                        }
                    },
                    None => true,
                };

                if chains_ok && db_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Wallet transaction engine is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let the controller finish the block it is processing
    controller.stop();
    for handle in controller_handles {
        if let Err(e) = handle.await {
            warn!("Controller task ended abnormally: {}", e);
        }
    }

    // Abort background tasks
    api_handle.abort();
    for handle in tracker_handles {
        handle.abort();
    }
    health_handle.abort();
    if let Some(h) = persistence_handle {
        h.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Wallet transaction engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,wallet_tx_engine=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
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
