//! Crosschain Relayer - exactly-once settlement of token transfers
//! between paired EVM ledgers
//!
//! Watches `CrosschainSend` events on each chain and submits the matching
//! `validateCrosschainTransfer` settlement on the counterpart chain, with
//! dedup, retries, and a balances/supply read model for UI consumption.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod cache;
mod chain;
mod config;
mod error;
mod events;
mod metrics;
mod relay;
mod state;

use cache::StateCache;
use chain::ChainManager;
use config::{Settings, StorageBackend};
use metrics::MetricsServer;
use relay::RelayDispatcher;
use state::{MemoryTransferStore, PgTransferStore, TransferStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting crosschain relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize the transfer store
    let store: Arc<dyn TransferStore> = match settings.database.backend {
        StorageBackend::Postgres => {
            let store = PgTransferStore::new(&settings.database).await?;
            info!("Database connection established");
            Arc::new(store)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory store: transfers will not survive restart");
            Arc::new(MemoryTransferStore::new())
        }
    };
    store.migrate().await?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize chain manager (gateways for both chains)
    let chains = Arc::new(ChainManager::new(&settings, store.clone()).await?);
    info!("Chain connections initialized");

    // Initialize dispatcher and read model
    let dispatcher = RelayDispatcher::new(chains.clone(), store.clone(), settings.relayer.clone());
    let state_cache = StateCache::new(chains.clone());

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let cache = state_cache.clone();
        let store = store.clone();
        let chains = chains.clone();
        async move {
            if let Err(e) = api::run_server(config, cache, store, chains).await {
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

    // Start event watchers
    let watcher_handle = tokio::spawn({
        let chains = chains.clone();
        async move {
            if let Err(e) = chains.start_watchers().await {
                error!("Watcher error: {}", e);
            }
        }
    });

    // Start the relay dispatcher
    let dispatcher_handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = dispatcher.run().await {
                error!("Relay dispatcher error: {}", e);
            }
        }
    });

    // Start the state cache updater
    let cache_handle = tokio::spawn({
        let cache = state_cache.clone();
        async move {
            if let Err(e) = cache.run().await {
                error!("State cache error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chains.health_check().await;
                for (chain, healthy) in health {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                }

                metrics::record_health_check();
            }
        }
    });

    info!("Crosschain relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop intake, then let in-flight submissions reach
    // a terminal status within the grace period. Non-terminal transfers are
    // persisted and resume on restart.
    dispatcher.stop().await;
    chains.stop().await;
    state_cache.stop().await;
    dispatcher.drain().await;

    // Abort background tasks
    api_handle.abort();
    watcher_handle.abort();
    dispatcher_handle.abort();
    cache_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Crosschain relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,crosschain_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
