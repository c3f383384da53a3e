// =============================================================================
// Kline Cache — Main Entry Point
// =============================================================================
//
// Startup order: config, persisted snapshot, store, feeds and router, API.
// On Ctrl+C every feed is closed, pending windows are flushed to disk and the
// runtime config is saved.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod market_data;
mod persistence;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::{BinanceTransport, RouterConfig, SeriesStore, SubscriptionRouter};
use crate::persistence::{load_or_empty, JsonFileStore, PersistenceWriter, SnapshotStore};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH_ENV: &str = "KLINE_CACHE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "kline_cache.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline Cache starting up");

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|name| std::env::var(name).ok());

    info!(
        active = %config.active_key,
        watched = config.watched_keys.len(),
        window = config.window_capacity,
        "Configuration loaded"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let snapshot_store: Arc<dyn SnapshotStore> =
        Arc::new(JsonFileStore::new(config.snapshot_path.clone()));
    let persisted = load_or_empty(snapshot_store.as_ref());
    let (persistence, writer) = PersistenceWriter::spawn(
        snapshot_store,
        persisted.clone(),
        config.flush_interval(),
    );

    // ── 3. Series store ──────────────────────────────────────────────────
    let store = Arc::new(
        SeriesStore::new(config.window_capacity).with_persistence(persistence.clone()),
    );
    store.restore(persisted);

    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => debug!(
                    key = %change.key,
                    kind = ?change.kind,
                    len = change.len,
                    last = ?change.last_timestamp,
                    "series changed"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "change log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── 4. Feeds & router ────────────────────────────────────────────────
    let transport = Arc::new(BinanceTransport::new(config.feed_base_url.clone()));
    let (router, router_task) = SubscriptionRouter::spawn(
        store.clone(),
        transport,
        RouterConfig {
            window_capacity: config.window_capacity,
            backoff: config.reconnect_backoff,
            watched: config.watched_keys.clone(),
            initial: Some(config.active_key.clone()),
            idle_eviction: config.idle_eviction(),
            eviction_sweep: config.eviction_sweep(),
        },
    );

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, store, router.clone(), persistence));

    // ── 5. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("Shutdown signal received, stopping gracefully");

    router.shutdown().await;
    if let Err(e) = router_task.await {
        error!(error = %e, "router task failed");
    }
    writer.shutdown().await;

    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Kline Cache shut down complete.");
    Ok(())
}
