// =============================================================================
// Central Application State — Kline Cache
// =============================================================================
//
// Ties the cache subsystems together for the API layer. Every subsystem
// manages its own interior mutability; AppState only holds handles to them
// and assembles read-only snapshots for the dashboard endpoints.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::feed::FeedStatsSnapshot;
use crate::market_data::series_store::StoreStats;
use crate::market_data::{RouterHandle, SeriesStore};
use crate::persistence::{PersistenceHandle, PersistenceStats};
use crate::runtime_config::RuntimeConfig;
use crate::types::{FeedHealth, Interval, SeriesKey};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// AppState
// =============================================================================

/// Shared across all handlers via `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<SeriesStore>,
    pub router: RouterHandle,
    pub persistence: PersistenceHandle,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<SeriesStore>,
        router: RouterHandle,
        persistence: PersistenceHandle,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            router,
            persistence,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Record an error message; the oldest entry is dropped past
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Window length used for reads when the caller gives none.
    pub fn window_capacity(&self) -> usize {
        self.store.capacity()
    }

    // ── Snapshot Builders ───────────────────────────────────────────────

    pub fn build_health(&self) -> HealthSnapshot {
        let config = self.runtime_config.read();
        HealthSnapshot {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
            window_capacity: self.store.capacity(),
            series_keys: self.store.keys(),
            symbols: config.symbols.clone(),
            intervals: config.intervals.clone(),
            store: self.store.stats(),
            feeds: self.router.feed_stats(),
            persistence: self.persistence.stats(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    /// Every cached series with its feed health, sorted by key.
    pub fn build_series_list(&self) -> Vec<SeriesEntry> {
        self.store
            .summaries()
            .into_iter()
            .map(|s| SeriesEntry {
                health: self.router.health(&s.key),
                key: s.key,
                len: s.len,
                first_timestamp: s.first_timestamp,
                last_timestamp: s.last_timestamp,
            })
            .collect()
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub server_time: i64,
    pub window_capacity: usize,
    pub series_keys: Vec<SeriesKey>,
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    pub store: StoreStats,
    pub feeds: FeedStatsSnapshot,
    pub persistence: PersistenceStats,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesEntry {
    pub key: SeriesKey,
    pub len: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    /// `None` when the key was restored from disk and never subscribed.
    pub health: Option<FeedHealth>,
}
