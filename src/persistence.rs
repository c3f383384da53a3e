// =============================================================================
// Persistence — Durable snapshot of the series cache
// =============================================================================
//
// The cache is mirrored to a versioned JSON snapshot:
//
//   { "version": 1, "series": { "ethusdt:1m": [ { "t": .., "o": .., ... } ] } }
//
// Writes are write-behind. `PersistenceHandle::save` only records the newest
// window for a key in a coalescing map; a background writer flushes the map on
// a fixed interval. A slow disk therefore costs at most one pending window per
// key, never an unbounded queue.
//
// Snapshot files are replaced atomically (tmp + rename), the same way the
// runtime config is saved.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::types::{SeriesKey, Tick};

/// Bump when the snapshot schema changes.
pub const SNAPSHOT_VERSION: u32 = 1;

pub type SeriesMap = HashMap<SeriesKey, Vec<Tick>>;

// =============================================================================
// Snapshot format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct TickRecord {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    #[serde(default)]
    series: BTreeMap<String, Vec<TickRecord>>,
}

fn encode_snapshot(series: &SeriesMap) -> Result<String> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        series: series
            .iter()
            .map(|(key, ticks)| {
                let records = ticks
                    .iter()
                    .map(|t| TickRecord {
                        t: t.timestamp,
                        o: t.open,
                        h: t.high,
                        l: t.low,
                        c: t.close,
                        x: t.closed,
                    })
                    .collect();
                (key.to_string(), records)
            })
            .collect(),
    };

    serde_json::to_string(&file).context("failed to serialise series snapshot")
}

fn decode_snapshot(content: &str) -> Result<SeriesMap> {
    let file: SnapshotFile =
        serde_json::from_str(content).context("failed to parse series snapshot")?;

    if file.version != SNAPSHOT_VERSION {
        bail!(
            "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
            file.version
        );
    }

    let mut series = SeriesMap::with_capacity(file.series.len());
    for (raw_key, records) in file.series {
        let key: SeriesKey = match raw_key.parse() {
            Ok(k) => k,
            Err(e) => {
                warn!(key = %raw_key, error = %e, "skipping snapshot entry with invalid key");
                continue;
            }
        };

        let ticks: Vec<Tick> = records
            .into_iter()
            .filter_map(|r| match Tick::new(key.clone(), r.t, r.o, r.h, r.l, r.c, r.x) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping invalid tick from snapshot");
                    None
                }
            })
            .collect();

        series.insert(key, ticks);
    }

    Ok(series)
}

// =============================================================================
// SnapshotStore
// =============================================================================

/// Durable home of the series snapshot.
pub trait SnapshotStore: Send + Sync + 'static {
    fn load_all(&self) -> Result<SeriesMap>;
    fn save_all(&self, series: &SeriesMap) -> Result<()>;
}

/// Snapshot kept in a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load_all(&self) -> Result<SeriesMap> {
        if !self.path.exists() {
            return Ok(SeriesMap::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read snapshot from {}", self.path.display()))?;
        decode_snapshot(&content)
            .with_context(|| format!("failed to decode snapshot {}", self.path.display()))
    }

    fn save_all(&self, series: &SeriesMap) -> Result<()> {
        let content = encode_snapshot(series)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", self.path.display()))?;

        debug!(path = %self.path.display(), keys = series.len(), "series snapshot written");
        Ok(())
    }
}

/// Load the snapshot once at startup. Any failure degrades to an empty cache.
pub fn load_or_empty(store: &dyn SnapshotStore) -> SeriesMap {
    match store.load_all() {
        Ok(series) => {
            info!(keys = series.len(), "series snapshot loaded");
            series
        }
        Err(e) => {
            let err = CacheError::Persistence(format!("{e:#}"));
            warn!(error = %err, "snapshot unavailable, starting with an empty cache");
            SeriesMap::new()
        }
    }
}

// =============================================================================
// Write-behind writer
// =============================================================================

#[derive(Default)]
struct Shared {
    /// Newest window per key; `None` marks a key for removal.
    pending: Mutex<HashMap<SeriesKey, Option<Vec<Tick>>>>,
    flush_requested: Notify,
    writes: AtomicU64,
    failures: AtomicU64,
}

/// Cheap cloneable handle used by the store to mirror windows.
#[derive(Clone, Default)]
pub struct PersistenceHandle {
    shared: Arc<Shared>,
}

/// Counters exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PersistenceStats {
    pub writes: u64,
    pub failures: u64,
    pub pending_keys: usize,
}

impl PersistenceHandle {
    /// Record the latest window for `key`. Never blocks on I/O.
    pub fn save(&self, key: SeriesKey, window: Vec<Tick>) {
        self.shared.pending.lock().insert(key, Some(window));
    }

    /// Drop `key` from the snapshot on the next flush.
    pub fn remove(&self, key: SeriesKey) {
        self.shared.pending.lock().insert(key, None);
    }

    /// Ask the writer to flush without waiting for the next interval.
    pub fn flush_now(&self) {
        self.shared.flush_requested.notify_one();
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            writes: self.shared.writes.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            pending_keys: self.shared.pending.lock().len(),
        }
    }
}

/// Owner of the background writer task.
pub struct PersistenceWriter {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Spawn the writer. `persisted` is the snapshot as loaded at startup so
    /// that keys without fresh ticks survive the next flush.
    pub fn spawn(
        store: Arc<dyn SnapshotStore>,
        persisted: SeriesMap,
        flush_interval: Duration,
    ) -> (PersistenceHandle, PersistenceWriter) {
        let handle = PersistenceHandle::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_writer(
            store,
            persisted,
            handle.shared.clone(),
            flush_interval,
            shutdown_rx,
        ));

        (handle, PersistenceWriter { shutdown_tx, task })
    }

    /// Flush whatever is pending and stop the writer.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "persistence writer task failed");
        }
    }
}

async fn run_writer(
    store: Arc<dyn SnapshotStore>,
    mut persisted: SeriesMap,
    shared: Arc<Shared>,
    flush_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.flush_requested.notified() => {}
            _ = shutdown_rx.changed() => {
                flush(&store, persisted, &shared).await;
                info!("persistence writer stopped");
                return;
            }
        }
        persisted = flush(&store, persisted, &shared).await;
    }
}

async fn flush(store: &Arc<dyn SnapshotStore>, mut persisted: SeriesMap, shared: &Shared) -> SeriesMap {
    let pending = std::mem::take(&mut *shared.pending.lock());
    if pending.is_empty() {
        return persisted;
    }

    let changed = pending.len();
    for (key, window) in pending {
        match window {
            Some(ticks) => {
                persisted.insert(key, ticks);
            }
            None => {
                persisted.remove(&key);
            }
        }
    }

    let store = store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let res = store.save_all(&persisted);
        (persisted, res)
    })
    .await;

    match result {
        Ok((persisted, Ok(()))) => {
            shared.writes.fetch_add(1, Ordering::Relaxed);
            debug!(changed, "snapshot flushed");
            persisted
        }
        Ok((persisted, Err(e))) => {
            shared.failures.fetch_add(1, Ordering::Relaxed);
            let err = CacheError::Persistence(format!("{e:#}"));
            warn!(error = %err, "snapshot flush failed, cache continues in memory");
            persisted
        }
        Err(e) => {
            // The blocking task panicked and took the map with it; the next
            // successful flush rewrites from whatever is pending then.
            shared.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "snapshot flush task failed");
            SeriesMap::new()
        }
    }
}

// =============================================================================
// In-memory store (tests)
// =============================================================================

#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    content: Mutex<Option<String>>,
    pub writes: AtomicU64,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_content(content: &str) -> Self {
        Self {
            content: Mutex::new(Some(content.to_string())),
            writes: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
impl SnapshotStore for MemoryStore {
    fn load_all(&self) -> Result<SeriesMap> {
        match self.content.lock().as_deref() {
            Some(content) => decode_snapshot(content),
            None => Ok(SeriesMap::new()),
        }
    }

    fn save_all(&self, series: &SeriesMap) -> Result<()> {
        *self.content.lock() = Some(encode_snapshot(series)?);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
