use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::persistence::{PersistenceHandle, SeriesMap};
use crate::types::{SeriesKey, Tick};

/// Capacity of the change-notification channel. Slow subscribers lag and
/// skip notifications instead of holding up appends.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// What an accepted append did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    /// Strictly newer bar pushed (oldest evicted past capacity).
    Appended,
    /// Same bar updated in place.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Appended,
    Replaced,
    Restored,
    Evicted,
}

/// Notification fired whenever a key's window mutates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesChange {
    pub key: SeriesKey,
    pub kind: ChangeKind,
    pub len: usize,
    pub last_timestamp: Option<i64>,
}

/// Per-key summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSummary {
    pub key: SeriesKey,
    pub len: usize,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub keys: usize,
    pub appended: u64,
    pub replaced: u64,
    pub order_anomalies: u64,
}

struct SeriesWindow {
    ticks: VecDeque<Tick>,
    touched: Instant,
}

impl SeriesWindow {
    fn new(capacity: usize) -> Self {
        Self {
            ticks: VecDeque::with_capacity(capacity + 1),
            touched: Instant::now(),
        }
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.ticks.back().map(|t| t.timestamp)
    }
}

// ---------------------------------------------------------------------------
// SeriesStore -- bounded window per (symbol, interval)
// ---------------------------------------------------------------------------

/// Bounded, per-key time-series cache.
///
/// Each key owns a window of at most `capacity` ticks in ascending timestamp
/// order. A tick for the bar currently at the back of the window replaces it
/// in place; a strictly newer tick is pushed and the oldest tick is dropped
/// once the window is over capacity; an older tick is rejected.
///
/// Readers only ever receive copies. The lock is held for the duration of a
/// single mutation and never across an `.await`.
pub struct SeriesStore {
    windows: RwLock<HashMap<SeriesKey, SeriesWindow>>,
    capacity: usize,
    persistence: Option<PersistenceHandle>,
    changes: broadcast::Sender<SeriesChange>,
    appended: AtomicU64,
    replaced: AtomicU64,
    order_anomalies: AtomicU64,
}

impl SeriesStore {
    /// Create a store retaining at most `capacity` ticks per key.
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            persistence: None,
            changes,
            appended: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            order_anomalies: AtomicU64::new(0),
        }
    }

    /// Mirror every accepted append to `handle` (write-behind).
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Apply one tick to its key's window.
    pub fn append(&self, tick: Tick) -> Result<AppendOutcome, CacheError> {
        let key = tick.key.clone();

        let (outcome, len, last_timestamp, mirror) = {
            let mut map = self.windows.write();
            let window = map
                .entry(key.clone())
                .or_insert_with(|| SeriesWindow::new(self.capacity));

            let outcome = match window.ticks.back_mut() {
                Some(last) if tick.timestamp < last.timestamp => {
                    return Err(self.anomaly(&key, last.timestamp, tick.timestamp));
                }
                Some(last) if tick.timestamp == last.timestamp => {
                    // The feed's own bar-closed flag wins when both sides carry it.
                    if last.is_final() && tick.closed.is_some() {
                        return Err(self.anomaly(&key, last.timestamp, tick.timestamp));
                    }
                    *last = tick;
                    AppendOutcome::Replaced
                }
                _ => {
                    window.ticks.push_back(tick);
                    while window.ticks.len() > self.capacity {
                        window.ticks.pop_front();
                    }
                    AppendOutcome::Appended
                }
            };

            window.touched = Instant::now();
            let mirror = self
                .persistence
                .as_ref()
                .map(|_| window.ticks.iter().cloned().collect::<Vec<_>>());

            (outcome, window.ticks.len(), window.last_timestamp(), mirror)
        };

        match outcome {
            AppendOutcome::Appended => self.appended.fetch_add(1, Ordering::Relaxed),
            AppendOutcome::Replaced => self.replaced.fetch_add(1, Ordering::Relaxed),
        };

        if let (Some(handle), Some(ticks)) = (&self.persistence, mirror) {
            handle.save(key.clone(), ticks);
        }

        let kind = match outcome {
            AppendOutcome::Appended => ChangeKind::Appended,
            AppendOutcome::Replaced => ChangeKind::Replaced,
        };
        self.notify(SeriesChange {
            key,
            kind,
            len,
            last_timestamp,
        });

        Ok(outcome)
    }

    fn anomaly(&self, key: &SeriesKey, last: i64, incoming: i64) -> CacheError {
        self.order_anomalies.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, last, incoming, "out-of-order tick rejected");
        CacheError::OrderAnomaly {
            key: key.clone(),
            last,
            incoming,
        }
    }

    fn notify(&self, change: SeriesChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    /// The latest `n` ticks for `key` in ascending order (all if fewer).
    pub fn window(&self, key: &SeriesKey, n: usize) -> Vec<Tick> {
        let map = self.windows.read();
        match map.get(key) {
            Some(window) => {
                let skip = window.ticks.len().saturating_sub(n);
                window.ticks.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of ticks stored for `key`.
    pub fn len(&self, key: &SeriesKey) -> usize {
        self.windows.read().get(key).map_or(0, |w| w.ticks.len())
    }

    pub fn last_timestamp(&self, key: &SeriesKey) -> Option<i64> {
        self.windows.read().get(key).and_then(SeriesWindow::last_timestamp)
    }

    /// Remove every window untouched for at least `older_than`.
    pub fn evict_idle(&self, older_than: Duration) -> HashSet<SeriesKey> {
        self.evict_idle_except(older_than, &HashSet::new())
    }

    /// Like [`evict_idle`](Self::evict_idle), never removing keys in `keep`.
    pub fn evict_idle_except(
        &self,
        older_than: Duration,
        keep: &HashSet<SeriesKey>,
    ) -> HashSet<SeriesKey> {
        let now = Instant::now();
        let removed: HashSet<SeriesKey> = {
            let mut map = self.windows.write();
            let idle: Vec<SeriesKey> = map
                .iter()
                .filter(|(k, w)| !keep.contains(*k) && now.duration_since(w.touched) >= older_than)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &idle {
                map.remove(key);
            }
            idle.into_iter().collect()
        };

        for key in &removed {
            if let Some(handle) = &self.persistence {
                handle.remove(key.clone());
            }
            self.notify(SeriesChange {
                key: key.clone(),
                kind: ChangeKind::Evicted,
                len: 0,
                last_timestamp: None,
            });
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "idle series evicted");
            if let Some(handle) = &self.persistence {
                handle.flush_now();
            }
        }
        removed
    }

    /// Seed windows from a loaded snapshot.
    ///
    /// Ticks that do not strictly advance the timestamp are dropped, and only
    /// the newest `capacity` ticks of each key are kept.
    pub fn restore(&self, series: SeriesMap) {
        let mut restored = Vec::with_capacity(series.len());
        {
            let mut map = self.windows.write();
            for (key, ticks) in series {
                let mut window = SeriesWindow::new(self.capacity);
                let mut dropped = 0usize;
                for tick in ticks {
                    if tick.key != key
                        || window.last_timestamp().is_some_and(|last| tick.timestamp <= last)
                    {
                        dropped += 1;
                        continue;
                    }
                    window.ticks.push_back(tick);
                    if window.ticks.len() > self.capacity {
                        window.ticks.pop_front();
                    }
                }
                if dropped > 0 {
                    warn!(key = %key, dropped, "snapshot ticks out of order, dropped");
                }
                if window.ticks.is_empty() {
                    continue;
                }
                restored.push(SeriesChange {
                    key: key.clone(),
                    kind: ChangeKind::Restored,
                    len: window.ticks.len(),
                    last_timestamp: window.last_timestamp(),
                });
                map.insert(key, window);
            }
        }

        info!(keys = restored.len(), "series windows restored");
        for change in restored {
            self.notify(change);
        }
    }

    /// Every key with a window, sorted.
    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.windows.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Summaries of every cached key, sorted by key.
    pub fn summaries(&self) -> Vec<SeriesSummary> {
        let map = self.windows.read();
        let mut out: Vec<SeriesSummary> = map
            .iter()
            .map(|(key, w)| SeriesSummary {
                key: key.clone(),
                len: w.ticks.len(),
                first_timestamp: w.ticks.front().map(|t| t.timestamp),
                last_timestamp: w.last_timestamp(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Subscribe to window mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<SeriesChange> {
        self.changes.subscribe()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.windows.read().len(),
            appended: self.appended.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            order_anomalies: self.order_anomalies.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
