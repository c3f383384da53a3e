// =============================================================================
// Runtime Configuration — Cache, feed and persistence settings
// =============================================================================
//
// Every tunable lives here. The file is JSON; every field carries a serde
// default so that an older or partial file still loads. Saving uses the
// atomic tmp + rename pattern.
//
// Environment overrides (applied after load, see `apply_env`):
//   KLINE_CACHE_ACTIVE     symbol:interval shown on startup
//   KLINE_CACHE_WATCH      comma-separated symbol:interval list kept live
//   KLINE_CACHE_BIND_ADDR  API listen address
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Interval, SeriesKey};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_window_capacity() -> usize {
    50
}

fn default_active_key() -> SeriesKey {
    SeriesKey::new("ethusdt", Interval::M1)
}

fn default_symbols() -> Vec<String> {
    vec![
        "ethusdt".to_string(),
        "bnbusdt".to_string(),
        "dotusdt".to_string(),
    ]
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::M1, Interval::M3, Interval::M5]
}

fn default_feed_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_snapshot_path() -> String {
    "candlestick_data.json".to_string()
}

fn default_idle_eviction_secs() -> u64 {
    3_600
}

fn default_eviction_sweep_secs() -> u64 {
    60
}

fn default_bind_addr() -> String {
    "0.0.0.0:3002".to_string()
}

fn default_base_ms() -> u64 {
    500
}

fn default_cap_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

// =============================================================================
// BackoffConfig
// =============================================================================

/// Reconnect policy for feed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay ceiling of the first retry.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Consecutive failed reconnects before the feed is declared unavailable.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Full jitter: each delay is drawn uniformly from `[0, ceiling]`.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            max_attempts: default_max_attempts(),
            jitter: true,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Cache ---------------------------------------------------------------

    /// Ticks retained per series.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Series shown when the service starts.
    #[serde(default = "default_active_key")]
    pub active_key: SeriesKey,

    /// Series kept subscribed regardless of the active selection.
    #[serde(default)]
    pub watched_keys: Vec<SeriesKey>,

    /// Symbols offered for selection.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Intervals offered for selection.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,

    // --- Feed ----------------------------------------------------------------

    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,

    #[serde(default)]
    pub reconnect_backoff: BackoffConfig,

    // --- Persistence & eviction ----------------------------------------------

    /// Writes arriving within one interval are coalesced into a single flush.
    #[serde(default = "default_flush_interval_ms")]
    pub persistence_flush_interval_ms: u64,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Series untouched for this long are dropped. 0 disables eviction.
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,

    #[serde(default = "default_eviction_sweep_secs")]
    pub eviction_sweep_secs: u64,

    // --- API -----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            active_key: default_active_key(),
            watched_keys: Vec::new(),
            symbols: default_symbols(),
            intervals: default_intervals(),
            feed_base_url: default_feed_base_url(),
            reconnect_backoff: BackoffConfig::default(),
            persistence_flush_interval_ms: default_flush_interval_ms(),
            snapshot_path: default_snapshot_path(),
            idle_eviction_secs: default_idle_eviction_secs(),
            eviction_sweep_secs: default_eviction_sweep_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            active = %config.active_key,
            watched = config.watched_keys.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply overrides from a variable lookup (normally `std::env::var`).
    ///
    /// Invalid values are logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("KLINE_CACHE_ACTIVE") {
            match raw.parse::<SeriesKey>() {
                Ok(key) => self.active_key = key,
                Err(e) => warn!(value = %raw, error = %e, "ignoring KLINE_CACHE_ACTIVE"),
            }
        }

        if let Some(raw) = lookup("KLINE_CACHE_WATCH") {
            let mut watched = Vec::new();
            for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match part.parse::<SeriesKey>() {
                    Ok(key) if !watched.contains(&key) => watched.push(key),
                    Ok(_) => {}
                    Err(e) => warn!(value = %part, error = %e, "ignoring watched key"),
                }
            }
            self.watched_keys = watched;
        }

        if let Some(addr) = lookup("KLINE_CACHE_BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            self.bind_addr = addr.trim().to_string();
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_flush_interval_ms)
    }

    /// `None` when idle eviction is disabled.
    pub fn idle_eviction(&self) -> Option<Duration> {
        (self.idle_eviction_secs > 0).then(|| Duration::from_secs(self.idle_eviction_secs))
    }

    pub fn eviction_sweep(&self) -> Duration {
        Duration::from_secs(self.eviction_sweep_secs.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.window_capacity, 50);
        assert_eq!(cfg.active_key.to_string(), "ethusdt:1m");
        assert!(cfg.watched_keys.is_empty());
        assert_eq!(cfg.symbols, vec!["ethusdt", "bnbusdt", "dotusdt"]);
        assert_eq!(cfg.intervals, vec![Interval::M1, Interval::M3, Interval::M5]);
        assert_eq!(cfg.reconnect_backoff.base_ms, 500);
        assert_eq!(cfg.reconnect_backoff.cap_ms, 30_000);
        assert_eq!(cfg.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.window_capacity, 50);
        assert_eq!(cfg.reconnect_backoff, BackoffConfig::default());
        assert_eq!(cfg.bind_addr, "0.0.0.0:3002");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "window_capacity": 3,
            "watched_keys": ["BNBUSDT:5m"],
            "reconnect_backoff": { "max_attempts": 2 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.window_capacity, 3);
        assert_eq!(cfg.watched_keys, vec![SeriesKey::new("bnbusdt", Interval::M5)]);
        assert_eq!(cfg.reconnect_backoff.max_attempts, 2);
        assert_eq!(cfg.reconnect_backoff.base_ms, 500);
        assert!(cfg.reconnect_backoff.jitter);
    }

    #[test]
    fn invalid_key_in_file_fails_to_parse() {
        let json = r#"{ "active_key": "ethusdt-1m" }"#;
        assert!(serde_json::from_str::<RuntimeConfig>(json).is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kline_cache.json");

        let mut cfg = RuntimeConfig::default();
        cfg.watched_keys = vec![SeriesKey::new("dotusdt", Interval::M3)];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.watched_keys, cfg.watched_keys);
        assert_eq!(loaded.active_key, cfg.active_key);
        assert!(RuntimeConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn env_overrides_apply_and_skip_invalid() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("KLINE_CACHE_ACTIVE", "BNBUSDT:3m"),
            ("KLINE_CACHE_WATCH", "ethusdt:1m, nonsense, ethusdt:1m ,dotusdt:5m"),
            ("KLINE_CACHE_BIND_ADDR", "127.0.0.1:9000"),
        ]);
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.active_key, SeriesKey::new("bnbusdt", Interval::M3));
        assert_eq!(
            cfg.watched_keys,
            vec![
                SeriesKey::new("ethusdt", Interval::M1),
                SeriesKey::new("dotusdt", Interval::M5),
            ]
        );
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn invalid_active_override_keeps_previous() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|k| (k == "KLINE_CACHE_ACTIVE").then(|| "ethusdt:2x".to_string()));
        assert_eq!(cfg.active_key, default_active_key());
    }

    #[test]
    fn zero_idle_eviction_disables_sweep() {
        let cfg = RuntimeConfig {
            idle_eviction_secs: 0,
            ..RuntimeConfig::default()
        };
        assert!(cfg.idle_eviction().is_none());
    }
}
