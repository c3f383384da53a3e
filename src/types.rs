// =============================================================================
// Shared types used across the kline cache
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CacheError;

// =============================================================================
// Interval
// =============================================================================

/// Kline interval as published by the exchange stream names.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CacheError;

    // Case matters: "1m" is a minute, "1M" is a month.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|iv| iv.as_str() == s.trim())
            .ok_or_else(|| CacheError::InvalidKey(format!("unknown interval '{s}'")))
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// SeriesKey
// =============================================================================

/// Identifies one logical series: a lowercase symbol and an interval.
///
/// Rendered and parsed as `"symbol:interval"`, which is also the key format
/// of the persisted snapshot.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(symbol: impl AsRef<str>, interval: Interval) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_lowercase(),
            interval,
        }
    }

    /// Name of the single-stream kline channel, e.g. `ethusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol, self.interval)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.interval)
    }
}

impl FromStr for SeriesKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, interval) = s
            .split_once(':')
            .ok_or_else(|| CacheError::InvalidKey(format!("expected symbol:interval, got '{s}'")))?;

        let symbol = symbol.trim();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CacheError::InvalidKey(format!("invalid symbol '{symbol}'")));
        }

        Ok(Self::new(symbol, interval.parse()?))
    }
}

impl Serialize for SeriesKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SeriesKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// One OHLC sample for a time bucket of a series.
///
/// `timestamp` is the bar open time in epoch milliseconds. `closed` carries
/// the feed's bar-closed flag when the feed provides one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub key: SeriesKey,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub closed: Option<bool>,
}

impl Tick {
    /// Build a tick, rejecting non-finite prices and broken OHLC bounds.
    pub fn new(
        key: SeriesKey,
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        closed: Option<bool>,
    ) -> Result<Self, CacheError> {
        for (name, v) in [("open", open), ("high", high), ("low", low), ("close", close)] {
            if !v.is_finite() {
                return Err(CacheError::Decode(format!("{name} is not finite: {v}")));
            }
        }
        if low > open.min(close) || high < open.max(close) || low > high {
            return Err(CacheError::Decode(format!(
                "OHLC bounds violated: o={open} h={high} l={low} c={close}"
            )));
        }

        Ok(Self {
            key,
            timestamp,
            open,
            high,
            low,
            close,
            closed,
        })
    }

    pub fn is_final(&self) -> bool {
        self.closed == Some(true)
    }
}

// =============================================================================
// FeedHealth
// =============================================================================

/// Connection health of one series feed, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedHealth {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Unavailable,
    Closed,
}

impl FeedHealth {
    /// Whether data for the key can no longer be trusted to be current.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Closed)
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::Connecting
    }
}

impl fmt::Display for FeedHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Live => write!(f, "Live"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting({attempt})"),
            Self::Unavailable => write!(f, "Unavailable"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
