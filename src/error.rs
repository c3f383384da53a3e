// =============================================================================
// Error taxonomy for the kline cache
// =============================================================================
//
// Feed-side errors never terminate the process. Decode and ordering problems
// are dropped and counted, an exhausted reconnect budget becomes a health
// signal, and persistence failures leave the store running in memory only.
// =============================================================================

use thiserror::Error;

use crate::types::SeriesKey;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// Malformed or incomplete feed message.
    #[error("decode error: {0}")]
    Decode(String),

    /// Tick older than (or a rewrite of a finalized) last stored bar.
    #[error("order anomaly for {key}: last stored {last}, incoming {incoming}")]
    OrderAnomaly {
        key: SeriesKey,
        last: i64,
        incoming: i64,
    },

    /// Reconnect budget exhausted.
    #[error("feed unavailable for {key} after {attempts} reconnect attempts")]
    FeedUnavailable { key: SeriesKey, attempts: u32 },

    #[error("persistence error: {0}")]
    Persistence(String),

    /// Transport-level failure; drives the reconnect loop.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid series key: {0}")]
    InvalidKey(String),

    /// A later key switch replaced this one before it was applied.
    #[error("key switch superseded by a later request")]
    Superseded,

    #[error("subscription router is not running")]
    RouterClosed,
}

impl CacheError {
    /// Errors that are counted and dropped rather than surfaced.
    pub fn is_dropped_tick(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::OrderAnomaly { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CacheError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}
