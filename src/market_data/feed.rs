// =============================================================================
// Feed Connection — One kline subscription with reconnect
// =============================================================================
//
// A FeedConnection owns a single background task that:
//   1. Connects through a `FeedTransport` for one (symbol, interval) key.
//   2. Decodes every text frame into a Tick; bad frames are counted and
//      dropped.
//   3. On disconnect, reconnects with exponential backoff (full jitter) until
//      the attempt budget is spent, then reports the feed as unavailable.
//
// Ticks go to a bounded channel. When the consumer falls behind the task
// waits on the send, which stops socket reads (backpressure).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::market_data::kline::{decode_kline, kline_url};
use crate::runtime_config::BackoffConfig;
use crate::types::{FeedHealth, SeriesKey, Tick};

/// Text frames of one live connection.
pub type MessageStream = BoxStream<'static, Result<String, CacheError>>;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Opens the raw message stream for a key.
pub trait FeedTransport: Send + Sync + 'static {
    fn connect(&self, key: &SeriesKey) -> BoxFuture<'static, Result<MessageStream, CacheError>>;
}

/// Binance raw kline streams over tokio-tungstenite.
pub struct BinanceTransport {
    base_url: String,
}

impl BinanceTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl FeedTransport for BinanceTransport {
    fn connect(&self, key: &SeriesKey) -> BoxFuture<'static, Result<MessageStream, CacheError>> {
        let url = kline_url(&self.base_url, key);
        Box::pin(async move {
            info!(url = %url, "connecting to kline WebSocket");
            let (ws_stream, _response) = connect_async(url.as_str()).await?;
            info!(url = %url, "kline WebSocket connected");

            // Ping / Pong / Binary frames are dropped; tungstenite answers
            // pings on its own. A Close frame ends the connection.
            let frames = ws_stream.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(frame)) => Some(Err(CacheError::Transport(format!(
                        "closed by server: {frame:?}"
                    )))),
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            });
            Ok(frames.boxed())
        })
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

impl BackoffConfig {
    /// Upper bound of the delay before retry number `retry` (0-based):
    /// `min(cap, base * 2^retry)`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let multiplier = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let ms = self.base_ms.saturating_mul(multiplier).min(self.cap_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retry number `retry`, full jitter when enabled.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        if !self.jitter {
            return ceiling;
        }
        let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Events & counters
// ---------------------------------------------------------------------------

/// Everything a feed task reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    Health {
        key: SeriesKey,
        connection: u64,
        health: FeedHealth,
    },
    /// Reconnect budget exhausted; the task has stopped.
    Unavailable {
        key: SeriesKey,
        connection: u64,
        error: CacheError,
    },
}

/// Counters shared by every feed task.
#[derive(Debug, Default)]
pub struct FeedStats {
    messages: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
    unavailable: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeedStatsSnapshot {
    pub messages: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
    pub unavailable: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// FeedConnection
// ---------------------------------------------------------------------------

/// Handle to one running feed task.
///
/// `close` stops the task and waits for it, so the transport is released
/// before it returns. Dropping the handle without closing aborts the task.
pub struct FeedConnection {
    key: SeriesKey,
    id: u64,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FeedConnection {
    pub fn open(
        key: SeriesKey,
        id: u64,
        transport: Arc<dyn FeedTransport>,
        backoff: BackoffConfig,
        stats: Arc<FeedStats>,
        sink: mpsc::Sender<FeedEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let feed = FeedTask {
            key: key.clone(),
            id,
            transport,
            backoff,
            stats,
            sink,
            shutdown: shutdown_rx,
        };
        debug!(key = %key, connection = id, "feed task spawned");

        Self {
            key,
            id,
            shutdown_tx,
            task: Some(tokio::spawn(feed.run())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop the feed task and wait for it to release the transport.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!(key = %self.key, error = %e, "feed task ended abnormally");
            }
        }
        info!(key = %self.key, connection = self.id, "feed closed");
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Feed task
// ---------------------------------------------------------------------------

struct FeedTask {
    key: SeriesKey,
    id: u64,
    transport: Arc<dyn FeedTransport>,
    backoff: BackoffConfig,
    stats: Arc<FeedStats>,
    sink: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
}

enum PumpExit {
    /// Connection lost; `delivered` is true if any tick got through.
    Disconnected { delivered: bool },
    /// Shutdown requested or nobody is listening any more.
    Stop,
}

impl FeedTask {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                res = self.transport.connect(&self.key) => res,
            };

            match connected {
                Ok(stream) => {
                    if !self.health(FeedHealth::Live).await {
                        return;
                    }
                    match self.pump(stream).await {
                        PumpExit::Stop => return,
                        PumpExit::Disconnected { delivered } => {
                            if delivered {
                                failures = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, attempt = failures, "kline connect failed");
                }
            }

            if failures >= self.backoff.max_attempts {
                self.stats.unavailable.fetch_add(1, Ordering::Relaxed);
                let error = CacheError::FeedUnavailable {
                    key: self.key.clone(),
                    attempts: failures,
                };
                error!(key = %self.key, error = %error, "giving up on kline feed");
                self.emit(FeedEvent::Unavailable {
                    key: self.key.clone(),
                    connection: self.id,
                    error,
                })
                .await;
                return;
            }

            let delay = self.backoff.delay(failures);
            failures += 1;
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(
                key = %self.key,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "kline stream down, reconnecting"
            );
            if !self.health(FeedHealth::Reconnecting { attempt: failures }).await {
                return;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(&mut self, mut stream: MessageStream) -> PumpExit {
        let mut delivered = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return PumpExit::Stop,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(text)) => {
                    self.stats.messages.fetch_add(1, Ordering::Relaxed);
                    match decode_kline(&text, &self.key) {
                        Ok(tick) => {
                            delivered = true;
                            if !self.emit(FeedEvent::Tick(tick)).await {
                                return PumpExit::Stop;
                            }
                        }
                        Err(e) => {
                            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(key = %self.key, error = %e, "dropping kline message");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(key = %self.key, error = %e, "kline stream error");
                    return PumpExit::Disconnected { delivered };
                }
                None => {
                    warn!(key = %self.key, "kline stream ended");
                    return PumpExit::Disconnected { delivered };
                }
            }
        }
    }

    async fn health(&mut self, health: FeedHealth) -> bool {
        let event = FeedEvent::Health {
            key: self.key.clone(),
            connection: self.id,
            health,
        };
        self.emit(event).await
    }

    /// Send to the consumer; false when the task should stop.
    async fn emit(&mut self, event: FeedEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            res = self.sink.send(event) => res.is_ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted transport (tests)
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::Interval;

    fn backoff(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base_ms: 500,
            cap_ms: 30_000,
            max_attempts,
            jitter: false,
        }
    }

    fn eth() -> SeriesKey {
        SeriesKey::new("ethusdt", Interval::M1)
    }

    fn open(
        transport: Arc<ScriptedTransport>,
        cfg: BackoffConfig,
    ) -> (FeedConnection, mpsc::Receiver<FeedEvent>, Arc<FeedStats>) {
        let (tx, rx) = mpsc::channel(64);
        let stats = Arc::new(FeedStats::default());
        let conn = FeedConnection::open(eth(), 1, transport, cfg, stats.clone(), tx);
        (conn, rx, stats)
    }

    /// Drain events until the feed reports itself unavailable.
    async fn until_unavailable(rx: &mut mpsc::Receiver<FeedEvent>) -> (Vec<Tick>, CacheError) {
        let mut ticks = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                FeedEvent::Tick(t) => ticks.push(t),
                FeedEvent::Unavailable { error, .. } => return (ticks, error),
                FeedEvent::Health { .. } => {}
            }
        }
        panic!("feed channel closed before unavailable");
    }

    fn gaps_ms(at: &[tokio::time::Instant]) -> Vec<u128> {
        at.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect()
    }

    #[test]
    fn backoff_ceiling_doubles_then_caps() {
        let cfg = backoff(10);
        let ceilings: Vec<u128> = (0..8).map(|n| cfg.ceiling(n).as_millis()).collect();
        assert_eq!(
            ceilings,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        assert_eq!(cfg.ceiling(200), Duration::from_secs(30));
    }

    #[test]
    fn full_jitter_stays_under_ceiling() {
        let cfg = BackoffConfig { jitter: true, ..backoff(10) };
        for retry in 0..10 {
            for _ in 0..50 {
                assert!(cfg.delay(retry) <= cfg.ceiling(retry));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_after_budget_with_exact_delays() {
        let transport = Arc::new(ScriptedTransport::new(Script::Fail));
        let (mut conn, mut rx, stats) = open(transport.clone(), backoff(3));

        let (ticks, error) = until_unavailable(&mut rx).await;
        assert!(ticks.is_empty());
        assert_eq!(error, CacheError::FeedUnavailable { key: eth(), attempts: 3 });

        let connects = transport.connects_for(&eth());
        assert_eq!(connects.len(), 4);
        assert_eq!(gaps_ms(&connects), vec![500, 1_000, 2_000]);
        assert_eq!(stats.snapshot().reconnects, 3);
        assert_eq!(stats.snapshot().unavailable, 1);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_ticks_reset_the_budget() {
        let transport = Arc::new(
            ScriptedTransport::new(Script::Fail).script(
                &eth(),
                vec![
                    Script::Fail,
                    Script::Messages(vec![kline_json(&eth(), 60_000, 10.0, false)]),
                ],
            ),
        );
        let (mut conn, mut rx, _stats) = open(transport.clone(), backoff(2));

        let (ticks, _) = until_unavailable(&mut rx).await;
        assert_eq!(ticks.len(), 1);

        // fail -> 500 -> messages (reset) -> 500 -> fail -> 1000 -> fail -> give up
        let connects = transport.connects_for(&eth());
        assert_eq!(gaps_ms(&connects), vec![500, 500, 1_000]);

        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_counted_not_fatal() {
        let frames = vec![
            kline_json(&eth(), 60_000, 10.0, false),
            "{\"k\": {\"t\": 1}}".to_string(),
            "garbage".to_string(),
            kline_json(&eth(), 60_000, 11.0, true),
        ];
        let transport = Arc::new(
            ScriptedTransport::new(Script::Fail)
                .script(&eth(), vec![Script::MessagesThenHang(frames)]),
        );
        let (mut conn, mut rx, stats) = open(transport.clone(), backoff(3));

        let mut ticks = Vec::new();
        while ticks.len() < 2 {
            if let Some(FeedEvent::Tick(t)) = rx.recv().await {
                ticks.push(t);
            }
        }
        assert_eq!(ticks[1].closed, Some(true));
        assert_eq!(stats.snapshot().decode_errors, 2);
        assert_eq!(stats.snapshot().messages, 4);
        assert_eq!(transport.live(), 1);

        conn.close().await;
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_backoff() {
        let cfg = BackoffConfig {
            base_ms: 10_000,
            ..backoff(5)
        };
        let transport = Arc::new(ScriptedTransport::new(Script::Fail));
        let (mut conn, mut rx, _stats) = open(transport.clone(), cfg);

        // Wait for the first retry to be scheduled.
        loop {
            if let Some(FeedEvent::Health { health: FeedHealth::Reconnecting { .. }, .. }) =
                rx.recv().await
            {
                break;
            }
        }

        let started = tokio::time::Instant::now();
        conn.close().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(conn.is_closed());
        assert_eq!(transport.connects_for(&eth()).len(), 1);

        // Idempotent.
        conn.close().await;
    }
}
