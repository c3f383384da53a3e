// =============================================================================
// Subscription Router — Active key selection and replay-on-switch
// =============================================================================
//
// The router is the single event loop of the cache. It owns every
// FeedConnection, applies every feed event to the SeriesStore in delivery
// order, and publishes the active key's window to observers.
//
// Key switches arrive as commands and are handled one at a time. Switches
// that queue up while one is being applied are coalesced: only the newest is
// applied, the others are answered with `Superseded`, and no connection is
// opened for them.
//
// On activation the buffered window for the new key is published at once,
// before any new tick for it arrives.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::market_data::feed::{
    FeedConnection, FeedEvent, FeedStats, FeedStatsSnapshot, FeedTransport,
};
use crate::market_data::series_store::SeriesStore;
use crate::runtime_config::BackoffConfig;
use crate::types::{FeedHealth, SeriesKey, Tick};

/// Buffered feed events across all connections.
const FEED_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Public types
// =============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub window_capacity: usize,
    pub backoff: BackoffConfig,
    pub watched: Vec<SeriesKey>,
    pub initial: Option<SeriesKey>,
    /// Windows idle this long are dropped; `None` disables the sweep.
    pub idle_eviction: Option<Duration>,
    pub eviction_sweep: Duration,
}

/// What a consumer of the active series sees.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveView {
    pub key: Option<SeriesKey>,
    pub ticks: Vec<Tick>,
    pub health: FeedHealth,
    /// Last-known window shown while the feed is down.
    pub stale: bool,
    pub version: u64,
}

impl ActiveView {
    fn empty() -> Self {
        Self {
            key: None,
            ticks: Vec::new(),
            health: FeedHealth::Closed,
            stale: false,
            version: 0,
        }
    }
}

enum Command {
    SetActive {
        key: SeriesKey,
        reply: oneshot::Sender<Result<ActiveView, CacheError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// RouterHandle
// =============================================================================

/// Cloneable handle to a running router.
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ActiveView>,
    health: Arc<RwLock<HashMap<SeriesKey, FeedHealth>>>,
    stats: Arc<FeedStats>,
}

impl RouterHandle {
    /// Make `key` the active series and return its replayed window.
    pub async fn set_active_key(&self, key: SeriesKey) -> Result<ActiveView, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetActive { key, reply })
            .await
            .map_err(|_| CacheError::RouterClosed)?;
        rx.await.map_err(|_| CacheError::RouterClosed)?
    }

    /// Receiver notified on every change of the active view.
    pub fn active_view(&self) -> watch::Receiver<ActiveView> {
        self.view.clone()
    }

    /// Snapshot of the current active view.
    pub fn current_view(&self) -> ActiveView {
        self.view.borrow().clone()
    }

    pub fn health(&self, key: &SeriesKey) -> Option<FeedHealth> {
        self.health.read().get(key).copied()
    }

    pub fn feed_stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close every connection and stop the router.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// =============================================================================
// SubscriptionRouter
// =============================================================================

pub struct SubscriptionRouter {
    store: Arc<SeriesStore>,
    transport: Arc<dyn FeedTransport>,
    config: RouterConfig,
    watched: HashSet<SeriesKey>,
    active: Option<SeriesKey>,
    connections: HashMap<SeriesKey, FeedConnection>,
    next_connection: u64,
    version: u64,
    events_tx: mpsc::Sender<FeedEvent>,
    events_rx: mpsc::Receiver<FeedEvent>,
    commands_rx: mpsc::Receiver<Command>,
    view_tx: watch::Sender<ActiveView>,
    health: Arc<RwLock<HashMap<SeriesKey, FeedHealth>>>,
    stats: Arc<FeedStats>,
}

impl SubscriptionRouter {
    /// Spawn the router task.
    pub fn spawn(
        store: Arc<SeriesStore>,
        transport: Arc<dyn FeedTransport>,
        config: RouterConfig,
    ) -> (RouterHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let (view_tx, view_rx) = watch::channel(ActiveView::empty());
        let health = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(FeedStats::default());

        let router = Self {
            store,
            transport,
            watched: config.watched.iter().cloned().collect(),
            config,
            active: None,
            connections: HashMap::new(),
            next_connection: 1,
            version: 0,
            events_tx,
            events_rx,
            commands_rx,
            view_tx,
            health: health.clone(),
            stats: stats.clone(),
        };

        let handle = RouterHandle {
            commands: commands_tx,
            view: view_rx,
            health,
            stats,
        };

        (handle, tokio::spawn(router.run()))
    }

    async fn run(mut self) {
        let watched: Vec<SeriesKey> = self.config.watched.clone();
        for key in watched {
            self.ensure_connection(&key);
        }
        if let Some(initial) = self.config.initial.clone() {
            self.activate(initial).await;
        }
        info!(
            watched = self.watched.len(),
            active = ?self.active.as_ref().map(ToString::to_string),
            "subscription router running"
        );

        // Sweeps run on this loop so they never interleave with an append.
        let mut sweep = tokio::time::interval(self.config.eviction_sweep.max(Duration::from_secs(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sweep.tick(), if self.config.idle_eviction.is_some() => self.sweep_idle(),
                cmd = self.commands_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            return;
                        }
                    }
                    None => {
                        self.close_all().await;
                        return;
                    }
                },
                Some(event) = self.events_rx.recv() => self.apply(event),
            }
        }
    }

    /// Returns false once the router should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        let (mut key, mut reply) = match cmd {
            Command::SetActive { key, reply } => (key, reply),
            Command::Shutdown { reply } => {
                self.close_all().await;
                let _ = reply.send(());
                return false;
            }
        };

        // Only the newest queued switch is applied.
        while let Ok(next) = self.commands_rx.try_recv() {
            match next {
                Command::SetActive {
                    key: next_key,
                    reply: next_reply,
                } => {
                    debug!(skipped = %key, next = %next_key, "key switch superseded");
                    let _ = reply.send(Err(CacheError::Superseded));
                    key = next_key;
                    reply = next_reply;
                }
                Command::Shutdown { reply: done } => {
                    let _ = reply.send(Err(CacheError::RouterClosed));
                    self.close_all().await;
                    let _ = done.send(());
                    return false;
                }
            }
        }

        let view = self.activate(key).await;
        let _ = reply.send(Ok(view));
        true
    }

    async fn activate(&mut self, key: SeriesKey) -> ActiveView {
        let stale = self.health_of(&key).is_stale();

        if self.active.as_ref() == Some(&key) && !stale {
            debug!(key = %key, "key already active");
            return self.view_tx.borrow().clone();
        }

        if let Some(prev) = self.active.take() {
            if prev != key && !self.watched.contains(&prev) {
                self.close_connection(&prev).await;
            }
        }

        // Explicit reactivation retries a feed that gave up.
        if stale {
            self.close_connection(&key).await;
        }
        self.ensure_connection(&key);

        info!(key = %key, cached = self.store.len(&key), "active key switched");
        self.active = Some(key);
        self.publish_view()
    }

    fn ensure_connection(&mut self, key: &SeriesKey) {
        if self.connections.contains_key(key) {
            return;
        }

        let id = self.next_connection;
        self.next_connection += 1;

        let conn = FeedConnection::open(
            key.clone(),
            id,
            self.transport.clone(),
            self.config.backoff,
            self.stats.clone(),
            self.events_tx.clone(),
        );
        self.connections.insert(key.clone(), conn);
        self.health.write().insert(key.clone(), FeedHealth::Connecting);
    }

    async fn close_connection(&mut self, key: &SeriesKey) {
        if let Some(mut conn) = self.connections.remove(key) {
            conn.close().await;
        }
        self.health.write().insert(key.clone(), FeedHealth::Closed);
    }

    async fn close_all(&mut self) {
        let keys: Vec<SeriesKey> = self.connections.keys().cloned().collect();
        for key in keys {
            self.close_connection(&key).await;
        }
        self.publish_view();
        info!("subscription router stopped, all feeds closed");
    }

    fn apply(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Tick(tick) => {
                let key = tick.key.clone();
                match self.store.append(tick) {
                    Ok(_) => {
                        if self.active.as_ref() == Some(&key) {
                            self.publish_view();
                        }
                    }
                    // Counted by the store.
                    Err(e) if e.is_dropped_tick() => debug!(key = %key, error = %e, "tick dropped"),
                    Err(e) => warn!(key = %key, error = %e, "tick rejected"),
                }
            }
            FeedEvent::Health {
                key,
                connection,
                health,
            } => {
                if self.is_current(&key, connection) {
                    self.set_health(key, health);
                }
            }
            FeedEvent::Unavailable {
                key,
                connection,
                error,
            } => {
                if self.is_current(&key, connection) {
                    error!(key = %key, error = %error, "feed unavailable, keeping last window");
                    self.set_health(key, FeedHealth::Unavailable);
                }
            }
        }
    }

    /// Drop idle windows other than the active and watched keys.
    fn sweep_idle(&mut self) {
        let Some(older_than) = self.config.idle_eviction else {
            return;
        };
        let mut keep = self.watched.clone();
        keep.extend(self.active.iter().cloned());

        let removed = self.store.evict_idle_except(older_than, &keep);
        if !removed.is_empty() {
            let mut health = self.health.write();
            for key in &removed {
                health.remove(key);
            }
        }
    }

    /// Health events from a connection that has since been replaced are stale.
    fn is_current(&self, key: &SeriesKey, connection: u64) -> bool {
        self.connections.get(key).map(FeedConnection::id) == Some(connection)
    }

    fn set_health(&mut self, key: SeriesKey, health: FeedHealth) {
        let changed = self.health.write().insert(key.clone(), health) != Some(health);
        if changed && self.active.as_ref() == Some(&key) {
            self.publish_view();
        }
    }

    fn health_of(&self, key: &SeriesKey) -> FeedHealth {
        self.health.read().get(key).copied().unwrap_or_default()
    }

    fn publish_view(&mut self) -> ActiveView {
        self.version += 1;
        let view = match &self.active {
            Some(key) => {
                let health = self.health_of(key);
                ActiveView {
                    key: Some(key.clone()),
                    ticks: self.store.window(key, self.config.window_capacity),
                    health,
                    stale: health.is_stale(),
                    version: self.version,
                }
            }
            None => ActiveView {
                version: self.version,
                ..ActiveView::empty()
            },
        };
        self.view_tx.send_replace(view.clone());
        view
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::feed::testing::{kline_json, Script, ScriptedTransport};
    use crate::types::Interval;

    fn key(sym: &str) -> SeriesKey {
        SeriesKey::new(sym, Interval::M1)
    }

    fn tick(key: &SeriesKey, t: i64, close: f64) -> Tick {
        Tick::new(key.clone(), t, close, close + 1.0, close - 1.0, close, Some(true)).unwrap()
    }

    fn config(watched: Vec<SeriesKey>, initial: Option<SeriesKey>, max_attempts: u32) -> RouterConfig {
        RouterConfig {
            window_capacity: 3,
            backoff: BackoffConfig {
                base_ms: 500,
                cap_ms: 30_000,
                max_attempts,
                jitter: false,
            },
            watched,
            initial,
            idle_eviction: Some(Duration::from_secs(3600)),
            eviction_sweep: Duration::from_secs(60),
        }
    }

    fn seeded_store() -> Arc<SeriesStore> {
        let store = Arc::new(SeriesStore::new(3));
        for t in 1..=4 {
            store.append(tick(&key("ethusdt"), t * 60_000, 10.0 + t as f64)).unwrap();
        }
        store.append(tick(&key("bnbusdt"), 60_000, 300.0)).unwrap();
        store
    }

    fn hanging() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(Script::MessagesThenHang(Vec::new())))
    }

    /// Let spawned feed tasks reach their transport.
    async fn settle(transport: &ScriptedTransport, live: usize) {
        while transport.live() != live {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn switch_replays_buffered_window() {
        let store = seeded_store();
        let transport = hanging();
        let (router, _task) = SubscriptionRouter::spawn(
            store.clone(),
            transport.clone(),
            config(Vec::new(), Some(key("ethusdt")), 3),
        );

        let eth_before = router.set_active_key(key("ethusdt")).await.unwrap();
        assert_eq!(eth_before.ticks, store.window(&key("ethusdt"), 3));
        assert_eq!(eth_before.ticks.len(), 3);

        let bnb = router.set_active_key(key("bnbusdt")).await.unwrap();
        assert_eq!(bnb.key, Some(key("bnbusdt")));
        assert_eq!(bnb.ticks, vec![tick(&key("bnbusdt"), 60_000, 300.0)]);

        let eth_after = router.set_active_key(key("ethusdt")).await.unwrap();
        assert_eq!(eth_after.ticks, eth_before.ticks);

        // Old connections were torn down; only the active one is live.
        settle(&transport, 1).await;
        assert_eq!(transport.connects_for(&key("ethusdt")).len(), 2);
        assert_eq!(router.health(&key("bnbusdt")), Some(FeedHealth::Closed));

        router.shutdown().await;
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_is_a_noop() {
        let transport = hanging();
        let (router, _task) = SubscriptionRouter::spawn(
            seeded_store(),
            transport.clone(),
            config(Vec::new(), None, 3),
        );

        let first = router.set_active_key(key("ethusdt")).await.unwrap();
        let second = router.set_active_key(key("ethusdt")).await.unwrap();

        assert_eq!(first.key, second.key);
        assert_eq!(first.ticks, second.ticks);
        assert_eq!(transport.connects_for(&key("ethusdt")).len(), 1);
        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_ticks_update_the_active_view() {
        let eth = key("ethusdt");
        let frames = vec![
            kline_json(&eth, 300_000, 20.0, false),
            kline_json(&eth, 300_000, 21.0, true),
            kline_json(&eth, 360_000, 22.0, false),
        ];
        let transport = Arc::new(
            ScriptedTransport::new(Script::MessagesThenHang(Vec::new()))
                .script(&eth, vec![Script::MessagesThenHang(frames)]),
        );
        let (router, _task) = SubscriptionRouter::spawn(
            seeded_store(),
            transport,
            config(Vec::new(), Some(eth.clone()), 3),
        );

        let mut view = router.active_view();
        let latest = view
            .wait_for(|v| v.ticks.last().map(|t| t.timestamp) == Some(360_000))
            .await
            .unwrap()
            .clone();

        let stamps: Vec<i64> = latest.ticks.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![240_000, 300_000, 360_000]);
        assert_eq!(latest.ticks[1].close, 21.0);
        assert_eq!(latest.health, FeedHealth::Live);
        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_feed_marks_view_stale_and_reactivation_retries() {
        let eth = key("ethusdt");
        let transport = Arc::new(ScriptedTransport::new(Script::Fail));
        let (router, _task) = SubscriptionRouter::spawn(
            seeded_store(),
            transport.clone(),
            config(Vec::new(), Some(eth.clone()), 1),
        );

        let mut view = router.active_view();
        let stale = view.wait_for(|v| v.stale).await.unwrap().clone();
        assert_eq!(stale.health, FeedHealth::Unavailable);
        assert_eq!(stale.ticks.len(), 3);
        assert_eq!(router.feed_stats().unavailable, 1);

        let connects_before = transport.connects_for(&eth).len();
        assert_eq!(connects_before, 2);

        let retried = router.set_active_key(eth.clone()).await.unwrap();
        assert!(!retried.stale);
        assert_eq!(retried.ticks.len(), 3);

        view.wait_for(|v| v.stale).await.unwrap();
        assert_eq!(transport.connects_for(&eth).len(), connects_before + 2);
        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_switches_coalesce_to_the_last() {
        let transport = hanging();
        let (router, _task) = SubscriptionRouter::spawn(
            seeded_store(),
            transport.clone(),
            config(Vec::new(), None, 3),
        );

        let (a, b, c) = tokio::join!(
            router.set_active_key(key("dotusdt")),
            router.set_active_key(key("bnbusdt")),
            router.set_active_key(key("ethusdt")),
        );

        assert_eq!(a.unwrap_err(), CacheError::Superseded);
        assert_eq!(b.unwrap_err(), CacheError::Superseded);
        assert_eq!(c.unwrap().key, Some(key("ethusdt")));
        assert!(transport.connects_for(&key("dotusdt")).is_empty());
        assert!(transport.connects_for(&key("bnbusdt")).is_empty());
        assert_eq!(router.current_view().key, Some(key("ethusdt")));
        router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watched_keys_stay_connected_across_switches() {
        let transport = hanging();
        let watched = key("bnbusdt");
        let (router, _task) = SubscriptionRouter::spawn(
            seeded_store(),
            transport.clone(),
            config(vec![watched.clone()], Some(key("ethusdt")), 3),
        );

        router.set_active_key(watched.clone()).await.unwrap();
        router.set_active_key(key("dotusdt")).await.unwrap();

        // Watched connection reused and kept; eth closed; dot opened.
        settle(&transport, 2).await;
        assert_eq!(transport.connects_for(&watched).len(), 1);
        assert_eq!(router.health(&key("ethusdt")), Some(FeedHealth::Closed));

        router.shutdown().await;
        assert_eq!(transport.live(), 0);
        assert!(router.set_active_key(key("ethusdt")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_keys_but_keeps_active() {
        let store = seeded_store();
        let transport = hanging();
        let (router, _task) = SubscriptionRouter::spawn(
            store.clone(),
            transport,
            config(Vec::new(), Some(key("ethusdt")), 3),
        );
        router.set_active_key(key("ethusdt")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600 + 120)).await;

        assert_eq!(store.len(&key("bnbusdt")), 0);
        assert_eq!(store.len(&key("ethusdt")), 3);
        router.shutdown().await;
    }
}
