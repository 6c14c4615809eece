// =============================================================================
// Collector Loop — drives fetch -> store -> tracks on a fixed interval
// =============================================================================
//
// State machine:  Stopped --start--> Running --(stop | N failures)--> Stopped
//
// The loop is a managed tokio task owning a `CancellationToken`; its state is
// published on a `watch` channel so the API and WebSocket layers observe it
// without sharing mutable flags. Stop is cooperative: the token stops new
// per-symbol work from starting, in-flight requests finish or time out, the
// partial cycle is discarded, and only then does the task exit.
//
// Configuration is re-read through `ConfigProvider` at the top of each cycle,
// so edits apply from the next cycle on.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::app_state::ErrorLog;
use crate::exchange::ExchangeRegistry;
use crate::ranking::{fetch_snapshot, FetchError, FetchParams, FetchRequest};
use crate::runtime_config::RuntimeConfig;
use crate::store::{SnapshotStore, StoreError};
use crate::tracks::build_tracks;
use crate::types::CollectorState;

// =============================================================================
// Configuration provider
// =============================================================================

/// Supplies the configuration for each cycle.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> RuntimeConfig;

    /// Time between cycle starts.
    fn cycle_interval(&self, cfg: &RuntimeConfig) -> Duration {
        cfg.interval()
    }
}

impl ConfigProvider for Arc<RwLock<RuntimeConfig>> {
    fn current(&self) -> RuntimeConfig {
        self.read().clone()
    }
}

// =============================================================================
// Errors & status
// =============================================================================

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("store write failed: {0}")]
    StoreWriteFailure(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(String),
}

impl CollectorError {
    /// Short machine-readable code for the error log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(FetchError::ExchangeUnreachable(_)) => "EXCHANGE_UNREACHABLE",
            Self::Fetch(FetchError::AuthOrRateLimited(_)) => "AUTH_OR_RATE_LIMITED",
            Self::Fetch(FetchError::EmptyMarket(_)) => "EMPTY_MARKET",
            Self::Fetch(FetchError::Cancelled) => "CANCELLED",
            Self::StoreWriteFailure(_) | Self::Task(_) => "STORE_WRITE_FAILURE",
        }
    }
}

/// Published collector status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStatus {
    pub state: CollectorState,
    pub market: Option<String>,
    pub cycle_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Set when the loop stopped itself after too many failures.
    pub terminal_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_snapshot_pairs: usize,
    pub last_partial_failures: usize,
    pub last_tracks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq)]
enum CycleOutcome {
    Stored {
        pairs: usize,
        tracks: usize,
        partial_failures: usize,
    },
    /// Too close to the previous snapshot; not a failure.
    Skipped,
}

struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

// =============================================================================
// Collector
// =============================================================================

pub struct Collector {
    inner: Arc<Inner>,
    handle: Mutex<Option<RunHandle>>,
}

struct Inner {
    registry: Arc<dyn ExchangeRegistry>,
    store: Arc<SnapshotStore>,
    errors: Arc<ErrorLog>,
    status: watch::Sender<CollectorStatus>,
}

impl Collector {
    pub fn new(registry: Arc<dyn ExchangeRegistry>, store: Arc<SnapshotStore>, errors: Arc<ErrorLog>) -> Self {
        let (status, _) = watch::channel(CollectorStatus::default());
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                errors,
                status,
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn status(&self) -> CollectorStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectorStatus> {
        self.inner.status.subscribe()
    }

    /// Start the loop. A second start while running is a no-op.
    pub async fn start(&self, provider: Arc<dyn ConfigProvider>) -> StartOutcome {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.as_ref() {
            if !h.join.is_finished() {
                return StartOutcome::AlreadyRunning;
            }
        }

        let cancel = CancellationToken::new();
        let market = provider.current().market_key().to_string();
        self.inner.status.send_modify(|s| {
            *s = CollectorStatus {
                state: CollectorState::Running,
                market: Some(market.clone()),
                cycle_count: s.cycle_count,
                ..CollectorStatus::default()
            };
        });

        let inner = self.inner.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { inner.run(provider, token).await });
        *handle = Some(RunHandle { cancel, join });

        info!(market = %market, "collector started");
        StartOutcome::Started
    }

    /// Stop the loop and wait for the current cycle to wind down. Returns
    /// whether a loop was running.
    pub async fn stop(&self) -> bool {
        let Some(h) = self.handle.lock().await.take() else {
            return false;
        };
        let was_running = !h.join.is_finished();
        h.cancel.cancel();
        if let Err(err) = h.join.await {
            error!(error = %err, "collector task ended abnormally");
        }
        self.inner.set_stopped();
        if was_running {
            info!("collector stopped");
        }
        was_running
    }
}

impl Inner {
    async fn run(self: Arc<Self>, provider: Arc<dyn ConfigProvider>, cancel: CancellationToken) {
        let seed = provider.current().manual_pairs;
        if !seed.is_empty() {
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.seed_manual_selection(&seed)).await {
                Ok(Ok(true)) => info!("manual selection seeded from config"),
                Ok(Ok(false)) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to seed manual selection"),
                Err(err) => warn!(error = %err, "manual selection seed task failed"),
            }
        }

        let mut next = tokio::time::Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let cfg = provider.current();
            let interval = provider.cycle_interval(&cfg);
            next += interval;
            let now = tokio::time::Instant::now();
            if next < now {
                // Fell behind (slow cycle); realign instead of bursting.
                next = now + interval;
            }

            match self.run_cycle(&cfg, &cancel).await {
                Ok(outcome) => self.record_success(&cfg, outcome),
                Err(CollectorError::Fetch(FetchError::Cancelled)) => break,
                Err(err) => {
                    if self.record_failure(&cfg, &err) {
                        break;
                    }
                }
            }
        }

        self.set_stopped();
    }

    async fn run_cycle(&self, cfg: &RuntimeConfig, cancel: &CancellationToken) -> Result<CycleOutcome, CollectorError> {
        let market = cfg.market_key();
        self.store.set_retention(cfg.retention());

        let (previous, manual) = {
            let store = self.store.clone();
            let market = market.clone();
            tokio::task::spawn_blocking(move || {
                Ok::<_, StoreError>((store.latest_snapshot(&market)?, store.get_manual_selection()?))
            })
            .await
            .map_err(|e| CollectorError::Task(e.to_string()))??
        };

        if let Some(prev) = &previous {
            if Utc::now() - prev.timestamp < cfg.min_snapshot_spacing() {
                info!(market = %market, last = %prev.timestamp, "previous snapshot too recent, skipping cycle");
                return Ok(CycleOutcome::Skipped);
            }
        }

        let request = FetchRequest {
            market: market.clone(),
            allow_list: cfg.symbol_allow_list.clone(),
            manual: manual.into_iter().collect::<HashSet<_>>(),
            params: FetchParams::from_config(cfg),
        };
        let source = self.registry.source(cfg.exchange);
        let report = fetch_snapshot(source, &request, cancel).await?;

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled.into());
        }
        if let Some(partial) = &report.partial {
            warn!(
                market = %market,
                failed = partial.len(),
                failures = ?partial.summary(),
                "partial fetch failure"
            );
        }

        let pairs = report.snapshot.len();
        let partial_failures = report.partial.as_ref().map_or(0, |p| p.len());
        let retention = cfg.retention();
        let store = self.store.clone();
        let manual = request.manual;

        let tracks = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let snapshot = report.snapshot;
            for o in &snapshot.observations {
                store.get_or_assign_color(&o.pair)?;
            }
            let tracks = match &previous {
                Some(prev) => build_tracks(prev, &snapshot, &manual, &store.color_table()?),
                None => Vec::new(),
            };
            store.write_cycle(&snapshot, &tracks)?;
            if let Err(err) = store.apply_retention(retention) {
                warn!(error = %err, "retention sweep failed, will retry next cycle");
            }
            Ok(tracks.len())
        })
        .await
        .map_err(|e| CollectorError::Task(e.to_string()))??;

        Ok(CycleOutcome::Stored {
            pairs,
            tracks,
            partial_failures,
        })
    }

    fn record_success(&self, cfg: &RuntimeConfig, outcome: CycleOutcome) {
        self.status.send_modify(|s| {
            s.consecutive_failures = 0;
            s.market = Some(cfg.market_key().to_string());
            if let CycleOutcome::Stored {
                pairs,
                tracks,
                partial_failures,
            } = outcome
            {
                s.cycle_count += 1;
                s.last_cycle_at = Some(Utc::now());
                s.last_snapshot_pairs = pairs;
                s.last_tracks = tracks;
                s.last_partial_failures = partial_failures;
                info!(cycle = s.cycle_count, pairs, tracks, "collection cycle stored");
            }
        });
    }

    /// Count a failed cycle. Returns `true` when the threshold is reached and
    /// the loop must stop.
    fn record_failure(&self, cfg: &RuntimeConfig, err: &CollectorError) -> bool {
        let message = err.to_string();
        self.errors.push(message.clone(), Some(err.code().to_string()));

        let mut terminal = false;
        self.status.send_modify(|s| {
            s.consecutive_failures += 1;
            s.last_error = Some(message.clone());
            warn!(
                consecutive = s.consecutive_failures,
                threshold = cfg.failure_threshold,
                error = %message,
                "collection cycle failed"
            );
            if s.consecutive_failures >= cfg.failure_threshold {
                let reason = format!(
                    "stopped after {} consecutive failed cycles: {message}",
                    s.consecutive_failures
                );
                error!(reason = %reason, "collector giving up");
                s.terminal_error = Some(reason);
                terminal = true;
            }
        });
        if terminal {
            if let Some(reason) = self.status.borrow().terminal_error.clone() {
                self.errors.push(reason, Some("COLLECTOR_STOPPED".to_string()));
            }
        }
        terminal
    }

    fn set_stopped(&self) {
        self.status.send_if_modified(|s| {
            if s.state == CollectorState::Stopped {
                return false;
            }
            s.state = CollectorState::Stopped;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AdapterError, RawTicker, TickerSource};
    use crate::store::TimeRange;
    use crate::types::{Exchange, MarketType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// BTC and ETH swap places every cycle; `down` makes every call fail.
    struct SwapSource {
        cycles: AtomicU32,
        down: bool,
    }

    impl SwapSource {
        fn ticker(&self, symbol: &str) -> RawTicker {
            let odd = self.cycles.load(Ordering::SeqCst) % 2 == 1;
            let change = match (symbol, odd) {
                ("BTCUSDT", true) | ("ETHUSDT", false) => 5.0,
                _ => 3.0,
            };
            RawTicker {
                symbol: symbol.to_string(),
                last_price: Some(100.0),
                change_pct: Some(change),
                quote_volume: Some(1e6),
                exchange_time: None,
            }
        }
    }

    #[async_trait]
    impl TickerSource for SwapSource {
        fn exchange(&self) -> Exchange {
            Exchange::Binance
        }

        async fn fetch_tickers(&self, _m: MarketType, _q: Option<&str>) -> Result<Vec<RawTicker>, AdapterError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.down {
                return Err(AdapterError::Unreachable("connection refused".into()));
            }
            Ok(vec![self.ticker("BTCUSDT"), self.ticker("ETHUSDT")])
        }

        async fn fetch_ticker(&self, _m: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
            Ok(self.ticker(symbol))
        }
    }

    /// Bulk listing that takes a while; signals when the request is on the wire.
    struct SlowListing {
        entered: Notify,
        completed: AtomicU32,
    }

    #[async_trait]
    impl TickerSource for SlowListing {
        fn exchange(&self) -> Exchange {
            Exchange::Binance
        }

        async fn fetch_tickers(&self, _m: MarketType, _q: Option<&str>) -> Result<Vec<RawTicker>, AdapterError> {
            self.entered.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawTicker {
                symbol: "BTCUSDT".into(),
                last_price: Some(100.0),
                change_pct: Some(1.0),
                quote_volume: None,
                exchange_time: None,
            }])
        }

        async fn fetch_ticker(&self, _m: MarketType, symbol: &str) -> Result<RawTicker, AdapterError> {
            Err(AdapterError::InvalidSymbol(symbol.to_string()))
        }
    }

    struct StubRegistry(Arc<dyn TickerSource>);

    impl ExchangeRegistry for StubRegistry {
        fn source(&self, _exchange: Exchange) -> Arc<dyn TickerSource> {
            self.0.clone()
        }
    }

    struct FastConfig(RuntimeConfig);

    impl ConfigProvider for FastConfig {
        fn current(&self) -> RuntimeConfig {
            self.0.clone()
        }

        fn cycle_interval(&self, _cfg: &RuntimeConfig) -> Duration {
            Duration::from_millis(30)
        }
    }

    fn fast_config() -> Arc<dyn ConfigProvider> {
        let mut cfg = RuntimeConfig::default();
        cfg.min_snapshot_spacing_secs = 0;
        cfg.retry_attempts = 1;
        cfg.failure_threshold = 3;
        Arc::new(FastConfig(cfg))
    }

    fn collector_with(source: Arc<dyn TickerSource>) -> (tempfile::TempDir, Arc<SnapshotStore>, Collector) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SnapshotStore::open(&dir.path().join("tracker.db"), chrono::Duration::hours(24)).unwrap(),
        );
        let c = Collector::new(
            Arc::new(StubRegistry(source)),
            store.clone(),
            Arc::new(ErrorLog::default()),
        );
        (dir, store, c)
    }

    fn collector(down: bool) -> (tempfile::TempDir, Arc<SwapSource>, Arc<SnapshotStore>, Collector) {
        let source = Arc::new(SwapSource {
            cycles: AtomicU32::new(0),
            down,
        });
        let (dir, store, c) = collector_with(source.clone());
        (dir, source, store, c)
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<CollectorStatus>, mut pred: F) -> CollectorStatus
    where
        F: FnMut(&CollectorStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                {
                    let s = rx.borrow_and_update();
                    if pred(&s) {
                        return s.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stops_after_threshold_consecutive_failures() {
        let (_dir, source, _store, c) = collector(true);
        let mut rx = c.subscribe();
        assert_eq!(c.start(fast_config()).await, StartOutcome::Started);

        let status = wait_for(&mut rx, |s| s.state == CollectorState::Stopped).await;
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.terminal_error.is_some());
        assert_eq!(source.cycles.load(Ordering::SeqCst), 3);

        // Give a stray tick the chance to run; none must.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.cycles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn second_start_is_already_running_and_stop_is_cooperative() {
        let (_dir, _source, _store, c) = collector(false);
        assert_eq!(c.start(fast_config()).await, StartOutcome::Started);
        assert_eq!(c.start(fast_config()).await, StartOutcome::AlreadyRunning);
        assert_eq!(c.status().state, CollectorState::Running);

        assert!(c.stop().await);
        assert_eq!(c.status().state, CollectorState::Stopped);
        assert!(!c.stop().await);

        // Restartable after a stop.
        assert_eq!(c.start(fast_config()).await, StartOutcome::Started);
        assert!(c.stop().await);
    }

    #[tokio::test]
    async fn two_cycles_store_swap_tracks() {
        let (_dir, _source, store, c) = collector(false);
        let mut rx = c.subscribe();
        c.start(fast_config()).await;
        wait_for(&mut rx, |s| s.cycle_count >= 2).await;
        c.stop().await;

        let market = RuntimeConfig::default().market_key();
        let tracks = store.query_tracks(&market, TimeRange::all()).unwrap();
        let first_end = tracks[0].end.timestamp;
        let first: Vec<_> = tracks.iter().filter(|t| t.end.timestamp == first_end).collect();
        assert_eq!(first.len(), 2);

        let btc = first.iter().find(|t| t.pair == "BTCUSDT").unwrap();
        let eth = first.iter().find(|t| t.pair == "ETHUSDT").unwrap();
        assert_eq!((btc.start.rank, btc.end.rank), (1, 2));
        assert_eq!((eth.start.rank, eth.end.rank), (2, 1));
        assert!(!btc.is_manual && !eth.is_manual);
        assert_ne!(btc.color, eth.color);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_fetch_finish_and_discards_the_cycle() {
        let source = Arc::new(SlowListing {
            entered: Notify::new(),
            completed: AtomicU32::new(0),
        });
        let (_dir, store, c) = collector_with(source.clone());
        c.start(fast_config()).await;

        tokio::time::timeout(Duration::from_secs(5), source.entered.notified())
            .await
            .unwrap();
        assert!(c.stop().await);

        // The request already sent ran to completion...
        assert_eq!(source.completed.load(Ordering::SeqCst), 1);
        // ...but its result was never written.
        let market = RuntimeConfig::default().market_key();
        assert!(store.latest_snapshot(&market).unwrap().is_none());

        let status = c.status();
        assert_eq!(status.state, CollectorState::Stopped);
        assert_eq!(status.cycle_count, 0);
        assert_eq!(status.consecutive_failures, 0);
    }
}
