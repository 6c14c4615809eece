// =============================================================================
// Central Application State — Rank Tracker
// =============================================================================
//
// Ties the long-lived components together for the API and WebSocket layers:
// the shared runtime config, the snapshot store, the exchange adapters, the
// collector, viewport sessions and the recent-error ring.
//
// Everything is created once in `main` and handed out as `Arc<AppState>`;
// components that need a piece (the collector needs the store and the error
// log) receive it explicitly at construction.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for shared mutable collections.
//   - Components manage their own interior mutability.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::collector::{Collector, CollectorStatus};
use crate::exchange::rate_limit::WeightSnapshot;
use crate::exchange::LiveSources;
use crate::runtime_config::RuntimeConfig;
use crate::store::SnapshotStore;
use crate::viewport::ViewportSessions;

// =============================================================================
// Error Record
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the UI error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Optional machine-readable error code (e.g. `EXCHANGE_UNREACHABLE`).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Bounded ring of recent errors; the oldest entry is dropped first.
#[derive(Default)]
pub struct ErrorLog {
    records: RwLock<Vec<ErrorRecord>>,
    generation: AtomicU64,
}

impl ErrorLog {
    pub fn push(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut records = self.records.write();
        records.push(record);
        while records.len() > MAX_RECENT_ERRORS {
            records.remove(0);
        }
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.read().clone()
    }

    pub fn last(&self) -> Option<ErrorRecord> {
        self.records.read().last().cloned()
    }

    /// Bumped on every push; lets pollers detect new entries cheaply.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every mutation made through the API (config edits,
    /// selection changes, viewport gestures).
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub config_path: PathBuf,

    // ── Components ──────────────────────────────────────────────────────
    pub store: Arc<SnapshotStore>,
    pub sources: Arc<LiveSources>,
    pub collector: Collector,
    pub sessions: ViewportSessions,

    // ── Error Log ───────────────────────────────────────────────────────
    pub errors: Arc<ErrorLog>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        config_path: PathBuf,
        store: Arc<SnapshotStore>,
        sources: Arc<LiveSources>,
    ) -> Self {
        let errors = Arc::new(ErrorLog::default());
        let collector = Collector::new(sources.clone(), store.clone(), errors.clone());

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            config_path,
            store,
            sources,
            collector,
            sessions: ViewportSessions::default(),
            errors,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Combined version: API mutations plus new error records.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed) + self.errors.generation()
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Lightweight status view for the dashboard and WebSocket feed. Does
    /// not touch the database.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read();
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            market: config.market_key().to_string(),
            interval_seconds: config.interval_seconds,
            retention_hours: config.retention_hours,
            collector: self.collector.status(),
            binance_weight: self.sources.binance_weight(config.market_type),
            viewport_sessions: self.sessions.len(),
            last_error: self.errors.last(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub market: String,
    pub interval_seconds: u64,
    pub retention_hours: u64,
    pub collector: CollectorStatus,
    pub binance_weight: WeightSnapshot,
    pub viewport_sessions: usize,
    pub last_error: Option<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
