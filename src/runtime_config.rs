// =============================================================================
// Runtime Configuration — Collector settings with atomic save
// =============================================================================
//
// Every tunable parameter of the tracker lives here: which market is sampled,
// how often, how long data is kept, and how hard the exchanges are pushed.
// The collector re-reads the shared config at the start of every cycle, so an
// edit made while running takes effect on the next cycle.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Exchange, MarketKey, MarketType};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_quote() -> Option<String> {
    Some("USDT".to_string())
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_retention_hours() -> u64 {
    24
}

fn default_max_concurrency() -> usize {
    8
}

fn default_symbol_timeout_ms() -> u64 {
    5_000
}

fn default_cycle_deadline_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_min_snapshot_spacing_secs() -> u64 {
    30
}

fn default_max_ticker_age_hours() -> u64 {
    24
}

fn default_min_scale() -> f64 {
    0.1
}

fn default_max_scale() -> f64 {
    10.0
}

fn default_canvas_size() -> f64 {
    800.0
}

fn default_session_idle_secs() -> u64 {
    1_800
}

fn default_fetch_mode() -> FetchMode {
    FetchMode::Bulk
}

fn default_log_filter() -> String {
    "info".to_string()
}

// =============================================================================
// ViewportParams
// =============================================================================

/// Limits and canvas size for interactive viewport sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewportParams {
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,

    #[serde(default = "default_max_scale")]
    pub max_scale: f64,

    /// Canvas width in screen units.
    #[serde(default = "default_canvas_size")]
    pub width: f64,

    /// Canvas height in screen units.
    #[serde(default = "default_canvas_size")]
    pub height: f64,

    /// Sessions untouched for this long are dropped.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ViewportParams {
    fn default() -> Self {
        Self {
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
            width: default_canvas_size(),
            height: default_canvas_size(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

impl ViewportParams {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

// =============================================================================
// FetchMode
// =============================================================================

/// How a cycle obtains its tickers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// One bulk 24h listing per cycle; only symbols missing from it (manual
    /// pairs outside the quote filter) are fetched one by one.
    Bulk,
    /// List the market, then fetch every symbol individually.
    PerSymbol,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the tracker.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market selection ---------------------------------------------------

    #[serde(default)]
    pub exchange: Exchange,

    #[serde(default)]
    pub market_type: MarketType,

    /// Quote currency filter (e.g. "USDT"). `None` ranks every pair.
    #[serde(default = "default_quote")]
    pub quote_currency: Option<String>,

    /// Pairs seeded into the manual selection on first start. Once the store
    /// holds a selection, the store is authoritative.
    #[serde(default)]
    pub manual_pairs: Vec<String>,

    /// Restrict fetching to these symbols. `None` fetches the whole market.
    #[serde(default)]
    pub symbol_allow_list: Option<Vec<String>>,

    /// Keep only the top N ranks in a stored snapshot (manual pairs always kept).
    #[serde(default)]
    pub pair_limit: Option<u32>,

    // --- Scheduling ---------------------------------------------------------

    /// Seconds between collection cycles.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Maximum age of visible snapshots and tracks.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// A cycle landing closer than this to the latest stored snapshot is skipped.
    #[serde(default = "default_min_snapshot_spacing_secs")]
    pub min_snapshot_spacing_secs: u64,

    /// Consecutive failed cycles before the collector stops itself.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    // --- Fetch behaviour ----------------------------------------------------

    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,

    /// Upper bound on in-flight per-symbol requests.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_symbol_timeout_ms")]
    pub symbol_timeout_ms: u64,

    /// Hard deadline for all per-symbol work of one cycle.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,

    /// Attempts per symbol on connection errors (1 = no retry).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Tickers whose exchange timestamp is older than this are dropped.
    #[serde(default = "default_max_ticker_age_hours")]
    pub max_ticker_age_hours: u64,

    // --- Presentation & diagnostics -----------------------------------------

    #[serde(default)]
    pub viewport: ViewportParams,

    /// Tracing filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchange: Exchange::default(),
            market_type: MarketType::default(),
            quote_currency: default_quote(),
            manual_pairs: Vec::new(),
            symbol_allow_list: None,
            pair_limit: None,
            fetch_mode: default_fetch_mode(),
            interval_seconds: default_interval_seconds(),
            retention_hours: default_retention_hours(),
            min_snapshot_spacing_secs: default_min_snapshot_spacing_secs(),
            failure_threshold: default_failure_threshold(),
            max_concurrency: default_max_concurrency(),
            symbol_timeout_ms: default_symbol_timeout_ms(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_ticker_age_hours: default_max_ticker_age_hours(),
            viewport: ViewportParams::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            market = %config.market_key(),
            interval_seconds = config.interval_seconds,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
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

    /// Reject values that would make the collector spin or never finish.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.interval_seconds >= 1, "interval_seconds must be >= 1");
        anyhow::ensure!(self.retention_hours >= 1, "retention_hours must be >= 1");
        anyhow::ensure!(self.max_concurrency >= 1, "max_concurrency must be >= 1");
        anyhow::ensure!(self.failure_threshold >= 1, "failure_threshold must be >= 1");
        anyhow::ensure!(self.retry_attempts >= 1, "retry_attempts must be >= 1");
        anyhow::ensure!(
            self.viewport.min_scale > 0.0 && self.viewport.min_scale <= self.viewport.max_scale,
            "viewport scale limits must satisfy 0 < min_scale <= max_scale"
        );
        if let Some(limit) = self.pair_limit {
            anyhow::ensure!(limit >= 1, "pair_limit must be >= 1 when set");
        }
        Ok(())
    }

    pub fn market_key(&self) -> MarketKey {
        MarketKey::new(self.exchange, self.market_type, self.quote_currency.as_deref())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn min_snapshot_spacing(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_snapshot_spacing_secs as i64)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.exchange, Exchange::Binance);
        assert_eq!(cfg.market_type, MarketType::Spot);
        assert_eq!(cfg.quote_currency.as_deref(), Some("USDT"));
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.retention_hours, 24);
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.retry_attempts, 3);
        assert!((cfg.viewport.min_scale - 0.1).abs() < f64::EPSILON);
        assert!((cfg.viewport.max_scale - 10.0).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.exchange, Exchange::Binance);
        assert_eq!(cfg.max_concurrency, 8);
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.fetch_mode, FetchMode::Bulk);
        assert_eq!(cfg.viewport.session_idle_secs, 1_800);
        assert!(cfg.manual_pairs.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "exchange": "okx", "market_type": "futures", "quote_currency": null,
                        "manual_pairs": ["DOGEUSDT"], "fetch_mode": "per_symbol" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.exchange, Exchange::Okx);
        assert_eq!(cfg.market_type, MarketType::Futures);
        assert_eq!(cfg.quote_currency, None);
        assert_eq!(cfg.manual_pairs, vec!["DOGEUSDT"]);
        assert_eq!(cfg.fetch_mode, FetchMode::PerSymbol);
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.market_key().quote_token(), "*");
    }

    #[test]
    fn validate_rejects_zero_interval_and_bad_scale() {
        let mut cfg = RuntimeConfig::default();
        cfg.interval_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.viewport.min_scale = 5.0;
        cfg.viewport.max_scale = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.exchange = Exchange::Bybit;
        cfg.pair_limit = Some(50);
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.exchange, Exchange::Bybit);
        assert_eq!(loaded.pair_limit, Some(50));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
