// =============================================================================
// Rank Tracker — Main Entry Point
// =============================================================================
//
// Startup order: env + config, tracing, snapshot store, exchange adapters,
// shared state, API server. The collector starts Stopped; it is started from
// the API (or immediately when TRACKER_AUTOSTART=1).
//
// Ctrl+C stops the collector cooperatively, then saves the runtime config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod collector;
mod exchange;
mod ranking;
mod runtime_config;
mod store;
mod tracks;
mod types;
mod viewport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::collector::ConfigProvider;
use crate::exchange::{HttpClient, LiveSources};
use crate::runtime_config::RuntimeConfig;
use crate::store::SnapshotStore;

/// How often abandoned viewport sessions are looked for.
const SESSION_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Per-request HTTP timeout for exchange calls; the per-symbol timeout in the
/// config is enforced on top of this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path = PathBuf::from(env_or("TRACKER_CONFIG_PATH", "runtime_config.json"));
    let db_path = PathBuf::from(env_or("TRACKER_DB_PATH", "rank_tracker.db"));
    let bind_addr = env_or("TRACKER_BIND_ADDR", "0.0.0.0:3001");

    // Config is read before tracing so its log_filter can seed the subscriber;
    // the load outcome is logged once tracing is up.
    let loaded = RuntimeConfig::load(&config_path);
    let fallback_filter = loaded
        .as_ref()
        .map(|c| c.log_filter.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback_filter)),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Rank Tracker — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = loaded.unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path.display(), "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        market = %config.market_key(),
        interval_seconds = config.interval_seconds,
        retention_hours = config.retention_hours,
        manual_pairs = config.manual_pairs.len(),
        "Configured market"
    );

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = Arc::new(
        SnapshotStore::open(&db_path, config.retention())
            .with_context(|| format!("failed to open snapshot store at {}", db_path.display()))?,
    );
    match store.stats() {
        Ok(stats) => info!(
            path = %db_path.display(),
            snapshots = stats.snapshots,
            tracks = stats.tracks,
            colors = stats.colors,
            "Snapshot store opened"
        ),
        Err(e) => warn!(error = %e, "Snapshot store opened, stats unavailable"),
    }

    // ── 3. Exchange adapters ─────────────────────────────────────────────
    let http = HttpClient::new(HTTP_TIMEOUT).context("failed to build HTTP client")?;
    let sources = Arc::new(LiveSources::new(http));

    // ── 4. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, config_path.clone(), store, sources));

    // ── 5. Idle viewport session sweep ───────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SESSION_SWEEP_EVERY);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let max_idle = state.runtime_config.read().viewport.session_idle();
                let removed = state.sessions.sweep_idle(max_idle);
                if removed > 0 {
                    info!(removed, remaining = state.sessions.len(), "Dropped idle viewport sessions");
                }
            }
        });
    }

    // ── 6. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 7. Optional autostart ────────────────────────────────────────────
    if env_or("TRACKER_AUTOSTART", "0") == "1" {
        let provider: Arc<dyn ConfigProvider> = Arc::new(state.runtime_config.clone());
        state.collector.start(provider).await;
    }

    info!("Ready. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if state.collector.stop().await {
        info!("Collector stopped");
    }

    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Rank Tracker shut down complete.");
    Ok(())
}
