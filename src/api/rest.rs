// =============================================================================
// REST API Endpoints — Axum 0.8
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health probe is public; every other
// endpoint requires a valid Bearer token checked via the `AuthBearer`
// extractor.
//
// Store access is synchronous SQLite, so handlers hop onto the blocking pool
// for anything that touches the database.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::collector::{ConfigProvider, StartOutcome};
use crate::runtime_config::RuntimeConfig;
use crate::store::{SnapshotStore, StoreError, TimeRange};
use crate::tracks::rebuild_tracks;
use crate::types::{Exchange, MarketKey, MarketType};
use crate::viewport::{DisplayMode, Point, TrackFilter, ViewportSession};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/collector/status", get(collector_status))
        .route("/api/v1/collector/start", post(collector_start))
        .route("/api/v1/collector/stop", post(collector_stop))
        .route("/api/v1/config", get(get_config).put(update_config))
        .route("/api/v1/manual-selection", get(get_manual).put(set_manual))
        .route("/api/v1/snapshots", get(snapshots))
        .route("/api/v1/snapshots/latest", get(latest_snapshot))
        .route("/api/v1/tracks", get(tracks))
        .route("/api/v1/tracks/rebuild", post(rebuild))
        .route("/api/v1/retention/sweep", post(retention_sweep))
        .route("/api/v1/store/stats", get(store_stats))
        .route("/api/v1/colors", get(colors))
        .route("/api/v1/errors", get(errors))
        // ── Viewport sessions ───────────────────────────────────────
        .route("/api/v1/viewport", post(viewport_create))
        .route("/api/v1/viewport/{id}", get(viewport_info).delete(viewport_delete))
        .route("/api/v1/viewport/{id}/view", post(viewport_configure))
        .route("/api/v1/viewport/{id}/refresh", post(viewport_refresh))
        .route("/api/v1/viewport/{id}/pan", post(viewport_pan))
        .route("/api/v1/viewport/{id}/zoom", post(viewport_zoom))
        .route("/api/v1/viewport/{id}/reset", post(viewport_reset))
        .route("/api/v1/viewport/{id}/scene", get(viewport_scene))
        .route("/api/v1/viewport/{id}/hit", get(viewport_hit))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "API request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a store operation on the blocking pool.
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SnapshotStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(ApiError::from)
}

fn session(state: &AppState, id: Uuid) -> Result<Arc<ViewportSession>, ApiError> {
    state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("viewport session {id}")))
}

// =============================================================================
// Market selection (query params)
// =============================================================================

/// Optional market override; unset fields fall back to the running config.
#[derive(Debug, Default, Deserialize)]
struct MarketQuery {
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    market_type: Option<String>,
    /// Quote currency, `*` for all pairs.
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

impl MarketQuery {
    fn market(&self, config: &RuntimeConfig) -> Result<MarketKey, ApiError> {
        let exchange = match &self.exchange {
            Some(e) => Exchange::parse(e).ok_or_else(|| ApiError::BadRequest(format!("unknown exchange '{e}'")))?,
            None => config.exchange,
        };
        let market_type = match &self.market_type {
            Some(m) => {
                MarketType::parse(m).ok_or_else(|| ApiError::BadRequest(format!("unknown market type '{m}'")))?
            }
            None => config.market_type,
        };
        let quote = match &self.quote {
            Some(q) => Some(q.as_str()),
            None => config.quote_currency.as_deref(),
        };
        Ok(MarketKey::new(exchange, market_type, quote))
    }

    fn range(&self) -> TimeRange {
        TimeRange {
            from: self.from,
            to: self.to,
        }
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// State & collector control (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn collector_status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.collector.status())
}

#[derive(Serialize)]
struct ControlResponse {
    outcome: &'static str,
    message: String,
}

async fn collector_start(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let provider: Arc<dyn ConfigProvider> = Arc::new(state.runtime_config.clone());
    let outcome = state.collector.start(provider).await;
    state.increment_version();

    let (outcome, message) = match outcome {
        StartOutcome::Started => {
            info!("Collector STARTED via API");
            ("started", "Collector started".to_string())
        }
        StartOutcome::AlreadyRunning => ("already_running", "Collector is already running".to_string()),
    };
    Json(ControlResponse { outcome, message })
}

async fn collector_stop(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let was_running = state.collector.stop().await;
    state.increment_version();
    if was_running {
        info!("Collector STOPPED via API");
    }
    Json(ControlResponse {
        outcome: if was_running { "stopped" } else { "not_running" },
        message: if was_running {
            "Collector stopped".to_string()
        } else {
            "Collector was not running".to_string()
        },
    })
}

// =============================================================================
// Configuration (authenticated)
// =============================================================================

async fn get_config(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runtime_config.read().clone())
}

/// Replace the runtime config. Applies from the next collector cycle.
async fn update_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(update): Json<RuntimeConfig>,
) -> ApiResult<RuntimeConfig> {
    update.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let previous = {
        let mut config = state.runtime_config.write();
        std::mem::replace(&mut *config, update.clone())
    };
    state.store.set_retention(update.retention());

    if let Err(e) = update.save(&state.config_path) {
        warn!(error = %e, "Failed to save runtime config to disk");
    }
    state.increment_version();
    info!(
        from = %previous.market_key(),
        to = %update.market_key(),
        interval_seconds = update.interval_seconds,
        "Runtime config updated"
    );
    Ok(Json(update))
}

// =============================================================================
// Manual selection (authenticated)
// =============================================================================

async fn get_manual(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> ApiResult<BTreeSet<String>> {
    Ok(Json(with_store(&state, |s| s.get_manual_selection()).await?))
}

#[derive(Deserialize)]
struct ManualSelectionRequest {
    pairs: Vec<String>,
}

async fn set_manual(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualSelectionRequest>,
) -> ApiResult<BTreeSet<String>> {
    let pairs: BTreeSet<String> = req
        .pairs
        .iter()
        .map(|p| p.trim().to_uppercase())
        .filter(|p| !p.is_empty())
        .collect();
    let stored = pairs.clone();
    with_store(&state, move |s| s.set_manual_selection(&stored)).await?;
    state.increment_version();
    info!(count = pairs.len(), "Manual selection updated");
    Ok(Json(pairs))
}

// =============================================================================
// Snapshots & tracks (authenticated)
// =============================================================================

async fn snapshots(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let market = q.market(&state.runtime_config.read())?;
    let range = q.range();
    let snaps = with_store(&state, move |s| s.query_snapshots(&market, range)).await?;
    Ok(Json(snaps))
}

async fn latest_snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let market = q.market(&state.runtime_config.read())?;
    let label = market.to_string();
    let snap = with_store(&state, move |s| s.latest_snapshot(&market))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("snapshot for {label}")))?;
    Ok(Json(snap))
}

async fn tracks(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let market = q.market(&state.runtime_config.read())?;
    let range = q.range();
    let tracks = with_store(&state, move |s| s.query_tracks(&market, range)).await?;
    Ok(Json(tracks))
}

#[derive(Deserialize)]
struct RebuildRequest {
    /// Target spacing between paired snapshots; defaults to the collection
    /// interval.
    #[serde(default)]
    target_interval_secs: Option<u64>,
}

#[derive(Serialize)]
struct RebuildResponse {
    market: String,
    snapshots: usize,
    tracks: usize,
}

async fn rebuild(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<MarketQuery>,
    Json(req): Json<RebuildRequest>,
) -> ApiResult<RebuildResponse> {
    let (market, target) = {
        let config = state.runtime_config.read();
        let secs = req.target_interval_secs.unwrap_or(config.interval_seconds);
        (q.market(&config)?, chrono::Duration::seconds(secs.max(1) as i64))
    };
    let label = market.to_string();

    let (snapshots, tracks) = with_store(&state, move |s| {
        let snaps = s.query_snapshots(&market, TimeRange::all())?;
        let manual: HashSet<String> = s.get_manual_selection()?.into_iter().collect();
        let colors = s.color_table()?;
        let tracks = rebuild_tracks(&snaps, target, &manual, &colors);
        let written = s.replace_tracks(&market, &tracks)?;
        Ok((snaps.len(), written))
    })
    .await?;

    state.increment_version();
    info!(market = %label, snapshots, tracks, "Tracks rebuilt via API");
    Ok(Json(RebuildResponse {
        market: label,
        snapshots,
        tracks,
    }))
}

async fn retention_sweep(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let max_age = state.runtime_config.read().retention();
    let outcome = with_store(&state, move |s| s.apply_retention(max_age)).await?;
    info!(snapshots = outcome.snapshots, tracks = outcome.tracks, "Retention sweep via API");
    Ok(Json(outcome))
}

async fn store_stats(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(with_store(&state, |s| s.stats()).await?))
}

async fn colors(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(with_store(&state, |s| s.color_table()).await?))
}

async fn errors(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.errors.records())
}

// =============================================================================
// Viewport sessions (authenticated)
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ViewRequest {
    #[serde(default)]
    filter: TrackFilter,
    #[serde(default)]
    mode: DisplayMode,
}

/// Load the current market's visible tracks into `session` under its filter.
async fn load_session(state: &AppState, session: &Arc<ViewportSession>) -> Result<usize, ApiError> {
    let market = state.runtime_config.read().market_key();
    let filter = session.filter();
    let range = TimeRange {
        from: filter.from,
        to: filter.to,
    };
    let tracks = with_store(state, move |s| s.query_tracks(&market, range)).await?;
    Ok(session.load(&tracks))
}

async fn viewport_create(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Option<Json<ViewRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let params = state.runtime_config.read().viewport.clone();
    let session = state.sessions.create(&params);
    let view = body.map(|Json(v)| v).unwrap_or_default();
    session.configure(view.filter, view.mode);
    load_session(&state, &session).await?;
    info!(session = %session.id(), "Viewport session created");
    Ok((StatusCode::CREATED, Json(session.info())))
}

async fn viewport_info(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session(&state, id)?.info()))
}

async fn viewport_delete(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.sessions.remove(&id) {
        return Err(ApiError::NotFound(format!("viewport session {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn viewport_configure(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(view): Json<ViewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = session(&state, id)?;
    session.configure(view.filter, view.mode);
    load_session(&state, &session).await?;
    Ok(Json(session.info()))
}

async fn viewport_refresh(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = session(&state, id)?;
    load_session(&state, &session).await?;
    Ok(Json(session.info()))
}

#[derive(Deserialize)]
struct PanRequest {
    dx: f64,
    dy: f64,
}

async fn viewport_pan(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session(&state, id)?.pan(req.dx, req.dy)))
}

#[derive(Deserialize)]
struct ZoomRequest {
    factor: f64,
    x: f64,
    y: f64,
}

async fn viewport_zoom(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ZoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(req.factor.is_finite() && req.factor > 0.0) {
        return Err(ApiError::BadRequest("zoom factor must be a positive number".into()));
    }
    Ok(Json(session(&state, id)?.zoom(req.factor, Point::new(req.x, req.y))))
}

async fn viewport_reset(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session(&state, id)?.reset()))
}

async fn viewport_scene(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let scene = session(&state, id)?.scene();
    if let Some(summary) = scene.skipped_summary() {
        warn!(session = %id, %summary, "Scene rendered with skipped tracks");
    }
    Ok(Json(scene))
}

fn default_tolerance() -> f64 {
    6.0
}

#[derive(Deserialize)]
struct HitQuery {
    x: f64,
    y: f64,
    #[serde(default = "default_tolerance")]
    tolerance: f64,
}

async fn viewport_hit(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<HitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hit = session(&state, id)?.hit_test(Point::new(q.x, q.y), q.tolerance);
    Ok(Json(hit))
}
