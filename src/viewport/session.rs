// =============================================================================
// Viewport sessions — per-session transform state
// =============================================================================
//
// Each interactive session owns its transform, filter and the model geometry
// loaded for it. All gesture updates are read-modify-write under the session
// lock, so concurrent pan/zoom events never apply against a stale scale.
// Sessions never share state. A session nobody has touched for the idle TTL
// is dropped by the periodic sweep.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::filter::TrackFilter;
use super::scene::{self, DisplayMode, DrawableSegment, ModelScene, Scene};
use super::transform::{Point, ScaleLimits, ViewportTransform};
use crate::runtime_config::ViewportParams;
use crate::types::Track;

#[derive(Debug, Clone)]
struct SessionState {
    transform: ViewportTransform,
    filter: TrackFilter,
    mode: DisplayMode,
    model: ModelScene,
    loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub transform: ViewportTransform,
    pub filter: TrackFilter,
    pub mode: DisplayMode,
    pub width: f64,
    pub height: f64,
    pub segments: usize,
    pub loaded_at: Option<DateTime<Utc>>,
}

pub struct ViewportSession {
    id: Uuid,
    width: f64,
    height: f64,
    state: Mutex<SessionState>,
    last_used: Mutex<Instant>,
}

impl ViewportSession {
    pub fn new(params: &ViewportParams) -> Self {
        let limits = ScaleLimits {
            min: params.min_scale,
            max: params.max_scale,
        };
        Self {
            id: Uuid::new_v4(),
            width: params.width,
            height: params.height,
            state: Mutex::new(SessionState {
                transform: ViewportTransform::new(limits),
                filter: TrackFilter::default(),
                mode: DisplayMode::default(),
                model: ModelScene::default(),
                loaded_at: None,
            }),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn filter(&self) -> TrackFilter {
        self.state.lock().filter.clone()
    }

    /// Change filter and display mode. Takes effect at the next `load`.
    pub fn configure(&self, filter: TrackFilter, mode: DisplayMode) {
        let mut st = self.state.lock();
        st.filter = filter;
        st.mode = mode;
    }

    /// Replace the session's geometry with `tracks` under the current filter.
    pub fn load(&self, tracks: &[Track]) -> usize {
        let mut st = self.state.lock();
        st.model = scene::build_model(tracks, &st.filter, st.mode, self.width, self.height);
        st.loaded_at = Some(Utc::now());
        debug!(
            session = %self.id,
            segments = st.model.segments.len(),
            skipped = st.model.skipped.len(),
            "viewport geometry loaded"
        );
        st.model.segments.len()
    }

    pub fn pan(&self, dx: f64, dy: f64) -> ViewportTransform {
        let mut st = self.state.lock();
        st.transform.pan(dx, dy);
        st.transform
    }

    pub fn zoom(&self, factor: f64, anchor: Point) -> ViewportTransform {
        let mut st = self.state.lock();
        st.transform.zoom(factor, anchor);
        st.transform
    }

    pub fn reset(&self) -> ViewportTransform {
        let mut st = self.state.lock();
        st.transform.reset();
        st.transform
    }

    pub fn scene(&self) -> Scene {
        let st = self.state.lock();
        st.model.project(&st.transform)
    }

    pub fn hit_test(&self, point: Point, tolerance: f64) -> Option<DrawableSegment> {
        let scene = self.scene();
        scene::hit_test(&scene, point, tolerance).cloned()
    }

    pub fn info(&self) -> SessionInfo {
        let st = self.state.lock();
        SessionInfo {
            id: self.id,
            transform: st.transform,
            filter: st.filter.clone(),
            mode: st.mode,
            width: self.width,
            height: self.height,
            segments: st.model.segments.len(),
            loaded_at: st.loaded_at,
        }
    }
}

/// All live sessions, keyed by id.
#[derive(Default)]
pub struct ViewportSessions {
    sessions: RwLock<HashMap<Uuid, Arc<ViewportSession>>>,
}

impl ViewportSessions {
    pub fn create(&self, params: &ViewportParams) -> Arc<ViewportSession> {
        let session = Arc::new(ViewportSession::new(params));
        self.sessions.write().insert(session.id(), Arc::clone(&session));
        session
    }

    /// Look up a session and mark it as used.
    pub fn get(&self, id: &Uuid) -> Option<Arc<ViewportSession>> {
        let session = self.sessions.read().get(id).cloned()?;
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Drop sessions idle for at least `max_idle`. Returns how many went.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() < max_idle);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "idle viewport sessions dropped");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
