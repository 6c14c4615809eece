// =============================================================================
// Viewport Renderer
// =============================================================================
//
// filter: business filters applied before any geometry
// scene: model-space layout, screen projection, hit-testing
// transform: pan/zoom affine transform
// session: per-session state behind a lock, plus the session registry
// =============================================================================

pub mod filter;
pub mod scene;
pub mod session;
pub mod transform;

pub use filter::TrackFilter;
pub use scene::DisplayMode;
pub use session::{ViewportSession, ViewportSessions};
pub use transform::Point;
