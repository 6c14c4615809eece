// =============================================================================
// Scene construction — tracks to model-space geometry, projected per transform
// =============================================================================
//
// Model space spans the canvas at scale 1:
//   x = time, left to right, padded 10% on each side
//   y = rank (rank 1 at the top) or log10(price) (highest price at the top)
//
// `ModelScene` is built once per data refresh; `project` maps it through the
// current viewport transform without touching the store. Malformed tracks are
// skipped and reported, never fatal to the scene.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::filter::TrackFilter;
use super::transform::{Point, ViewportTransform};
use crate::types::{Color, Direction, Track, TrackPoint};

/// Minimum rank padding above and below the observed range.
const MIN_RANK_PAD: f64 = 10.0;
const PAD_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Rank,
    Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrokeStyle {
    Solid,
    Dashed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("track end is not after its start")]
    NonMonotonicTime,

    #[error("track maps to a non-finite coordinate")]
    NonFiniteCoordinate,

    #[error("rank must be >= 1")]
    InvalidRank,

    #[error("price must be positive for price mode")]
    NonPositivePrice,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTrack {
    pub pair: String,
    pub t0: DateTime<Utc>,
    pub reason: String,
}

/// Model-space extent; `y_*` are ranks or log10 prices depending on the mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelBounds {
    pub t_min: f64,
    pub t_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrawableSegment {
    pub pair: String,
    pub from: Point,
    pub to: Point,
    pub color: Color,
    pub stroke: StrokeStyle,
    pub is_manual: bool,
    pub direction: Direction,
    pub t0: DateTime<Utc>,
    pub t1: DateTime<Utc>,
    pub start_rank: u32,
    pub end_rank: u32,
    pub end_price: f64,
    pub end_change_pct: f64,
}

/// Geometry in model space, independent of pan/zoom.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelScene {
    pub mode: DisplayMode,
    pub bounds: Option<ModelBounds>,
    pub segments: Vec<DrawableSegment>,
    pub skipped: Vec<SkippedTrack>,
}

/// Geometry in screen space, ready for the drawing surface.
#[derive(Debug, Clone, Serialize)]
pub struct Scene {
    pub transform: ViewportTransform,
    pub segments: Vec<DrawableSegment>,
    pub skipped: Vec<SkippedTrack>,
}

impl Scene {
    pub fn skipped_summary(&self) -> Option<String> {
        if self.skipped.is_empty() {
            return None;
        }
        Some(format!("{} track(s) skipped: {}", self.skipped.len(), self.skipped[0].reason))
    }
}

// ---------------------------------------------------------------------------
// Validation & bounds
// ---------------------------------------------------------------------------

fn y_value(point: &TrackPoint, mode: DisplayMode) -> Result<f64, GeometryError> {
    match mode {
        DisplayMode::Rank => {
            if point.rank < 1 {
                return Err(GeometryError::InvalidRank);
            }
            Ok(point.rank as f64)
        }
        DisplayMode::Price => {
            if !point.price.is_finite() {
                return Err(GeometryError::NonFiniteCoordinate);
            }
            if point.price <= 0.0 {
                return Err(GeometryError::NonPositivePrice);
            }
            Ok(point.price.log10())
        }
    }
}

fn time_value(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// Model-space y pair for a track, or the reason it cannot be drawn.
pub fn validate(track: &Track, mode: DisplayMode) -> Result<(f64, f64), GeometryError> {
    if track.end.timestamp <= track.start.timestamp {
        return Err(GeometryError::NonMonotonicTime);
    }
    if track.start.rank < 1 || track.end.rank < 1 {
        return Err(GeometryError::InvalidRank);
    }
    Ok((y_value(&track.start, mode)?, y_value(&track.end, mode)?))
}

fn fit_bounds(valid: &[(&Track, f64, f64)], mode: DisplayMode) -> Option<ModelBounds> {
    let mut t_min = f64::INFINITY;
    let mut t_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;

    for (track, y0, y1) in valid {
        t_min = t_min.min(time_value(track.start.timestamp));
        t_max = t_max.max(time_value(track.end.timestamp));
        y_min = y_min.min(y0.min(*y1));
        y_max = y_max.max(y0.max(*y1));
    }
    if !t_min.is_finite() {
        return None;
    }

    let t_pad = (t_max - t_min) * PAD_FRACTION;
    let (y_min, y_max) = match mode {
        DisplayMode::Rank => {
            let pad = ((y_max - y_min) * PAD_FRACTION).max(MIN_RANK_PAD);
            ((y_min - pad).max(1.0), y_max + pad)
        }
        DisplayMode::Price => {
            let span = y_max - y_min;
            let pad = if span > 0.0 { span * PAD_FRACTION } else { 0.05 };
            (y_min - pad, y_max + pad)
        }
    };

    Some(ModelBounds {
        t_min: t_min - t_pad,
        t_max: t_max + t_pad,
        y_min,
        y_max,
    })
}

// ---------------------------------------------------------------------------
// Build & project
// ---------------------------------------------------------------------------

/// Filter, validate and lay out tracks on a `width` x `height` canvas.
pub fn build_model(
    tracks: &[Track],
    filter: &TrackFilter,
    mode: DisplayMode,
    width: f64,
    height: f64,
) -> ModelScene {
    let mut skipped = Vec::new();
    let mut valid = Vec::new();

    for track in filter.apply(tracks) {
        match validate(track, mode) {
            Ok((y0, y1)) => valid.push((track, y0, y1)),
            Err(e) => skipped.push(SkippedTrack {
                pair: track.pair.clone(),
                t0: track.start.timestamp,
                reason: e.to_string(),
            }),
        }
    }

    let Some(bounds) = fit_bounds(&valid, mode) else {
        return ModelScene {
            mode,
            bounds: None,
            segments: Vec::new(),
            skipped,
        };
    };

    let t_span = bounds.t_max - bounds.t_min;
    let y_span = bounds.y_max - bounds.y_min;
    let map_x = |ts: DateTime<Utc>| (time_value(ts) - bounds.t_min) / t_span * width;
    let map_y = |y: f64| match mode {
        DisplayMode::Rank => (y - bounds.y_min) / y_span * height,
        DisplayMode::Price => (bounds.y_max - y) / y_span * height,
    };

    let mut segments = Vec::with_capacity(valid.len());
    for (track, y0, y1) in valid {
        let from = Point::new(map_x(track.start.timestamp), map_y(y0));
        let to = Point::new(map_x(track.end.timestamp), map_y(y1));
        if !from.is_finite() || !to.is_finite() {
            skipped.push(SkippedTrack {
                pair: track.pair.clone(),
                t0: track.start.timestamp,
                reason: GeometryError::NonFiniteCoordinate.to_string(),
            });
            continue;
        }
        segments.push(DrawableSegment {
            pair: track.pair.clone(),
            from,
            to,
            color: track.color.clone(),
            stroke: if track.is_manual { StrokeStyle::Dashed } else { StrokeStyle::Solid },
            is_manual: track.is_manual,
            direction: track.direction(),
            t0: track.start.timestamp,
            t1: track.end.timestamp,
            start_rank: track.start.rank,
            end_rank: track.end.rank,
            end_price: track.end.price,
            end_change_pct: track.end.change_pct,
        });
    }

    ModelScene {
        mode,
        bounds: Some(bounds),
        segments,
        skipped,
    }
}

impl ModelScene {
    pub fn project(&self, transform: &ViewportTransform) -> Scene {
        Scene {
            transform: *transform,
            segments: self
                .segments
                .iter()
                .map(|s| DrawableSegment {
                    from: transform.to_screen(s.from),
                    to: transform.to_screen(s.to),
                    ..s.clone()
                })
                .collect(),
            skipped: self.skipped.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hit-testing
// ---------------------------------------------------------------------------

fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.x + t * dx, a.y + t * dy);
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

/// Nearest segment to `point` (screen space) within `tolerance`; equal
/// distances resolve to the segment with the most recent end time.
pub fn hit_test(scene: &Scene, point: Point, tolerance: f64) -> Option<&DrawableSegment> {
    const TIE_EPS: f64 = 1e-9;

    let mut best: Option<(&DrawableSegment, f64)> = None;
    for seg in &scene.segments {
        let d = distance_to_segment(point, seg.from, seg.to);
        if d.is_nan() || d > tolerance {
            continue;
        }
        best = match best {
            None => Some((seg, d)),
            Some((_, cd)) if d < cd - TIE_EPS => Some((seg, d)),
            Some((cur, cd)) if (d - cd).abs() <= TIE_EPS && seg.t1 > cur.t1 => Some((seg, d)),
            keep => keep,
        };
    }
    best.map(|(seg, _)| seg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, MarketKey, MarketType};
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn track(pair: &str, offset_min: i64, ranks: (u32, u32), prices: (f64, f64), manual: bool) -> Track {
        let t0 = base() + Duration::minutes(offset_min);
        let point = |ts, rank, price| TrackPoint {
            timestamp: ts,
            rank,
            price,
            change_pct: 1.0,
            volume: Some(1_000.0),
        };
        Track {
            pair: pair.into(),
            market: MarketKey::new(Exchange::Binance, MarketType::Spot, Some("USDT")),
            start: point(t0, ranks.0, prices.0),
            end: point(t0 + Duration::minutes(1), ranks.1, prices.1),
            is_manual: manual,
            color: "#123456".into(),
        }
    }

    #[test]
    fn rank_one_is_drawn_above_lower_ranks() {
        let tracks = vec![track("AUSDT", 0, (1, 20), (1.0, 1.0), false)];
        let model = build_model(&tracks, &TrackFilter::default(), DisplayMode::Rank, 800.0, 800.0);
        let seg = &model.segments[0];
        assert!(seg.from.y < seg.to.y);
        assert!(seg.from.x < seg.to.x);

        let b = model.bounds.unwrap();
        assert_eq!(b.y_min, 1.0);
        assert_eq!(b.y_max, 30.0);
    }

    #[test]
    fn malformed_tracks_are_skipped_not_fatal() {
        let mut backwards = track("BAD", 0, (1, 2), (1.0, 1.0), false);
        std::mem::swap(&mut backwards.start.timestamp, &mut backwards.end.timestamp);
        let tracks = vec![
            backwards,
            track("ZERO", 1, (3, 4), (0.0, 2.0), false),
            track("OK", 2, (5, 6), (2.0, 3.0), true),
        ];

        let rank = build_model(&tracks, &TrackFilter::default(), DisplayMode::Rank, 800.0, 800.0);
        assert_eq!(rank.segments.len(), 2);
        assert_eq!(rank.skipped.len(), 1);
        assert_eq!(rank.skipped[0].pair, "BAD");

        let price = build_model(&tracks, &TrackFilter::default(), DisplayMode::Price, 800.0, 800.0);
        assert_eq!(price.segments.len(), 1);
        assert_eq!(price.segments[0].stroke, StrokeStyle::Dashed);
        assert_eq!(price.skipped.len(), 2);
        let scene = price.project(&ViewportTransform::default());
        assert!(scene.skipped_summary().unwrap().starts_with("2 track(s) skipped"));
    }

    #[test]
    fn price_mode_puts_higher_price_on_top() {
        let tracks = vec![track("AUSDT", 0, (1, 1), (10.0, 1000.0), false)];
        let model = build_model(&tracks, &TrackFilter::default(), DisplayMode::Price, 800.0, 800.0);
        let seg = &model.segments[0];
        assert!(seg.to.y < seg.from.y);
    }

    #[test]
    fn projection_follows_transform() {
        let tracks = vec![track("AUSDT", 0, (1, 5), (1.0, 1.0), false)];
        let model = build_model(&tracks, &TrackFilter::default(), DisplayMode::Rank, 800.0, 800.0);
        let mut t = ViewportTransform::default();
        t.pan(5.0, -5.0);
        t.zoom(2.0, Point::new(0.0, 0.0));
        let scene = model.project(&t);
        let m = model.segments[0].from;
        assert_eq!(scene.segments[0].from, t.to_screen(m));
    }

    fn seg(pair: &str, from: (f64, f64), to: (f64, f64), t1_min: i64) -> DrawableSegment {
        DrawableSegment {
            pair: pair.into(),
            from: Point::new(from.0, from.1),
            to: Point::new(to.0, to.1),
            color: "#000001".into(),
            stroke: StrokeStyle::Solid,
            is_manual: false,
            direction: Direction::Flat,
            t0: base(),
            t1: base() + Duration::minutes(t1_min),
            start_rank: 1,
            end_rank: 1,
            end_price: 1.0,
            end_change_pct: 0.0,
        }
    }

    #[test]
    fn hit_test_prefers_nearest_then_most_recent() {
        let scene = Scene {
            transform: ViewportTransform::default(),
            segments: vec![
                seg("NEAR", (0.0, 10.0), (100.0, 10.0), 1),
                seg("FAR", (0.0, 14.0), (100.0, 14.0), 5),
                seg("TIE_OLD", (0.0, 50.0), (100.0, 50.0), 1),
                seg("TIE_NEW", (0.0, 54.0), (100.0, 54.0), 9),
            ],
            skipped: Vec::new(),
        };

        assert_eq!(hit_test(&scene, Point::new(50.0, 11.0), 5.0).unwrap().pair, "NEAR");
        assert_eq!(hit_test(&scene, Point::new(50.0, 52.0), 5.0).unwrap().pair, "TIE_NEW");
        assert!(hit_test(&scene, Point::new(50.0, 30.0), 5.0).is_none());
        // Beyond the segment end, distance is to the endpoint.
        assert!(hit_test(&scene, Point::new(104.0, 10.0), 3.0).is_none());
        assert_eq!(hit_test(&scene, Point::new(102.0, 10.0), 3.0).unwrap().pair, "NEAR");
    }
}
