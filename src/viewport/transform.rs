// =============================================================================
// Viewport transform — affine model -> screen mapping with pan and zoom
// =============================================================================
//
//   screen = model * scale + translate
//
// Zoom keeps the anchor's screen position fixed. The requested factor is
// clamped so scale stays within [min_scale, max_scale], and the translate is
// recomputed from the clamped (effective) factor so the anchor never drifts
// when a limit is hit.
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for ScaleLimits {
    fn default() -> Self {
        Self { min: 0.1, max: 10.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportTransform {
    pub scale: f64,
    pub translate_x: f64,
    pub translate_y: f64,
    pub limits: ScaleLimits,
}

impl ViewportTransform {
    pub fn new(limits: ScaleLimits) -> Self {
        Self {
            scale: 1.0_f64.clamp(limits.min, limits.max),
            translate_x: 0.0,
            translate_y: 0.0,
            limits,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.limits);
    }

    /// Unconstrained translation in screen units.
    pub fn pan(&mut self, dx: f64, dy: f64) {
        if dx.is_finite() && dy.is_finite() {
            self.translate_x += dx;
            self.translate_y += dy;
        }
    }

    /// Zoom by `factor` around `anchor` (screen coordinates). Returns the
    /// factor actually applied after clamping; non-positive or non-finite
    /// requests are ignored and return 1.0.
    pub fn zoom(&mut self, factor: f64, anchor: Point) -> f64 {
        if !(factor.is_finite() && factor > 0.0) || !anchor.is_finite() {
            return 1.0;
        }
        let new_scale = (self.scale * factor).clamp(self.limits.min, self.limits.max);
        let effective = new_scale / self.scale;

        self.translate_x = anchor.x - (anchor.x - self.translate_x) * effective;
        self.translate_y = anchor.y - (anchor.y - self.translate_y) * effective;
        self.scale = new_scale;
        effective
    }

    pub fn to_screen(&self, p: Point) -> Point {
        Point {
            x: p.x * self.scale + self.translate_x,
            y: p.y * self.scale + self.translate_y,
        }
    }

    pub fn to_model(&self, p: Point) -> Point {
        Point {
            x: (p.x - self.translate_x) / self.scale,
            y: (p.y - self.translate_y) / self.scale,
        }
    }
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self::new(ScaleLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: Point, b: Point) -> bool {
        (a.x - b.x).abs() <= EPS * (1.0 + a.x.abs()) && (a.y - b.y).abs() <= EPS * (1.0 + a.y.abs())
    }

    #[test]
    fn anchor_stays_fixed_across_zoom_sequence() {
        let mut t = ViewportTransform::default();
        t.pan(37.0, -12.5);
        let steps = [
            (1.5, Point::new(400.0, 300.0)),
            (0.67, Point::new(10.0, 790.0)),
            (3.0, Point::new(123.4, 56.7)),
            (100.0, Point::new(600.0, 200.0)), // clamps at max
            (1e-6, Point::new(50.0, 50.0)),    // clamps at min
            (2.0, Point::new(0.0, 0.0)),
        ];
        for (factor, anchor) in steps {
            let model = t.to_model(anchor);
            t.zoom(factor, anchor);
            assert!(close(t.to_screen(model), anchor), "anchor drifted for factor {factor}");
            assert!(t.scale >= t.limits.min && t.scale <= t.limits.max);
        }
    }

    #[test]
    fn clamped_zoom_reports_effective_factor() {
        let mut t = ViewportTransform::default();
        let eff = t.zoom(50.0, Point::new(100.0, 100.0));
        assert!((t.scale - 10.0).abs() < EPS);
        assert!((eff - 10.0).abs() < EPS);

        // Already at max: nothing moves.
        let before = t;
        let eff = t.zoom(2.0, Point::new(300.0, 10.0));
        assert!((eff - 1.0).abs() < EPS);
        assert_eq!(t, before);
    }

    #[test]
    fn invalid_zoom_requests_are_ignored() {
        let mut t = ViewportTransform::default();
        let before = t;
        assert_eq!(t.zoom(0.0, Point::new(1.0, 1.0)), 1.0);
        assert_eq!(t.zoom(-2.0, Point::new(1.0, 1.0)), 1.0);
        assert_eq!(t.zoom(f64::NAN, Point::new(1.0, 1.0)), 1.0);
        assert_eq!(t, before);
    }

    #[test]
    fn pan_then_reset() {
        let mut t = ViewportTransform::default();
        t.pan(10.0, 20.0);
        t.zoom(2.0, Point::new(0.0, 0.0));
        assert_eq!(t.to_screen(Point::new(1.0, 1.0)), Point::new(12.0, 22.0));
        t.reset();
        assert_eq!(t, ViewportTransform::default());
    }
}
