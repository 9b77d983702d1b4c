//! Cubic Hermite float curves, matching Unity `AnimationCurve`
//! evaluation semantics (clamped ends, auto tangents from neighbor
//! slopes). Engine Isp-vs-pressure curves are expressed with these.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
struct Keyframe {
    time: f64,
    value: f64,
    in_tangent: f64,
    out_tangent: f64,
    auto_tangent: bool,
}

/// A piecewise cubic Hermite spline over `f64` keyframes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FloatCurve {
    keys: Vec<Keyframe>,
}

impl FloatCurve {
    pub fn new() -> Self {
        Self::default()
    }

    /// A curve that evaluates to `value` everywhere.
    pub fn constant(value: f64) -> Self {
        let mut curve = Self::new();
        curve.add(0.0, value);
        curve
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Adds a keyframe with automatic tangents (average of the slopes
    /// to the neighboring keys).
    pub fn add(&mut self, time: f64, value: f64) {
        self.insert(Keyframe {
            time,
            value,
            in_tangent: 0.0,
            out_tangent: 0.0,
            auto_tangent: true,
        });
    }

    pub fn add_with_tangents(&mut self, time: f64, value: f64, in_tangent: f64, out_tangent: f64) {
        self.insert(Keyframe {
            time,
            value,
            in_tangent,
            out_tangent,
            auto_tangent: false,
        });
    }

    fn insert(&mut self, key: Keyframe) {
        let i = match self.keys.binary_search_by(|k| k.time.total_cmp(&key.time)) {
            // Re-keying an existing time replaces the frame.
            Ok(i) => {
                self.keys[i] = key;
                i
            }
            Err(i) => {
                self.keys.insert(i, key);
                i
            }
        };

        self.fix_tangent(i);
        if i > 0 {
            self.fix_tangent(i - 1);
        }
        if i + 1 < self.keys.len() {
            self.fix_tangent(i + 1);
        }
    }

    fn fix_tangent(&mut self, i: usize) {
        if !self.keys[i].auto_tangent {
            return;
        }

        let slope_right = (i + 1 < self.keys.len()).then(|| {
            let (cur, right) = (self.keys[i], self.keys[i + 1]);
            (right.value - cur.value) / (right.time - cur.time)
        });
        let slope_left = (i > 0).then(|| {
            let (left, cur) = (self.keys[i - 1], self.keys[i]);
            (cur.value - left.value) / (cur.time - left.time)
        });

        let tangent = match (slope_left, slope_right) {
            (Some(l), Some(r)) => (l + r) / 2.0,
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (None, None) => 0.0,
        };
        self.keys[i].in_tangent = tangent;
        self.keys[i].out_tangent = tangent;
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        if t.is_nan() {
            return f64::NAN;
        }
        let Some(first) = self.keys.first() else {
            return 0.0;
        };
        if t <= first.time {
            return first.value;
        }
        let last = self.keys[self.keys.len() - 1];
        if t >= last.time {
            return last.value;
        }

        let hi = self.keys.partition_point(|k| k.time.total_cmp(&t).is_le());
        let k1 = self.keys[hi - 1];
        if k1.time == t {
            return k1.value;
        }
        let k2 = self.keys[hi];

        interpolant(
            k1.time,
            k1.value,
            k1.out_tangent,
            k2.time,
            k2.value,
            k2.in_tangent,
            t,
        )
    }
}

fn interpolant(x1: f64, y1: f64, yp1: f64, x2: f64, y2: f64, yp2: f64, x: f64) -> f64 {
    let t = (x - x1) / (x2 - x1);
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * y1 + h10 * (x2 - x1) * yp1 + h01 * y2 + h11 * (x2 - x1) * yp2
}
