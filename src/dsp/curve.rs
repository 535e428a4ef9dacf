//! Distortion curve generator — the waveshaper transfer table.
//!
//! The table is a pure function of `crunch`; live preview and offline render
//! build it independently and must get the same bits.

use std::f64::consts::PI;

/// Number of entries in every distortion table.
pub const CURVE_SIZE: usize = 44100;

/// Fixed-size waveshaper transfer table.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionCurve {
    table: Vec<f32>,
    crunch: f64,
}

/// Build the transfer table for `crunch`.
///
/// `curve[i] = (3 + k) * x * 20° / (π + k * |x|)` with `x = 2i/N - 1`.
/// At `k = 0` this reduces to `x / 3`: the mildest setting still attenuates.
pub fn generate(crunch: f64) -> DistortionCurve {
    let k = crunch;
    let deg = PI / 180.0;
    let n = CURVE_SIZE as f64;
    let table = (0..CURVE_SIZE)
        .map(|i| {
            let x = (i as f64 * 2.0) / n - 1.0;
            ((3.0 + k) * x * 20.0 * deg / (PI + k * x.abs())) as f32
        })
        .collect();
    DistortionCurve { table, crunch }
}

impl DistortionCurve {
    pub fn crunch(&self) -> f64 {
        self.crunch
    }

    pub fn table(&self) -> &[f32] {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Shape one input value. `[-1, 1]` spans the whole table; inputs beyond
    /// it take the end entries.
    #[inline]
    pub fn lookup(&self, x: f32) -> f32 {
        let last = self.table.len() - 1;
        let v = last as f64 * (x as f64 + 1.0) * 0.5;
        if !(v > 0.0) {
            // Also catches NaN.
            return self.table[0];
        }
        if v >= last as f64 {
            return self.table[last];
        }
        let k = v as usize;
        let frac = (v - k as f64) as f32;
        self.table[k] * (1.0 - frac) + self.table[k + 1] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_size() {
        assert_eq!(generate(0.0).len(), CURVE_SIZE);
        assert_eq!(generate(400.0).len(), CURVE_SIZE);
    }

    #[test]
    fn deterministic_across_range() {
        let mut crunch = 0.0;
        while crunch <= 400.0 {
            let a = generate(crunch);
            let b = generate(crunch);
            let same = a
                .table()
                .iter()
                .zip(b.table())
                .all(|(x, y)| x.to_bits() == y.to_bits());
            assert!(same, "tables differ at crunch={crunch}");
            crunch += 12.5;
        }
    }

    #[test]
    fn zero_crunch_is_one_third_scale_not_identity() {
        // Residual scale factor at crunch=0 is exactly 1/3.
        let curve = generate(0.0);
        for &x in &[-0.9f32, -0.5, 0.25, 0.5, 0.9] {
            let y = curve.lookup(x);
            assert!(
                (y - x / 3.0).abs() < 1e-4,
                "crunch=0 should map {x} to {}, got {y}",
                x / 3.0
            );
            assert!((y - x).abs() > 0.1, "crunch=0 must not be a pass-through");
        }
        assert_eq!(curve.table()[CURVE_SIZE / 2], 0.0);
    }

    #[test]
    fn curve_is_odd_symmetric_and_monotonic() {
        let curve = generate(200.0);
        let t = curve.table();
        for w in t.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert!((curve.lookup(0.5) + curve.lookup(-0.5)).abs() < 1e-3);
    }

    #[test]
    fn more_crunch_saturates_harder() {
        let soft = generate(0.0).lookup(0.2);
        let hard = generate(400.0).lookup(0.2);
        assert!(hard > soft);
    }

    #[test]
    fn lookup_clamps_out_of_range_and_nan() {
        let curve = generate(50.0);
        let t = curve.table();
        assert_eq!(curve.lookup(3.0), t[CURVE_SIZE - 1]);
        assert_eq!(curve.lookup(-3.0), t[0]);
        assert_eq!(curve.lookup(f32::NAN), t[0]);
    }
}
