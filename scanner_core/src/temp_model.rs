//! Coil temperature compensation.
//!
//! The coil's frequency drifts quadratically with temperature, with the
//! quadratic and linear terms themselves linear in `freq - fmin`. Converting
//! a reading between temperatures solves for the anchor offset of the
//! reading and re-evaluates the curve at the target temperature.

use scanner_traits::BaseCalibration;

use crate::thermistor::Thermistor;

/// Fitted coefficients plus the anchor point (`fmin` at `fmin_temp`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempModel {
    pub a_a: Option<f64>,
    pub a_b: Option<f64>,
    pub b_a: Option<f64>,
    pub b_b: Option<f64>,
    pub fmin: f64,
    pub fmin_temp: f64,
}

#[inline]
fn lin(x: f64, a: f64, b: f64) -> f64 {
    x * a + b
}

impl TempModel {
    fn coefficients(&self) -> Option<[f64; 4]> {
        Some([self.a_a?, self.a_b?, self.b_a?, self.b_b?])
    }

    /// Frequency `freq` read at `temp_source` as it would read at `temp_target`.
    ///
    /// Identity unless all four coefficients are set.
    pub fn compensate(&self, freq: f64, temp_source: f64, temp_target: f64) -> f64 {
        let Some(k) = self.coefficients() else {
            return freq;
        };
        self.anchored(k, freq, temp_source, temp_target)
            .unwrap_or_else(|| self.direct(k, freq, temp_source, temp_target))
    }

    /// Solve for the anchor offset of the reading; `None` without a real root.
    fn anchored(&self, k: [f64; 4], freq: f64, ts: f64, tt: f64) -> Option<f64> {
        let [aa, ab, ba, bb] = k;
        let df = freq - self.fmin;

        let a = 4.0 * (ts * aa).powi(2) + 4.0 * ts * aa * ba + ba.powi(2) + 4.0 * aa;
        let b = 8.0 * ts.powi(2) * aa * ab + 4.0 * ts * (aa * bb + ab * ba) + 2.0 * ba * bb
            + 4.0 * ab
            - 4.0 * df * aa;
        let c = 4.0 * (ts * ab).powi(2) + 4.0 * ts * ab * bb + bb.powi(2) - 4.0 * df * ab;

        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let ax = (disc.sqrt() - b) / 2.0 / a;
        let param_a = lin(ax, aa, ab);
        let param_b = lin(ax, ba, bb);
        Some(param_a * (tt + param_b / 2.0 / param_a).powi(2) + ax + self.fmin)
    }

    /// Quadratic in temperature with coefficients taken at the reading itself.
    fn direct(&self, k: [f64; 4], freq: f64, ts: f64, tt: f64) -> f64 {
        let [aa, ab, ba, bb] = k;
        let df = freq - self.fmin;
        let param_a = lin(df, aa, ab);
        let param_b = lin(df, ba, bb);
        let param_c = freq - param_a * ts.powi(2) - param_b * ts;
        param_a * tt.powi(2) + param_b * tt + param_c
    }
}

/// Collects the `tc_*` settings and completes missing anchors from the
/// sensor's base calibration block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TempModelBuilder {
    pub a_a: Option<f64>,
    pub a_b: Option<f64>,
    pub b_a: Option<f64>,
    pub b_b: Option<f64>,
    pub fmin: Option<f64>,
    pub fmin_temp: Option<f64>,
}

impl TempModelBuilder {
    pub fn build(&self) -> Option<TempModel> {
        let (fmin, fmin_temp) = (self.fmin?, self.fmin_temp?);
        tracing::info!(fmin, fmin_temp, "built tempco model");
        Some(TempModel {
            a_a: self.a_a,
            a_b: self.a_b,
            b_a: self.b_a,
            b_b: self.b_b,
            fmin,
            fmin_temp,
        })
    }

    /// Fill unset anchors from the base block, then build.
    ///
    /// `count_to_freq` converts the stored count; `adc_scale` is
    /// `smooth_count * adc_max`.
    pub fn build_with_base(
        mut self,
        base: Option<BaseCalibration>,
        count_to_freq: impl Fn(f64) -> f64,
        thermistor: &Thermistor,
        adc_scale: f64,
    ) -> Option<TempModel> {
        match base {
            Some(base) if base.is_programmed() => {
                if self.fmin.is_none() {
                    self.fmin = Some(count_to_freq(f64::from(base.f_count)));
                }
                if self.fmin_temp.is_none() {
                    self.fmin_temp = Some(thermistor.calc_temp(f64::from(base.adc) / adc_scale));
                }
                tracing::info!(fmin = ?self.fmin, fmin_temp = ?self.fmin_temp, "fmin loaded from base");
            }
            _ => tracing::info!("fmin parameters not found in base"),
        }
        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn full() -> TempModel {
        TempModel {
            a_a: Some(1.0e-6),
            a_b: Some(-0.5),
            b_a: Some(1.0e-4),
            b_b: Some(50.0),
            fmin: 3_000_000.0,
            fmin_temp: 25.0,
        }
    }

    /// a_a = 0, a_b = 1, b_a = 1, b_b = 0 around fmin = 0. With the source
    /// temperature at 0 the discriminant is 16(1 + f).
    fn unit() -> TempModel {
        TempModel {
            a_a: Some(0.0),
            a_b: Some(1.0),
            b_a: Some(1.0),
            b_b: Some(0.0),
            fmin: 0.0,
            fmin_temp: 0.0,
        }
    }

    #[test]
    fn same_temperature_is_identity() {
        let m = full();
        let f = 3_100_000.0;
        let out = m.compensate(f, 40.0, 40.0);
        assert!((out - f).abs() < 1e-2, "{out}");
    }

    #[test]
    fn negative_discriminant_uses_direct_curve() {
        let m = unit();
        let k = m.coefficients().unwrap();
        assert!(m.anchored(k, -2.0, 0.0, 3.0).is_none());
        // param_a = 1, param_b = f, param_c = f.
        assert_eq!(m.compensate(-2.0, 0.0, 3.0), 9.0 - 6.0 - 2.0);
    }

    #[test]
    fn direct_curve_is_continuous() {
        let m = unit();
        let a = m.compensate(-1.5, 0.0, 2.0);
        let b = m.compensate(-1.5 - 1e-9, 0.0, 2.0);
        assert!(a.is_finite());
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn zero_discriminant_takes_anchor_path() {
        let m = unit();
        let k = m.coefficients().unwrap();
        // disc = 0 at f = -1: double root ax = -2, param_a = 1, param_b = -2.
        let out = m.anchored(k, -1.0, 0.0, 1.5).unwrap();
        assert!((out - (0.25 - 2.0)).abs() < 1e-12);
        assert_eq!(m.compensate(-1.0, 0.0, 1.5), out);
    }

    #[test]
    fn both_paths_agree_for_a_reading_at_the_vertex() {
        // At ts = -2, f = 4 the reading sits on the vertex of its own curve,
        // so the anchor solve returns ax = f - fmin and both paths coincide.
        let m = unit();
        let k = m.coefficients().unwrap();
        for tt in [-5.0, 0.0, 2.5, 30.0] {
            let anchored = m.anchored(k, 4.0, -2.0, tt).unwrap();
            let direct = m.direct(k, 4.0, -2.0, tt);
            assert!((anchored - direct).abs() < 1e-9, "tt={tt}");
        }
    }

    #[test]
    fn builder_needs_both_anchors() {
        let b = TempModelBuilder {
            fmin: Some(1.0),
            ..Default::default()
        };
        assert!(b.build().is_none());
    }

    #[test]
    fn base_fills_missing_anchors() {
        let t = Thermistor::coil_board();
        let base = BaseCalibration {
            f_count: 1 << 28,
            adc: 2000,
        };
        let m = TempModelBuilder::default()
            .build_with_base(Some(base), |c| c * 2.0, &t, 16.0 * 4095.0)
            .unwrap();
        assert_eq!(m.fmin, f64::from(1u32 << 28) * 2.0);
        assert!((m.fmin_temp - t.calc_temp(2000.0 / (16.0 * 4095.0))).abs() < 1e-12);
    }

    #[test]
    fn erased_base_is_ignored() {
        let t = Thermistor::coil_board();
        let base = BaseCalibration {
            f_count: u32::MAX,
            adc: u16::MAX,
        };
        let built = TempModelBuilder::default().build_with_base(Some(base), |c| c, &t, 1.0);
        assert!(built.is_none());
    }

    proptest! {
        #[test]
        fn missing_coefficient_is_identity(
            f in 1.0e5f64..1.0e7,
            ts in -40.0f64..180.0,
            tt in -40.0f64..180.0,
            missing in 0usize..4,
        ) {
            let mut m = full();
            match missing {
                0 => m.a_a = None,
                1 => m.a_b = None,
                2 => m.b_a = None,
                _ => m.b_b = None,
            }
            prop_assert_eq!(m.compensate(f, ts, tt), f);
        }
    }
}
