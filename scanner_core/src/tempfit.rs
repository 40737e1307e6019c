//! Fitting the `tc_*` temperature coefficients from STREAM captures.
//!
//! Each capture holds the coil at one height while it warms up. Its
//! frequency over temperature is fitted as a parabola; the parabola
//! coefficients are then regressed linearly against the vertex frequency
//! above `fmin`, which is what [`crate::temp_model::TempModel`] evaluates.

use eyre::WrapErr;
use nalgebra::{DMatrix, DVector};
use toml::{Table, Value};

use crate::error::{Result, ScannerError, fail};
use crate::temp_model::TempModelBuilder;

/// Rows dropped from the start of every capture while the stream settles.
pub const SKIP_ROWS: usize = 20;
/// Vertices beyond this temperature are treated as a linear drift.
pub const MAX_VERTEX_TEMP: f64 = 120.0;
pub const MIN_LOGS: usize = 3;

/// `freq = a·T² + b·T + c` for one capture, with its vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    pub a: f64,
    pub b: f64,
    pub vertex_temp: f64,
    pub vertex_freq: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempcoFit {
    pub a_a: f64,
    pub a_b: f64,
    pub b_a: f64,
    pub b_b: f64,
    pub fmin: f64,
    pub fmin_temp: f64,
}

impl TempcoFit {
    pub fn builder(&self) -> TempModelBuilder {
        TempModelBuilder {
            a_a: Some(self.a_a),
            a_b: Some(self.a_b),
            b_a: Some(self.b_a),
            b_b: Some(self.b_b),
            fmin: Some(self.fmin),
            fmin_temp: Some(self.fmin_temp),
        }
    }

    /// `[scanner]` section ready to paste into the config.
    pub fn to_toml(&self) -> Result<String> {
        let mut section = Table::new();
        for (key, value) in [
            ("tc_a_a", self.a_a),
            ("tc_a_b", self.a_b),
            ("tc_b_a", self.b_a),
            ("tc_b_b", self.b_b),
            ("tc_fmin", self.fmin),
            ("tc_fmin_temp", self.fmin_temp),
        ] {
            section.insert(key.into(), Value::Float(value));
        }
        let mut root = Table::new();
        root.insert("scanner".into(), Value::Table(section));
        toml::to_string(&root).wrap_err("render tempco TOML")
    }
}

fn lstsq(rows: usize, cols: usize, x: impl Fn(usize, usize) -> f64, y: &[f64]) -> Result<Vec<f64>> {
    let a = DMatrix::from_fn(rows, cols, x);
    let b = DVector::from_column_slice(y);
    let eps = f64::EPSILON * rows as f64;
    let sol = a
        .svd(true, true)
        .solve(&b, eps)
        .map_err(|e| fail(ScannerError::calibration(format!("Least squares fit failed: {e}"))))?;
    Ok(sol.iter().copied().collect())
}

/// Fit one capture. `temps` and `freqs` are the full rows, the first
/// [`SKIP_ROWS`] are ignored.
pub fn fit_drift(temps: &[f64], freqs: &[f64]) -> Result<Drift> {
    let pairs: Vec<(f64, f64)> = temps
        .iter()
        .zip(freqs)
        .skip(SKIP_ROWS)
        .map(|(t, f)| (*t, *f))
        .filter(|(t, f)| t.is_finite() && f.is_finite())
        .collect();
    if pairs.len() < 3 {
        return Err(fail(ScannerError::calibration(format!(
            "Capture has {} usable rows after skipping {SKIP_ROWS}",
            pairs.len()
        ))));
    }
    let t: Vec<f64> = pairs.iter().map(|p| p.0).collect();
    let f: Vec<f64> = pairs.iter().map(|p| p.1).collect();

    let quad = lstsq(t.len(), 3, |i, j| t[i].powi(2 - j as i32), &f)?;
    let (a, b, c) = (quad[0], quad[1], quad[2]);
    let axis = -b / (2.0 * a);
    if a > 0.0 && axis <= MAX_VERTEX_TEMP {
        return Ok(Drift {
            a,
            b,
            vertex_temp: axis,
            vertex_freq: a * axis * axis + b * axis + c,
        });
    }

    let line = lstsq(t.len(), 2, |i, j| if j == 0 { t[i] } else { 1.0 }, &f)?;
    tracing::debug!(a, axis, slope = line[0], "drift vertex out of range, using a line");
    Ok(Drift {
        a: 0.0,
        b: line[0],
        vertex_temp: MAX_VERTEX_TEMP,
        vertex_freq: line[0] * MAX_VERTEX_TEMP + line[1],
    })
}

/// Regress the drift coefficients of several captures.
pub fn fit_tempco(drifts: &[Drift]) -> Result<TempcoFit> {
    if drifts.len() < MIN_LOGS {
        return Err(fail(ScannerError::calibration(format!(
            "Need at least {MIN_LOGS} captures at different heights, got {}",
            drifts.len()
        ))));
    }
    let Some(lowest) = drifts
        .iter()
        .min_by(|x, y| x.vertex_freq.total_cmp(&y.vertex_freq))
    else {
        return Err(fail(ScannerError::calibration("No captures to fit")));
    };
    let (fmin, fmin_temp) = (lowest.vertex_freq, lowest.vertex_temp);
    let df: Vec<f64> = drifts.iter().map(|d| d.vertex_freq - fmin).collect();
    let spread = df.iter().copied().fold(0.0, f64::max);
    if spread <= 0.0 {
        return Err(fail(ScannerError::calibration(
            "Captures do not differ in frequency; record them at different heights",
        )));
    }

    let linear = |y: &[f64]| lstsq(df.len(), 2, |i, j| if j == 0 { df[i] } else { 1.0 }, y);
    let b = linear(&drifts.iter().map(|d| d.b).collect::<Vec<_>>())?;
    let (a_a, a_b) = if drifts.iter().all(|d| d.a == 0.0) {
        (0.0, 0.0)
    } else {
        let a = linear(&drifts.iter().map(|d| d.a).collect::<Vec<_>>())?;
        (a[0], a[1])
    };
    let fit = TempcoFit {
        a_a,
        a_b,
        b_a: b[0],
        b_b: b[1],
        fmin,
        fmin_temp,
    };
    tracing::info!(?fit, captures = drifts.len(), "tempco fitted");
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMIN: f64 = 3_000_000.0;

    /// Capture whose parabola follows the linear coefficient laws.
    fn capture(df: f64) -> (Vec<f64>, Vec<f64>) {
        let a = 1.0e-7 * df + 0.5;
        let b = -1.0e-5 * df - 40.0;
        let vertex = -b / (2.0 * a);
        let c = FMIN + df + b * b / (4.0 * a);
        let temps: Vec<f64> = (0..220).map(|i| 20.0 + f64::from(i) * 0.3).collect();
        let freqs = temps.iter().map(|t| a * t * t + b * t + c).collect();
        assert!(vertex < MAX_VERTEX_TEMP);
        (temps, freqs)
    }

    #[test]
    fn drift_vertex_is_recovered() {
        let (t, f) = capture(0.0);
        let d = fit_drift(&t, &f).unwrap();
        assert!((d.a - 0.5).abs() < 1e-6);
        assert!((d.vertex_temp - 40.0).abs() < 1e-4);
        assert!((d.vertex_freq - FMIN).abs() < 1e-2);
    }

    #[test]
    fn coefficient_laws_are_recovered() {
        let drifts: Vec<Drift> = [0.0, 20_000.0, 50_000.0]
            .iter()
            .map(|df| {
                let (t, f) = capture(*df);
                fit_drift(&t, &f).unwrap()
            })
            .collect();
        let fit = fit_tempco(&drifts).unwrap();
        assert!((fit.fmin - FMIN).abs() < 1e-2);
        assert!((fit.fmin_temp - 40.0).abs() < 1e-4);
        assert!((fit.a_a - 1.0e-7).abs() < 1e-9);
        assert!((fit.a_b - 0.5).abs() < 1e-6);
        assert!((fit.b_a + 1.0e-5).abs() < 1e-7);
        assert!((fit.b_b + 40.0).abs() < 1e-4);

        let text = fit.to_toml().unwrap();
        assert!(text.starts_with("[scanner]"));
        let parsed: Table = text.parse().unwrap();
        let section = parsed["scanner"].as_table().unwrap();
        assert!((section["tc_fmin_temp"].as_float().unwrap() - 40.0).abs() < 1e-4);
        assert_eq!(section["tc_b_b"].as_float(), Some(fit.b_b));
    }

    #[test]
    fn non_finite_coefficients_stay_valid_toml() {
        let fit = TempcoFit {
            a_a: f64::NAN,
            a_b: 0.5,
            b_a: -1.0e-5,
            b_b: -40.0,
            fmin: FMIN,
            fmin_temp: 40.0,
        };
        let parsed: Table = fit.to_toml().unwrap().parse().unwrap();
        let section = parsed["scanner"].as_table().unwrap();
        assert!(section["tc_a_a"].as_float().unwrap().is_nan());
        assert_eq!(section["tc_fmin"].as_float(), Some(FMIN));
    }

    #[test]
    fn linear_drift_pins_the_vertex_at_the_limit() {
        let temps: Vec<f64> = (0..100).map(|i| 25.0 + f64::from(i) * 0.5).collect();
        let freqs: Vec<f64> = temps.iter().map(|t| FMIN - 30.0 * t).collect();
        let d = fit_drift(&temps, &freqs).unwrap();
        assert_eq!(d.a, 0.0);
        assert!((d.b + 30.0).abs() < 1e-6);
        assert_eq!(d.vertex_temp, MAX_VERTEX_TEMP);
        assert!((d.vertex_freq - (FMIN - 3600.0)).abs() < 1e-3);
    }

    #[test]
    fn all_linear_captures_zero_the_quadratic_terms() {
        let drifts: Vec<Drift> = [0.0, 1_000.0, 3_000.0]
            .iter()
            .map(|off| Drift {
                a: 0.0,
                b: -30.0 - off * 1e-3,
                vertex_temp: MAX_VERTEX_TEMP,
                vertex_freq: FMIN + off,
            })
            .collect();
        let fit = fit_tempco(&drifts).unwrap();
        assert_eq!((fit.a_a, fit.a_b), (0.0, 0.0));
        assert!((fit.b_a + 1e-3).abs() < 1e-9);
        assert!((fit.b_b + 30.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_or_identical_captures_fail() {
        let d = Drift {
            a: 0.5,
            b: -40.0,
            vertex_temp: 40.0,
            vertex_freq: FMIN,
        };
        assert!(fit_tempco(&[d, d]).is_err());
        let err = fit_tempco(&[d, d, d]).unwrap_err();
        assert!(err.to_string().contains("different heights"));
        assert!(fit_drift(&[1.0; 21], &[2.0; 21]).is_err());
    }
}
