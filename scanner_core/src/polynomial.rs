//! Power-series polynomial evaluated in a scaled window.
//!
//! Coefficients act on `x' = off + scl·x`, the linear map taking `domain`
//! onto the window `[-1, 1]`, which keeps high-degree fits well conditioned.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, ScannerError, fail};

const WINDOW: [f64; 2] = [-1.0, 1.0];

#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coef: Vec<f64>,
    domain: [f64; 2],
}

impl Polynomial {
    pub fn new(coef: Vec<f64>, domain: [f64; 2]) -> Self {
        Self { coef, domain }
    }

    pub fn coef(&self) -> &[f64] {
        &self.coef
    }

    pub fn domain(&self) -> [f64; 2] {
        self.domain
    }

    fn map_params(&self) -> (f64, f64) {
        let [d0, d1] = self.domain;
        let scl = (WINDOW[1] - WINDOW[0]) / (d1 - d0);
        let off = WINDOW[0] - scl * d0;
        (off, scl)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let (off, scl) = self.map_params();
        let xm = off + scl * x;
        self.coef.iter().rev().fold(0.0, |acc, c| acc * xm + c)
    }

    /// Least-squares fit of degree `deg` with the domain spanning `x`.
    pub fn fit(x: &[f64], y: &[f64], deg: usize) -> Result<Self> {
        let n = x.len();
        if n != y.len() {
            return Err(fail(ScannerError::calibration(
                "Polynomial fit needs as many x as y values",
            )));
        }
        if n <= deg {
            return Err(fail(ScannerError::calibration(format!(
                "Not enough samples to fit the model: {n} samples for degree {deg}"
            ))));
        }
        let lo = x.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
            return Err(fail(ScannerError::calibration(
                "Calibration samples do not span a frequency range",
            )));
        }
        let domain = [lo, hi];
        let probe = Self::new(Vec::new(), domain);
        let (off, scl) = probe.map_params();

        let mut a = DMatrix::from_fn(n, deg + 1, |i, j| (off + scl * x[i]).powi(j as i32));
        // Column scaling, as the reference least-squares fitters do.
        let norms: Vec<f64> = a
            .column_iter()
            .map(|c| {
                let norm = c.norm();
                if norm == 0.0 { 1.0 } else { norm }
            })
            .collect();
        for (j, norm) in norms.iter().enumerate() {
            a.column_mut(j).unscale_mut(*norm);
        }
        let b = DVector::from_column_slice(y);
        let svd = a.svd(true, true);
        let eps = f64::EPSILON * n as f64;
        let sol = svd
            .solve(&b, eps)
            .map_err(|e| fail(ScannerError::calibration(format!("Polynomial fit failed: {e}"))))?;
        let coef = sol.iter().zip(&norms).map(|(c, norm)| c / norm).collect();
        Ok(Self::new(coef, domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_maps_domain_to_window() {
        // p(x') = 1 + 2x'; domain [10, 20] so x=10 -> -1, x=20 -> 1.
        let p = Polynomial::new(vec![1.0, 2.0], [10.0, 20.0]);
        assert!((p.eval(10.0) + 1.0).abs() < 1e-12);
        assert!((p.eval(15.0) - 1.0).abs() < 1e-12);
        assert!((p.eval(20.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn fit_recovers_cubic() {
        let x: Vec<f64> = (0..40).map(|i| 1.0 + f64::from(i) * 0.05).collect();
        let y: Vec<f64> = x.iter().map(|v| 0.5 - v + 0.25 * v.powi(3)).collect();
        let p = Polynomial::fit(&x, &y, 9).unwrap();
        assert_eq!(p.domain(), [1.0, x[39]]);
        for (xi, yi) in x.iter().zip(&y) {
            assert!((p.eval(*xi) - yi).abs() < 1e-8);
        }
    }

    #[test]
    fn fit_rejects_too_few_points() {
        let err = Polynomial::fit(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 9).unwrap_err();
        assert!(err.to_string().contains("Not enough samples"));
    }
}
