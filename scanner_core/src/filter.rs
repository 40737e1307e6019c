//! Fixed-gain alpha-beta tracker smoothing the raw frequency counts.

#[derive(Debug, Clone)]
pub struct AlphaBetaFilter {
    alpha: f64,
    beta: f64,
    xl: Option<f64>,
    vl: f64,
    tl: Option<f64>,
}

impl AlphaBetaFilter {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            xl: None,
            vl: 0.0,
            tl: None,
        }
    }

    /// Forget all state; the next update seeds the estimate.
    pub fn reset(&mut self) {
        self.xl = None;
        self.vl = 0.0;
        self.tl = None;
    }

    /// Feed one measurement taken at `time` and return the corrected estimate.
    pub fn update(&mut self, time: f64, measurement: f64) -> f64 {
        let xl = *self.xl.get_or_insert(measurement);
        let dt = self.tl.map_or(0.0, |tl| time - tl);
        self.tl = Some(time);

        let predicted = xl + self.vl * dt;
        let residual = measurement - predicted;
        let xk = predicted + self.alpha * residual;
        if dt > 0.0 {
            self.vl += self.beta / dt * residual;
        }
        self.xl = Some(xk);
        xk
    }

    /// Last estimate, `None` before the first update.
    pub fn value(&self) -> Option<f64> {
        self.xl
    }

    pub fn velocity(&self) -> f64 {
        self.vl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_update_seeds_estimate() {
        let mut f = AlphaBetaFilter::new(0.5, 1e-6);
        assert_eq!(f.value(), None);
        assert_eq!(f.update(1.0, 1000.0), 1000.0);
        assert_eq!(f.velocity(), 0.0);
    }

    #[test]
    fn reset_reseeds() {
        let mut f = AlphaBetaFilter::new(0.5, 1e-6);
        f.update(1.0, 1000.0);
        f.update(1.002, 2000.0);
        f.reset();
        assert_eq!(f.update(5.0, 42.0), 42.0);
    }

    #[test]
    fn half_alpha_moves_halfway() {
        let mut f = AlphaBetaFilter::new(0.5, 0.0);
        f.update(0.0, 0.0);
        assert_eq!(f.update(0.002, 100.0), 50.0);
    }

    proptest! {
        #[test]
        fn converges_on_constant_input(
            alpha in 0.1f64..0.9,
            beta in 0.01f64..0.5,
            start in -1.0e6f64..1.0e6,
            target in -1.0e6f64..1.0e6,
        ) {
            let dt = 0.002;
            let mut f = AlphaBetaFilter::new(alpha, beta);
            f.update(0.0, start);
            let mut t = 0.0;
            let mut x = start;
            for _ in 0..4000 {
                t += dt;
                x = f.update(t, target);
            }
            let tol = 1e-6 * (1.0 + target.abs().max(start.abs()));
            prop_assert!((x - target).abs() <= tol, "x={x} target={target}");
            prop_assert!(f.velocity().abs() * dt <= tol);
        }
    }
}
