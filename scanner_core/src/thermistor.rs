//! Beta-curve thermistor on the coil board.

const KELVIN_TO_CELSIUS: f64 = -273.15;

/// Steinhart-Hart with `c3 = 0`, parameterised by a single beta point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thermistor {
    pullup: f64,
    inline_resistor: f64,
    c1: f64,
    c2: f64,
}

impl Thermistor {
    /// Pullup 10k, beta 4041 at 25C / 47k.
    pub fn coil_board() -> Self {
        Self::beta(10_000.0, 0.0, 25.0, 47_000.0, 4041.0)
    }

    pub fn beta(pullup: f64, inline_resistor: f64, t1: f64, r1: f64, beta: f64) -> Self {
        let inv_t1 = 1.0 / (t1 - KELVIN_TO_CELSIUS);
        let c2 = 1.0 / beta;
        let c1 = inv_t1 - c2 * r1.ln();
        Self {
            pullup,
            inline_resistor,
            c1,
            c2,
        }
    }

    /// Temperature in Celsius for a normalised ADC reading in `[0, 1]`.
    pub fn calc_temp(&self, adc: f64) -> f64 {
        let adc = adc.clamp(0.00001, 0.99999);
        let r = self.pullup * adc / (1.0 - adc);
        let ln_r = (r - self.inline_resistor).ln();
        let inv_t = self.c1 + self.c2 * ln_r;
        1.0 / inv_t + KELVIN_TO_CELSIUS
    }

    /// Normalised ADC reading produced at `temp` Celsius.
    pub fn calc_adc(&self, temp: f64) -> f64 {
        if temp <= KELVIN_TO_CELSIUS {
            return 1.0;
        }
        let inv_t = 1.0 / (temp - KELVIN_TO_CELSIUS);
        let ln_r = (inv_t - self.c1) / self.c2;
        let r = ln_r.exp() + self.inline_resistor;
        r / (self.pullup + r)
    }
}
