use serde::Serialize;

/// One enriched sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// 64-bit MCU clock of acquisition.
    pub clock: u64,
    /// Host print time.
    pub time: f64,
    /// Raw frequency count.
    pub data: u32,
    pub data_smooth: f64,
    /// Coil temperature, Celsius.
    pub temp: f64,
    pub freq: f64,
    /// Distance in mm; `None` without an active model, infinite outside its range.
    pub dist: Option<f64>,
    /// Toolhead position at `time` when a planner move covers it.
    pub pos: Option<[f64; 3]>,
    pub vel: Option<f64>,
}

impl Sample {
    /// Finite distance, if any.
    pub fn finite_dist(&self) -> Option<f64> {
        self.dist.filter(|d| d.is_finite())
    }
}
