//! Runtime settings of the scanner driver.
//!
//! These are the structs the core reads while running. They are separate
//! from the TOML schema in `scanner_config`; `conversions` maps one onto the
//! other.

use std::path::PathBuf;

pub use scanner_config::{Interpolation, MeshDirection, ProbeMode, SamplesResult};

/// Signal path and endstop threshold settings.
#[derive(Debug, Clone)]
pub struct SensorSettings {
    /// Lower-case sensor name used as command and wire prefix, e.g. `cartographer`.
    pub name: String,
    /// Optional alias also accepted as a command prefix.
    pub alt_name: Option<String>,
    pub trigger_distance: f64,
    pub trigger_hysteresis: f64,
    /// Samples skipped after a move before a reading counts.
    pub z_settling_time: usize,
    pub filter_alpha: f64,
    pub filter_beta: f64,
    pub warning_disable: bool,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            name: "cartographer".to_string(),
            alt_name: None,
            trigger_distance: 2.0,
            trigger_hysteresis: 0.006,
            z_settling_time: 5,
            filter_alpha: 0.5,
            filter_beta: 0.000_001,
            warning_disable: false,
        }
    }
}

/// Scan probing motion and `PROBE_ACCURACY` sampling.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub speed: f64,
    pub lift_speed: f64,
    pub probe_speed: f64,
    pub backlash_comp: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_hop_dist: f64,
    pub z_hop_speed: f64,
    pub trigger_dive_threshold: f64,
    pub samples: usize,
    pub samples_retract_dist: f64,
    pub samples_tolerance: f64,
    pub samples_tolerance_retries: usize,
    pub samples_result: SamplesResult,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            speed: 5.0,
            lift_speed: 5.0,
            probe_speed: 5.0,
            backlash_comp: 0.5,
            x_offset: 0.0,
            y_offset: 0.0,
            z_hop_dist: 5.0,
            z_hop_speed: 5.0,
            trigger_dive_threshold: 1.5,
            samples: 5,
            samples_retract_dist: 5.0,
            samples_tolerance: 0.2,
            samples_tolerance_retries: 4,
            samples_result: SamplesResult::Median,
        }
    }
}

/// Touch homing defaults; every field can be overridden per command.
#[derive(Debug, Clone)]
pub struct TouchSettings {
    pub max_speed: f64,
    pub accel: f64,
    pub speed: f64,
    pub retract_dist: f64,
    pub retract_speed: f64,
    pub sample_count: usize,
    pub tolerance: f64,
    pub max_retries: usize,
    pub move_speed: f64,
    pub calibrate: bool,
    pub z_offset: f64,
    pub threshold: u32,
    pub max_temp: f64,
    pub fuzzy_touch: f64,
    pub location: [f64; 2],
}

impl Default for TouchSettings {
    fn default() -> Self {
        Self {
            max_speed: 10.0,
            accel: 100.0,
            speed: 3.0,
            retract_dist: 2.0,
            retract_speed: 10.0,
            sample_count: 3,
            tolerance: 0.01,
            max_retries: 10,
            move_speed: 50.0,
            calibrate: false,
            z_offset: 0.05,
            threshold: 2500,
            max_temp: 150.0,
            fuzzy_touch: 0.0,
            location: [117.5, 117.5],
        }
    }
}

/// Scan model calibration sweep.
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    pub nozzle_z: f64,
    pub floor: f64,
    pub ceil: f64,
    pub speed: f64,
    pub move_speed: f64,
    pub default_model_name: String,
    /// Directory for `scanner-calibrate-*.csv` dumps; no dump when unset.
    pub dump_dir: Option<PathBuf>,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            nozzle_z: 0.1,
            floor: 0.1,
            ceil: 5.0,
            speed: 1.0,
            move_speed: 10.0,
            default_model_name: "default".to_string(),
            dump_dir: None,
        }
    }
}

/// Axis-aligned faulty rectangle in bed coordinates (open interval).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Region {
    /// Normalises corner order.
    pub fn new(a: [f64; 2], b: [f64; 2]) -> Self {
        Self {
            x_min: a[0].min(b[0]),
            x_max: a[0].max(b[0]),
            y_min: a[1].min(b[1]),
            y_max: a[1].max(b[1]),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x > self.x_min && x < self.x_max && y > self.y_min && y < self.y_max
    }
}

/// Configured zero reference of a mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZeroReference {
    /// Grid index counted row-major from the minimum corner.
    Index(i64),
    /// Bed coordinate sampled during the scan.
    Position([f64; 2]),
}

/// Scan mesh helper settings; present only for rectangular beds.
#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub speed: f64,
    pub min: [f64; 2],
    pub max: [f64; 2],
    pub probe_count: [usize; 2],
    pub relative_reference_index: Option<i64>,
    pub zero_reference_position: Option<[f64; 2]>,
    pub zero_reference_cluster_size: f64,
    pub direction: MeshDirection,
    /// `None` means derived from the machine limits at connect.
    pub overscan: Option<f64>,
    pub cluster_size: f64,
    pub runs: usize,
    pub adaptive_margin: f64,
    pub interpolation: Interpolation,
    pub faulty_regions: Vec<Region>,
}

impl MeshSettings {
    /// Position wins over index when both are configured.
    pub fn zero_reference(&self) -> Option<ZeroReference> {
        self.zero_reference_position
            .map(ZeroReference::Position)
            .or(self.relative_reference_index.map(ZeroReference::Index))
    }
}

/// Everything the scanner needs from the printer config.
#[derive(Debug, Clone, Default)]
pub struct ScannerSettings {
    pub sensor: SensorSettings,
    pub probe: ProbeSettings,
    pub touch: TouchSettings,
    pub calibration: CalibrationSettings,
    pub mesh: Option<MeshSettings>,
    pub mode: ProbeMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_open_and_normalised() {
        let r = Region::new([50.0, 60.0], [40.0, 20.0]);
        assert_eq!(r.x_min, 40.0);
        assert_eq!(r.y_max, 60.0);
        assert!(r.contains(45.0, 30.0));
        assert!(!r.contains(40.0, 30.0));
    }

    #[test]
    fn position_beats_index() {
        let m = MeshSettings {
            speed: 50.0,
            min: [10.0, 10.0],
            max: [200.0, 200.0],
            probe_count: [5, 5],
            relative_reference_index: Some(12),
            zero_reference_position: Some([100.0, 100.0]),
            zero_reference_cluster_size: 1.0,
            direction: MeshDirection::X,
            overscan: None,
            cluster_size: 1.0,
            runs: 1,
            adaptive_margin: 0.0,
            interpolation: Interpolation::Rbf,
            faulty_regions: Vec::new(),
        };
        assert_eq!(m.zero_reference(), Some(ZeroReference::Position([100.0, 100.0])));
    }
}
