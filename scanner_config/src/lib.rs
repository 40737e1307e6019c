#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and CSV loaders for the scanner probe driver.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Calibration dumps (`freq,z,temp`) and STREAM logs are loaded with strict
//!   header checks.
//! - `PendingConfig` collects runtime saves (models, thresholds, mode).
use std::collections::BTreeMap;

use serde::Deserialize;

mod pending;

pub use pending::PendingConfig;

/// Operating mode of the probe.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    #[default]
    Scan,
    Touch,
}

impl ProbeMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Touch => "touch",
        }
    }
}

/// How repeated probe samples are reduced to one value.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplesResult {
    #[default]
    Median,
    Average,
}

/// Main travel direction of the serpentine mesh path.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshDirection {
    #[default]
    #[serde(alias = "X", rename = "x")]
    X,
    #[serde(alias = "Y", rename = "y")]
    Y,
}

/// Reconstruction method for cells inside faulty regions.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Thin-plate radial basis functions over the nearest 64 cells.
    #[default]
    Rbf,
    /// Piecewise-linear over a triangulation of the good cells.
    Linear,
    /// No interpolator available; faulty regions become a mesh error.
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScannerCfg {
    pub sensor: Option<String>,
    pub sensor_alt: Option<String>,
    pub speed: f64,
    pub lift_speed: Option<f64>,
    pub probe_speed: Option<f64>,
    pub backlash_comp: f64,
    /// Name of an external temperature sensor replacing the coil thermistor.
    pub temp_sensor_override: Option<String>,
    pub model_temp_warning_disable: bool,
    pub samples: usize,
    pub samples_retract_dist: f64,
    pub samples_tolerance: f64,
    pub samples_tolerance_retries: usize,
    pub samples_result: SamplesResult,
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_hop_dist: f64,
    pub z_hop_speed: f64,
    #[serde(alias = "calibration_method")]
    pub mode: ProbeMode,
    pub trigger_distance: f64,
    pub trigger_dive_threshold: f64,
    pub trigger_hysteresis: f64,
    /// Samples skipped after a move before a reading counts.
    pub z_settling_time: usize,
    /// Renamed to `scanner_touch_threshold`; rejected by `validate`.
    pub detect_threshold_z: Option<i64>,
    pub scanner_touch_max_speed: f64,
    pub scanner_touch_accel: f64,
    pub scanner_touch_speed: f64,
    pub scanner_touch_retract_dist: f64,
    pub scanner_touch_retract_speed: f64,
    pub scanner_touch_sample_count: usize,
    pub scanner_touch_tolerance: f64,
    pub scanner_touch_max_retries: usize,
    pub scanner_touch_move_speed: f64,
    pub scanner_touch_calibrate: bool,
    pub scanner_touch_z_offset: f64,
    pub scanner_touch_threshold: u32,
    pub scanner_touch_max_temp: f64,
    pub scanner_touch_fuzzy_touch: f64,
    pub scanner_touch_location: Option<[f64; 2]>,
    pub cal_nozzle_z: f64,
    pub cal_floor: f64,
    pub cal_ceil: f64,
    pub cal_speed: f64,
    pub cal_move_speed: f64,
    pub default_model_name: String,
    pub filter_alpha: f64,
    pub filter_beta: f64,
    pub mesh_main_direction: MeshDirection,
    /// Overscan distance in mm; absent means computed from the axis limits.
    pub mesh_overscan: Option<f64>,
    pub mesh_cluster_size: f64,
    pub mesh_runs: usize,
    pub zero_reference_cluster_size: f64,
    pub mesh_interpolation: Interpolation,
    /// Directory receiving `scanner-calibrate-*.csv` dumps.
    pub calibration_dump_dir: Option<String>,
    pub tc_a_a: Option<f64>,
    pub tc_a_b: Option<f64>,
    pub tc_b_a: Option<f64>,
    pub tc_b_b: Option<f64>,
    pub tc_fmin: Option<f64>,
    pub tc_fmin_temp: Option<f64>,
}

impl Default for ScannerCfg {
    fn default() -> Self {
        Self {
            sensor: None,
            sensor_alt: None,
            speed: 5.0,
            lift_speed: None,
            probe_speed: None,
            backlash_comp: 0.5,
            temp_sensor_override: None,
            model_temp_warning_disable: false,
            samples: 5,
            samples_retract_dist: 5.0,
            samples_tolerance: 0.2,
            samples_tolerance_retries: 4,
            samples_result: SamplesResult::Median,
            x_offset: 0.0,
            y_offset: 0.0,
            z_hop_dist: 5.0,
            z_hop_speed: 5.0,
            mode: ProbeMode::Scan,
            trigger_distance: 2.0,
            trigger_dive_threshold: 1.5,
            trigger_hysteresis: 0.006,
            z_settling_time: 5,
            detect_threshold_z: None,
            scanner_touch_max_speed: 10.0,
            scanner_touch_accel: 100.0,
            scanner_touch_speed: 3.0,
            scanner_touch_retract_dist: 2.0,
            scanner_touch_retract_speed: 10.0,
            scanner_touch_sample_count: 3,
            scanner_touch_tolerance: 0.01,
            scanner_touch_max_retries: 10,
            scanner_touch_move_speed: 50.0,
            scanner_touch_calibrate: false,
            scanner_touch_z_offset: 0.05,
            scanner_touch_threshold: 2500,
            scanner_touch_max_temp: 150.0,
            scanner_touch_fuzzy_touch: 0.0,
            scanner_touch_location: None,
            cal_nozzle_z: 0.1,
            cal_floor: 0.1,
            cal_ceil: 5.0,
            cal_speed: 1.0,
            cal_move_speed: 10.0,
            default_model_name: "default".to_string(),
            filter_alpha: 0.5,
            filter_beta: 0.000_001,
            mesh_main_direction: MeshDirection::X,
            mesh_overscan: None,
            mesh_cluster_size: 1.0,
            mesh_runs: 1,
            zero_reference_cluster_size: 1.0,
            mesh_interpolation: Interpolation::Rbf,
            calibration_dump_dir: None,
            tc_a_a: None,
            tc_a_b: None,
            tc_b_a: None,
            tc_b_b: None,
            tc_fmin: None,
            tc_fmin_temp: None,
        }
    }
}

/// Persisted calibration record of one named model.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelCfg {
    pub model_coef: Vec<f64>,
    pub model_domain: [f64; 2],
    /// `[min_z, max_z]` covered by the calibration sweep.
    pub model_range: [f64; 2],
    pub model_temp: f64,
    #[serde(default)]
    pub model_offset: f64,
    #[serde(default = "unknown_mode")]
    pub model_mode: String,
    #[serde(default = "unknown_fw")]
    pub model_fw_version: String,
}

fn unknown_mode() -> String {
    "unknown".to_string()
}

fn unknown_fw() -> String {
    "UNKNOWN".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct FaultyRegion {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BedMeshCfg {
    pub speed: f64,
    pub mesh_min: Option<[f64; 2]>,
    pub mesh_max: Option<[f64; 2]>,
    pub probe_count: [usize; 2],
    pub relative_reference_index: Option<i64>,
    pub zero_reference_position: Option<[f64; 2]>,
    pub adaptive_margin: f64,
    /// Round beds use the stock probing helper; set to disable the scan mesh.
    pub mesh_radius: Option<f64>,
    pub faulty_region: Vec<FaultyRegion>,
}

impl Default for BedMeshCfg {
    fn default() -> Self {
        Self {
            speed: 50.0,
            mesh_min: None,
            mesh_max: None,
            probe_count: [3, 3],
            relative_reference_index: None,
            zero_reference_position: None,
            adaptive_margin: 0.0,
            mesh_radius: None,
            faulty_region: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SafeZHomeCfg {
    pub z_hop: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PrinterCfg {
    pub position_min: [f64; 3],
    pub position_max: [f64; 3],
    pub max_accel: f64,
}

impl Default for PrinterCfg {
    fn default() -> Self {
        Self {
            position_min: [0.0, 0.0, -2.0],
            position_max: [235.0, 235.0, 250.0],
            max_accel: 3000.0,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerCfg,
    /// Named calibration models, `[models.NAME]`.
    pub models: BTreeMap<String, ModelCfg>,
    pub bed_mesh: Option<BedMeshCfg>,
    pub safe_z_home: Option<SafeZHomeCfg>,
    pub printer: PrinterCfg,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn lift_speed(&self) -> f64 {
        self.scanner.lift_speed.unwrap_or(self.scanner.speed)
    }

    pub fn probe_speed(&self) -> f64 {
        self.scanner.probe_speed.unwrap_or(self.scanner.speed)
    }

    /// Z-hop distance and speed; `[safe_z_home]` wins over the scanner keys.
    pub fn z_hop(&self) -> (f64, f64) {
        let szh = self.safe_z_home.as_ref();
        let dist = szh
            .and_then(|s| s.z_hop)
            .unwrap_or(self.scanner.z_hop_dist);
        let speed = szh
            .and_then(|s| s.speed)
            .unwrap_or(self.scanner.z_hop_speed);
        (dist, speed)
    }

    /// Nozzle touch location: explicit setting, else the mesh zero reference,
    /// else the bed centre.
    pub fn touch_location(&self) -> [f64; 2] {
        self.scanner
            .scanner_touch_location
            .or_else(|| {
                self.bed_mesh
                    .as_ref()
                    .and_then(|m| m.zero_reference_position)
            })
            .unwrap_or([
                self.printer.position_max[0] / 2.0,
                self.printer.position_max[1] / 2.0,
            ])
    }

    /// The bed mesh section when the scan mesh helper is in use.
    pub fn scan_mesh(&self) -> Option<&BedMeshCfg> {
        self.bed_mesh.as_ref().filter(|m| m.mesh_radius.is_none())
    }

    pub fn validate(&self) -> eyre::Result<()> {
        let s = &self.scanner;
        if s.sensor.is_none() && s.sensor_alt.is_none() {
            eyre::bail!("Please set at least one sensor type (sensor or sensor_alt) in printer.cfg");
        }
        if s.detect_threshold_z.is_some() {
            eyre::bail!("Please change detect_threshold_z to scanner_touch_threshold in printer.cfg");
        }

        // Motion
        if s.speed <= 0.0 {
            eyre::bail!("scanner.speed must be > 0");
        }
        if self.lift_speed() <= 0.0 {
            eyre::bail!("scanner.lift_speed must be > 0");
        }
        if self.probe_speed() <= 0.0 {
            eyre::bail!("scanner.probe_speed must be > 0");
        }
        let (hop, hop_speed) = self.z_hop();
        if hop < 0.0 || hop_speed <= 0.0 {
            eyre::bail!("z_hop_dist must be >= 0 and z_hop_speed must be > 0");
        }

        // Probe sampling
        if s.samples == 0 {
            eyre::bail!("scanner.samples must be >= 1");
        }
        if s.samples_retract_dist <= 0.0 {
            eyre::bail!("scanner.samples_retract_dist must be > 0");
        }
        if s.samples_tolerance < 0.0 {
            eyre::bail!("scanner.samples_tolerance must be >= 0");
        }
        if !(s.filter_alpha > 0.0 && s.filter_alpha <= 1.0) {
            eyre::bail!("scanner.filter_alpha must be in (0.0, 1.0]");
        }
        if s.filter_beta < 0.0 {
            eyre::bail!("scanner.filter_beta must be >= 0");
        }

        // Touch
        if !(s.scanner_touch_max_speed > 0.0 && s.scanner_touch_max_speed <= 30.0) {
            eyre::bail!("scanner.scanner_touch_max_speed must be in (0, 30]");
        }
        if s.scanner_touch_speed > s.scanner_touch_max_speed {
            eyre::bail!(
                "scanner.scanner_touch_speed must be <= scanner_touch_max_speed ({})",
                s.scanner_touch_max_speed
            );
        }
        if s.scanner_touch_accel < 100.0 {
            eyre::bail!("scanner.scanner_touch_accel must be >= 100");
        }
        if s.scanner_touch_retract_dist < 1.0 {
            eyre::bail!("scanner.scanner_touch_retract_dist must be >= 1");
        }
        if s.scanner_touch_retract_speed < 1.0 {
            eyre::bail!("scanner.scanner_touch_retract_speed must be >= 1");
        }
        if s.scanner_touch_sample_count == 0 {
            eyre::bail!("scanner.scanner_touch_sample_count must be >= 1");
        }
        if s.scanner_touch_tolerance <= 0.0 {
            eyre::bail!("scanner.scanner_touch_tolerance must be > 0");
        }
        if s.scanner_touch_move_speed < 1.0 {
            eyre::bail!("scanner.scanner_touch_move_speed must be >= 1");
        }
        if s.scanner_touch_fuzzy_touch > 10.0 {
            eyre::bail!("scanner.scanner_touch_fuzzy_touch must be <= 10");
        }

        // Calibration sweep
        if !(1.0..=5.0).contains(&s.cal_speed) {
            eyre::bail!("scanner.cal_speed must be in [1, 5]");
        }
        if s.cal_move_speed < 1.0 {
            eyre::bail!("scanner.cal_move_speed must be >= 1");
        }
        if s.cal_ceil <= s.cal_floor {
            eyre::bail!("scanner.cal_ceil must be greater than cal_floor");
        }

        // Mesh
        if let Some(os) = s.mesh_overscan
            && os < 0.0
        {
            eyre::bail!("scanner.mesh_overscan must be >= 0 (omit it for automatic overscan)");
        }
        if s.mesh_cluster_size < 0.0 || s.zero_reference_cluster_size < 0.0 {
            eyre::bail!("scanner cluster sizes must be >= 0");
        }
        if s.mesh_runs == 0 {
            eyre::bail!("scanner.mesh_runs must be >= 1");
        }

        if let Some(mesh) = &self.bed_mesh {
            self.validate_bed_mesh(mesh)?;
        }

        // Models
        for (name, m) in &self.models {
            if m.model_coef.is_empty() {
                eyre::bail!("models.{name}.model_coef must not be empty");
            }
            if m.model_domain[0] >= m.model_domain[1] || m.model_domain.iter().any(|v| v.is_nan()) {
                eyre::bail!("models.{name}.model_domain must be increasing");
            }
            if m.model_range[0] > m.model_range[1] {
                eyre::bail!("models.{name}.model_range must be [min_z, max_z]");
            }
        }

        Ok(())
    }

    fn validate_bed_mesh(&self, mesh: &BedMeshCfg) -> eyre::Result<()> {
        if mesh.mesh_radius.is_some() {
            return Ok(());
        }
        if mesh.zero_reference_position.is_none() {
            let use_x = self.printer.position_max[0] / 2.0;
            let use_y = self.printer.position_max[1] / 2.0;
            eyre::bail!(
                "Please update your [bed_mesh] section to include zero_reference_position: {use_x:.2},{use_y:.2} in printer.cfg.\nPlease read the manual"
            );
        }
        if mesh.speed <= 0.0 {
            eyre::bail!("bed_mesh.speed must be > 0");
        }
        let (Some(min), Some(max)) = (mesh.mesh_min, mesh.mesh_max) else {
            eyre::bail!("bed_mesh.mesh_min and bed_mesh.mesh_max are required");
        };
        if min[0] >= max[0] || min[1] >= max[1] {
            eyre::bail!("bed_mesh.mesh_min must be below bed_mesh.mesh_max on both axes");
        }
        if mesh.probe_count[0] < 3 || mesh.probe_count[1] < 3 {
            eyre::bail!("bed_mesh.probe_count must be >= 3 on both axes");
        }
        Ok(())
    }
}

/// Calibration dump schema.
///
/// Expected headers:
/// freq,z,temp
///
/// Example:
/// freq,z,temp
/// 3229514.12500,5.10000,31.250
/// 3229901.87500,5.09000,31.250
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub freq: f64,
    pub z: f64,
    pub temp: f64,
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<Vec<CalibrationRow>> {
    let rows: Vec<CalibrationRow> = load_strict_csv(path, &["freq", "z", "temp"], "calibration")?;
    if rows.is_empty() {
        eyre::bail!("calibration CSV {:?} contains no samples", path);
    }
    for (idx, r) in rows.iter().enumerate() {
        if !(r.freq.is_finite() && r.freq > 0.0) {
            eyre::bail!("invalid CSV row {}: freq must be a positive number", idx + 2);
        }
        if !r.z.is_finite() {
            eyre::bail!("invalid CSV row {}: z must be finite", idx + 2);
        }
    }
    Ok(rows)
}

/// One line of a `STREAM FILENAME=...` capture. Position and velocity are
/// empty when no trajectory covered the sample.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct StreamRow {
    pub time: f64,
    pub data: u32,
    pub data_smooth: f64,
    pub freq: f64,
    pub dist: Option<f64>,
    pub temp: f64,
    pub pos_x: Option<f64>,
    pub pos_y: Option<f64>,
    pub pos_z: Option<f64>,
    pub vel: Option<f64>,
}

pub const STREAM_HEADERS: [&str; 10] = [
    "time",
    "data",
    "data_smooth",
    "freq",
    "dist",
    "temp",
    "pos_x",
    "pos_y",
    "pos_z",
    "vel",
];

pub fn load_stream_csv(path: &std::path::Path) -> eyre::Result<Vec<StreamRow>> {
    load_strict_csv(path, &STREAM_HEADERS, "stream log")
}

fn load_strict_csv<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
    expected: &[&str],
    what: &str,
) -> eyre::Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open {} CSV {:?}: {}", what, path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<String> = headers.iter().map(|s| s.trim().to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "{} CSV must have headers '{}', got: {}",
            what,
            expected.join(","),
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<T>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    Ok(rows)
}
