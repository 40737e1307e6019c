//! `From` implementations bridging `scanner_config` types to `scanner_core` types.

use std::path::PathBuf;

use crate::config::{
    CalibrationSettings, MeshSettings, ProbeSettings, Region, ScannerSettings, SensorSettings,
    TouchSettings,
};
use crate::temp_model::TempModelBuilder;

// ── SensorSettings ───────────────────────────────────────────────────────────

impl From<&scanner_config::Config> for SensorSettings {
    fn from(c: &scanner_config::Config) -> Self {
        let s = &c.scanner;
        let primary = s.sensor.as_ref().or(s.sensor_alt.as_ref());
        Self {
            name: primary.map_or_else(|| "scanner".to_string(), |n| n.to_lowercase()),
            alt_name: s
                .sensor
                .as_ref()
                .and(s.sensor_alt.as_ref())
                .map(|n| n.to_lowercase()),
            trigger_distance: s.trigger_distance,
            trigger_hysteresis: s.trigger_hysteresis,
            z_settling_time: s.z_settling_time,
            filter_alpha: s.filter_alpha,
            filter_beta: s.filter_beta,
            warning_disable: s.model_temp_warning_disable,
        }
    }
}

// ── ProbeSettings ────────────────────────────────────────────────────────────

impl From<&scanner_config::Config> for ProbeSettings {
    fn from(c: &scanner_config::Config) -> Self {
        let s = &c.scanner;
        let (z_hop_dist, z_hop_speed) = c.z_hop();
        Self {
            speed: s.speed,
            lift_speed: c.lift_speed(),
            probe_speed: c.probe_speed(),
            backlash_comp: s.backlash_comp,
            x_offset: s.x_offset,
            y_offset: s.y_offset,
            z_hop_dist,
            z_hop_speed,
            trigger_dive_threshold: s.trigger_dive_threshold,
            samples: s.samples,
            samples_retract_dist: s.samples_retract_dist,
            samples_tolerance: s.samples_tolerance,
            samples_tolerance_retries: s.samples_tolerance_retries,
            samples_result: s.samples_result,
        }
    }
}

// ── TouchSettings ────────────────────────────────────────────────────────────

impl From<&scanner_config::Config> for TouchSettings {
    fn from(c: &scanner_config::Config) -> Self {
        let s = &c.scanner;
        Self {
            max_speed: s.scanner_touch_max_speed,
            accel: s.scanner_touch_accel,
            speed: s.scanner_touch_speed,
            retract_dist: s.scanner_touch_retract_dist,
            retract_speed: s.scanner_touch_retract_speed,
            sample_count: s.scanner_touch_sample_count,
            tolerance: s.scanner_touch_tolerance,
            max_retries: s.scanner_touch_max_retries,
            move_speed: s.scanner_touch_move_speed,
            calibrate: s.scanner_touch_calibrate,
            z_offset: s.scanner_touch_z_offset,
            threshold: s.scanner_touch_threshold,
            max_temp: s.scanner_touch_max_temp,
            fuzzy_touch: s.scanner_touch_fuzzy_touch,
            location: c.touch_location(),
        }
    }
}

// ── CalibrationSettings ──────────────────────────────────────────────────────

impl From<&scanner_config::ScannerCfg> for CalibrationSettings {
    fn from(s: &scanner_config::ScannerCfg) -> Self {
        Self {
            nozzle_z: s.cal_nozzle_z,
            floor: s.cal_floor,
            ceil: s.cal_ceil,
            speed: s.cal_speed,
            move_speed: s.cal_move_speed,
            default_model_name: s.default_model_name.clone(),
            dump_dir: s.calibration_dump_dir.as_ref().map(PathBuf::from),
        }
    }
}

// ── MeshSettings ─────────────────────────────────────────────────────────────

impl MeshSettings {
    /// Scan mesh settings, or `None` for round beds and printers without
    /// `[bed_mesh]`.
    pub fn from_config(c: &scanner_config::Config) -> Option<Self> {
        let m = c.scan_mesh()?;
        let s = &c.scanner;
        if m.zero_reference_position.is_some() && m.relative_reference_index.is_some() {
            tracing::info!(
                "both zero_reference_position and relative_reference_index are set, using the former"
            );
        }
        Some(Self {
            speed: m.speed,
            min: m
                .mesh_min
                .unwrap_or([c.printer.position_min[0], c.printer.position_min[1]]),
            max: m
                .mesh_max
                .unwrap_or([c.printer.position_max[0], c.printer.position_max[1]]),
            probe_count: m.probe_count,
            relative_reference_index: m.relative_reference_index,
            zero_reference_position: m.zero_reference_position,
            zero_reference_cluster_size: s.zero_reference_cluster_size,
            direction: s.mesh_main_direction,
            overscan: s.mesh_overscan,
            cluster_size: s.mesh_cluster_size,
            runs: s.mesh_runs,
            adaptive_margin: m.adaptive_margin,
            interpolation: s.mesh_interpolation,
            faulty_regions: m
                .faulty_region
                .iter()
                .map(|r| Region::new(r.min, r.max))
                .collect(),
        })
    }
}

// ── TempModelBuilder ─────────────────────────────────────────────────────────

impl From<&scanner_config::ScannerCfg> for TempModelBuilder {
    fn from(s: &scanner_config::ScannerCfg) -> Self {
        Self {
            a_a: s.tc_a_a,
            a_b: s.tc_a_b,
            b_a: s.tc_b_a,
            b_b: s.tc_b_b,
            fmin: s.tc_fmin,
            fmin_temp: s.tc_fmin_temp,
        }
    }
}

// ── ScannerSettings ──────────────────────────────────────────────────────────

impl From<&scanner_config::Config> for ScannerSettings {
    fn from(c: &scanner_config::Config) -> Self {
        Self {
            sensor: c.into(),
            probe: c.into(),
            touch: c.into(),
            calibration: (&c.scanner).into(),
            mesh: MeshSettings::from_config(c),
            mode: c.scanner.mode,
        }
    }
}
