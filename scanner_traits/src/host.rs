//! Printer-level collaborators: console, persistence, bed mesh, sensors.

use crate::HostResult;

/// Bed levelling helper state (quad gantry level or z tilt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedLeveling {
    /// Command that performs the levelling, e.g. `QUAD_GANTRY_LEVEL`.
    pub command: String,
    pub applied: bool,
}

/// Console, shutdown and printer-object lookups.
pub trait Printer {
    fn invoke_shutdown(&mut self, msg: &str);
    fn is_shutdown(&self) -> bool;
    fn respond_info(&mut self, msg: &str);
    fn respond_raw(&mut self, msg: &str);
    /// Current gcode Z offset (`homing_origin.z`).
    fn homing_origin_z(&self) -> f64 {
        0.0
    }
    fn bed_leveling(&self) -> Option<BedLeveling> {
        None
    }
    /// Polygons of the printed objects, or `None` if object exclusion is disabled.
    fn excluded_objects(&self) -> Option<Vec<Vec<[f64; 2]>>> {
        None
    }
}

/// Pending changes to the persisted printer configuration.
pub trait ConfigStore {
    fn set(&mut self, section: &str, key: &str, value: &str);
    fn remove_section(&mut self, section: &str);
}

/// A finished bed mesh handed to the levelling module.
#[derive(Debug, Clone, PartialEq)]
pub struct ZMesh {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub x_count: usize,
    pub y_count: usize,
    /// Row-major, `y_count` rows of `x_count` values.
    pub matrix: Vec<Vec<f64>>,
}

pub trait BedMesh {
    fn set_mesh(&mut self, mesh: ZMesh) -> HostResult<()>;
    fn save_profile(&mut self, name: &str) -> HostResult<()>;
}

/// External temperature sensor overriding the coil thermistor.
pub trait TemperatureSource {
    fn get_temp(&self, print_time: f64) -> f64;
}

/// Axis twist compensation table.
pub trait AxisTwist {
    /// Z correction to subtract from a measured distance at `pos`.
    fn z_compensation(&self, pos: [f64; 3]) -> f64;
}
