//! Shared setup for the simulator-backed integration tests.
#![allow(dead_code)]

use scanner_config::Config;
use scanner_core::Scanner;
use scanner_hardware::{SimConfig, SimulatedPrinter};

pub const SCAN_CFG: &str = r#"
[scanner]
sensor = "cartographer"
x_offset = 0.0
y_offset = 0.0
mesh_cluster_size = 1.0

[bed_mesh]
mesh_min = [60.0, 60.0]
mesh_max = [180.0, 180.0]
probe_count = [5, 5]
zero_reference_position = [117.5, 117.5]

[printer]
position_min = [0.0, 0.0, -2.0]
position_max = [235.0, 235.0, 250.0]
"#;

pub const TOUCH_CFG: &str = r#"
[scanner]
sensor = "cartographer"
mode = "touch"
scanner_touch_threshold = 2500

[bed_mesh]
mesh_min = [60.0, 60.0]
mesh_max = [180.0, 180.0]
zero_reference_position = [117.5, 117.5]
"#;

pub fn config(toml: &str) -> Config {
    let cfg = scanner_config::load_toml(toml).expect("config parses");
    cfg.validate().expect("config is valid");
    cfg
}

/// Simulated printer matching `cfg`, with X and Y already homed.
pub fn sim_for(cfg: &Config, tweak: impl FnOnce(&mut SimConfig)) -> SimulatedPrinter {
    let mut sim_cfg = SimConfig::for_printer(cfg);
    tweak(&mut sim_cfg);
    let sim = SimulatedPrinter::new(sim_cfg);
    sim.home_xy();
    sim
}

pub fn scanner(cfg: &Config, sim: &SimulatedPrinter) -> Scanner {
    Scanner::builder()
        .with_config(cfg)
        .with_host(sim)
        .with_clock(Box::new(sim.clock()))
        .with_seed(42)
        .try_build()
        .expect("scanner builds")
}

pub fn console_has(sim: &SimulatedPrinter, needle: &str) -> bool {
    sim.console().iter().any(|l| l.contains(needle))
}

/// Calibrate a scan model with the paper test at the bed origin.
pub fn calibrated(toml: &str) -> (Scanner, SimulatedPrinter) {
    let cfg = config(toml);
    let sim = sim_for(&cfg, |_| {});
    let mut sc = scanner(&cfg, &sim);
    sc.run_line("CARTOGRAPHER_CALIBRATE").expect("calibration runs");
    (sc, sim)
}
