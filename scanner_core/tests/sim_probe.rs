//! Calibration, probing and model management against the simulated printer.

mod common;

use common::{SCAN_CFG, calibrated, config, console_has, scanner, sim_for};
use scanner_traits::Toolhead;

#[test]
fn calibration_registers_and_persists_a_model() {
    let (sc, sim) = calibrated(SCAN_CFG);

    let model = sc.sensor().model().expect("model selected after calibration");
    assert_eq!(model.name, "default");
    assert!(console_has(&sim, "Scanner calibrated at"));

    let pending = sim.pending();
    assert_eq!(pending.get("scanner model default", "model_mode"), Some("scan"));

    // The sweep re-homes Z in the physical frame before the final hop.
    let cmd = sim.get_position();
    let phys = sim.physical_position();
    assert!((cmd[2] - phys[2]).abs() < 1e-6, "cmd {cmd:?} phys {phys:?}");
    assert!((phys[2] - 5.0).abs() < 1e-6);
    assert!(!sim.is_streaming());
}

#[test]
fn probe_reports_bed_height_at_trigger_distance() {
    let (mut sc, sim) = calibrated(SCAN_CFG);
    sc.run_line("PROBE").expect("probe runs");

    let z = sc.last_z_result();
    assert!((z - 2.0).abs() < 0.02, "z = {z}");
    assert!(console_has(&sim, "Result is z="));
}

#[test]
fn query_after_probe_reads_the_trigger_distance() {
    let (mut sc, sim) = calibrated(SCAN_CFG);
    sc.run_line("PROBE").expect("probe runs");
    sc.run_line("CARTOGRAPHER_QUERY").expect("query runs");

    let reading = sc.status().last_sample.expect("query records a reading");
    let dist = reading.dist.expect("calibrated reading has a distance");
    assert!((dist - 2.0).abs() < 0.05, "dist = {dist}");
    assert!(console_has(&sim, "mm"));
}

#[test]
fn probe_accuracy_on_a_quiet_bed_is_tight() {
    let (mut sc, sim) = calibrated(SCAN_CFG);
    sc.run_line("PROBE_ACCURACY SAMPLES=3").expect("accuracy runs");

    let line = sim
        .console()
        .into_iter()
        .find(|l| l.starts_with("probe accuracy results"))
        .expect("results line");
    let range: f64 = line
        .split("range ")
        .nth(1)
        .and_then(|rest| rest.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .expect("range value");
    assert!(range < 0.01, "{line}");
}

#[test]
fn probe_without_a_model_fails() {
    let cfg = config(SCAN_CFG);
    let sim = sim_for(&cfg, |_| {});
    let mut sc = scanner(&cfg, &sim);
    sim.home_z_physical();

    let err = sc.run_line("PROBE").unwrap_err();
    assert!(err.to_string().contains("No Scanner model loaded"), "{err}");
}

#[test]
fn models_can_be_copied_listed_and_removed() {
    let (mut sc, sim) = calibrated(SCAN_CFG);

    sc.run_line("CARTOGRAPHER_MODEL_SAVE NAME=backup").expect("save");
    assert_eq!(
        sim.pending().get("scanner model backup", "model_mode"),
        Some("scan")
    );
    // Saving under a new name leaves the active model alone.
    assert_eq!(sc.sensor().model().map(|m| m.name.clone()).as_deref(), Some("default"));

    sim.take_console();
    sc.run_line("CARTOGRAPHER_MODEL_LIST").expect("list");
    let listing = sim.console().join("\n");
    assert!(listing.contains("default") && listing.contains("backup"), "{listing}");

    sc.run_line("CARTOGRAPHER_MODEL_REMOVE NAME=backup").expect("remove");
    assert!(sim.pending().is_removed("scanner model backup"));

    assert!(sc.run_line("CARTOGRAPHER_MODEL_SELECT NAME=backup").is_err());
    sc.run_line("CARTOGRAPHER_MODEL_SELECT NAME=default").expect("select");
}

#[test]
fn failed_commands_leave_the_stream_off() {
    let (mut sc, sim) = calibrated(SCAN_CFG);
    assert!(sc.run_line("BED_MESH_CALIBRATE DIR=z").is_err());
    assert!(!sim.is_streaming());
    assert_eq!(sc.sensor().engaged(), 0);
}
