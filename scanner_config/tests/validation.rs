use rstest::rstest;
use scanner_config::{Interpolation, MeshDirection, ProbeMode, load_toml};

const BASE: &str = r#"
[scanner]
sensor = "cartographer"
"#;

#[test]
fn defaults_follow_driver_defaults() {
    let cfg = load_toml(BASE).expect("parse TOML");
    cfg.validate().expect("minimal config should pass");
    let s = &cfg.scanner;
    assert_eq!(s.speed, 5.0);
    assert_eq!(cfg.lift_speed(), 5.0);
    assert_eq!(cfg.probe_speed(), 5.0);
    assert_eq!(s.trigger_distance, 2.0);
    assert_eq!(s.trigger_dive_threshold, 1.5);
    assert_eq!(s.scanner_touch_threshold, 2500);
    assert_eq!(s.mode, ProbeMode::Scan);
    assert_eq!(s.mesh_main_direction, MeshDirection::X);
    assert_eq!(s.mesh_interpolation, Interpolation::Rbf);
    assert_eq!(cfg.z_hop(), (5.0, 5.0));
}

#[test]
fn rejects_missing_sensor() {
    let cfg = load_toml("[scanner]\nspeed = 5.0\n").expect("parse TOML");
    let err = cfg.validate().expect_err("no sensor");
    assert!(format!("{err}").contains("Please set at least one sensor type"));
}

#[test]
fn sensor_alt_alone_is_enough() {
    let cfg = load_toml("[scanner]\nsensor_alt = \"idm\"\n").expect("parse TOML");
    cfg.validate().expect("sensor_alt satisfies the sensor requirement");
}

#[test]
fn rejects_renamed_detect_threshold_key() {
    let toml = format!("{BASE}detect_threshold_z = 2000\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("renamed key");
    assert!(format!("{err}").contains("change detect_threshold_z to scanner_touch_threshold"));
}

#[test]
fn calibration_method_is_an_alias_for_mode() {
    let toml = format!("{BASE}calibration_method = \"touch\"\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    assert_eq!(cfg.scanner.mode, ProbeMode::Touch);
}

#[test]
fn bed_mesh_without_zero_reference_suggests_bed_centre() {
    let toml = format!(
        "{BASE}\n[printer]\nposition_max = [300.0, 250.0, 300.0]\n\n[bed_mesh]\nmesh_min = [10.0, 10.0]\nmesh_max = [290.0, 240.0]\nprobe_count = [5, 5]\n"
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("missing zero reference");
    assert!(
        format!("{err}").contains("zero_reference_position: 150.00,125.00 in printer.cfg"),
        "{err}"
    );
}

#[test]
fn mesh_radius_disables_scan_mesh_checks() {
    let toml = format!("{BASE}\n[bed_mesh]\nmesh_radius = 100.0\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("round beds skip the scan mesh checks");
    assert!(cfg.scan_mesh().is_none());
}

#[test]
fn safe_z_home_overrides_hop() {
    let toml = format!("{BASE}z_hop_dist = 3.0\n\n[safe_z_home]\nz_hop = 10.0\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    assert_eq!(cfg.z_hop(), (10.0, 5.0));
}

#[test]
fn touch_location_falls_back_to_zero_reference() {
    let toml = format!(
        "{BASE}\n[bed_mesh]\nmesh_min = [10.0, 10.0]\nmesh_max = [200.0, 200.0]\nzero_reference_position = [117.5, 117.5]\n"
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("valid mesh");
    assert_eq!(cfg.touch_location(), [117.5, 117.5]);
}

#[rstest]
#[case("speed = 0.0", "scanner.speed must be > 0")]
#[case("cal_speed = 6.0", "scanner.cal_speed must be in [1, 5]")]
#[case("scanner_touch_max_speed = 31.0", "scanner_touch_max_speed must be in (0, 30]")]
#[case("scanner_touch_speed = 12.0", "scanner_touch_speed must be <= scanner_touch_max_speed")]
#[case("scanner_touch_accel = 50.0", "scanner_touch_accel must be >= 100")]
#[case("scanner_touch_tolerance = 0.0", "scanner_touch_tolerance must be > 0")]
#[case("scanner_touch_fuzzy_touch = 11.0", "scanner_touch_fuzzy_touch must be <= 10")]
#[case("mesh_runs = 0", "scanner.mesh_runs must be >= 1")]
#[case("mesh_overscan = -2.0", "mesh_overscan must be >= 0")]
#[case("filter_alpha = 1.5", "filter_alpha must be in (0.0, 1.0]")]
fn rejects_out_of_range_values(#[case] line: &str, #[case] msg: &str) {
    let toml = format!("{BASE}{line}\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(format!("{err}").contains(msg), "{err}");
}

#[test]
fn rejects_small_probe_count() {
    let toml = format!(
        "{BASE}\n[bed_mesh]\nmesh_min = [10.0, 10.0]\nmesh_max = [200.0, 200.0]\nprobe_count = [2, 5]\nzero_reference_position = [100.0, 100.0]\n"
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("probe_count");
    assert!(format!("{err}").contains("probe_count must be >= 3"));
}

#[test]
fn parses_models_and_faulty_regions() {
    let toml = format!(
        r#"{BASE}
[models.default]
model_coef = [1.5, -1.2, 0.3]
model_domain = [3.1e-7, 3.3e-7]
model_range = [0.1, 5.0]
model_temp = 31.5
model_offset = 0.02
model_mode = "scan"
model_fw_version = "CARTOGRAPHER 5.1.0"

[bed_mesh]
mesh_min = [10.0, 10.0]
mesh_max = [200.0, 200.0]
zero_reference_position = [100.0, 100.0]

[[bed_mesh.faulty_region]]
min = [50.0, 60.0]
max = [40.0, 80.0]
"#
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("valid");
    let m = &cfg.models["default"];
    assert_eq!(m.model_coef.len(), 3);
    assert_eq!(m.model_range, [0.1, 5.0]);
    assert_eq!(m.model_fw_version, "CARTOGRAPHER 5.1.0");
    let mesh = cfg.scan_mesh().expect("scan mesh enabled");
    assert_eq!(mesh.faulty_region.len(), 1);
    assert_eq!(mesh.faulty_region[0].max, [40.0, 80.0]);
}

#[test]
fn model_defaults_mark_unknown_origin() {
    let toml = format!(
        "{BASE}\n[models.old]\nmodel_coef = [1.0]\nmodel_domain = [0.1, 0.2]\nmodel_range = [0.1, 5.0]\nmodel_temp = 0.0\n"
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    let m = &cfg.models["old"];
    assert_eq!(m.model_mode, "unknown");
    assert_eq!(m.model_fw_version, "UNKNOWN");
    assert_eq!(m.model_offset, 0.0);
}
