//! Human-readable error descriptions and structured JSON error formatting.

use scanner_core::error::{BuildError, ScannerError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range values in the [scanner] or [bed_mesh] section.\nHow to fix: Edit the config file, then rerun `scanner check`."
            ),
            other => format!(
                "What happened: The scanner could not be assembled ({other}).\nLikely causes: A host collaborator was not wired into the builder.\nHow to fix: Pass every collaborator (or a simulator via with_host) before build()."
            ),
        };
    }

    if let Some(se) = err.downcast_ref::<ScannerError>() {
        return match se {
            ScannerError::Timeout => "What happened: The sensor stopped delivering samples.\nLikely causes: USB/CAN link dropped or the sensor MCU reset.\nHow to fix: Check the cable and the MCU connection, then restart.".to_string(),
            ScannerError::HardwareFault(msg) => format!(
                "What happened: Sensor fault: {msg}.\nLikely causes: Coil disconnected, damaged or too close to metal.\nHow to fix: Inspect the coil wiring and mounting height."
            ),
            ScannerError::Calibration(msg) => format!(
                "What happened: {msg}.\nLikely causes: No model or a model that does not cover the requested height.\nHow to fix: Run <SENSOR>_CALIBRATE, then save the config."
            ),
            ScannerError::Probe(msg) => format!(
                "What happened: {msg}.\nLikely causes: Axes not homed, noisy touches or a missing model.\nHow to fix: Home the printer and check the probe settings, then retry."
            ),
            ScannerError::Mesh(msg) => format!(
                "What happened: {msg}.\nLikely causes: Mesh bounds, faulty regions or interpolation settings.\nHow to fix: Review [bed_mesh] and scanner.mesh_* options."
            ),
            ScannerError::Config(msg) => format!(
                "What happened: Invalid configuration: {msg}.\nLikely causes: Missing or contradictory keys.\nHow to fix: Edit the config file, then rerun `scanner check`."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config loading
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass an existing TOML file with --config. Original: {msg}"
        );
    }

    if lower.contains("parse config") {
        return format!(
            "What happened: The config file is not valid TOML for the scanner.\nLikely causes: A typo, a wrong value type or an unknown section layout.\nHow to fix: Fix the reported line and rerun `scanner check`. Original: {msg}"
        );
    }

    if lower.contains("must have headers") {
        return format!("Invalid headers in CSV. {msg}");
    }

    if lower.contains("scanner.") || lower.contains("bed_mesh") || lower.contains("printer.cfg") {
        return format!(
            "What happened: Configuration is invalid.\nLikely causes: {msg}\nHow to fix: Edit the TOML config and try again."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes per error family; anything untyped returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() {
        return 3;
    }
    match err.downcast_ref::<ScannerError>() {
        Some(ScannerError::Config(_)) => 3,
        Some(ScannerError::Probe(_)) => 4,
        Some(ScannerError::Calibration(_)) => 5,
        Some(ScannerError::Mesh(_)) => 6,
        Some(ScannerError::HardwareFault(_) | ScannerError::Shutdown(_) | ScannerError::Timeout) => 7,
        _ => 1,
    }
}

/// Name of the error family used in JSON output.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<BuildError>().is_some() {
        return "Build";
    }
    match err.downcast_ref::<ScannerError>() {
        Some(ScannerError::Config(_)) => "Config",
        Some(ScannerError::Calibration(_)) => "Calibration",
        Some(ScannerError::Probe(_)) => "Probe",
        Some(ScannerError::HardwareFault(_)) => "HardwareFault",
        Some(ScannerError::Shutdown(_)) => "Shutdown",
        Some(ScannerError::Host(_)) => "Host",
        Some(ScannerError::Mesh(_)) => "Mesh",
        Some(ScannerError::State(_)) => "State",
        Some(ScannerError::Timeout) => "Timeout",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    })
    .to_string()
}
