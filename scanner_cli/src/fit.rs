//! Offline fitting: scan models from calibration dumps, tc_* from captures.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use scanner_config::ProbeMode;
use scanner_core::ScannerModel;
use scanner_core::calibrate::{CalibrationPoint, fit_model};
use scanner_core::tempfit::{SKIP_ROWS, fit_drift, fit_tempco};
use serde_json::json;
use toml::{Table, Value};

use crate::cli::{FitMode, json_mode};

impl From<FitMode> for ProbeMode {
    fn from(m: FitMode) -> Self {
        match m {
            FitMode::Scan => Self::Scan,
            FitMode::Touch => Self::Touch,
        }
    }
}

/// `[models.NAME]` section for `model`, as `load_toml` reads it back.
pub fn model_toml(model: &ScannerModel) -> Result<String> {
    let mut section = Table::new();
    section.insert(
        "model_coef".into(),
        Value::Array(model.poly.coef().iter().map(|c| Value::Float(*c)).collect()),
    );
    let [d0, d1] = model.poly.domain();
    section.insert("model_domain".into(), Value::Array(vec![d0.into(), d1.into()]));
    section.insert(
        "model_range".into(),
        Value::Array(vec![model.min_z.into(), model.max_z.into()]),
    );
    section.insert("model_temp".into(), model.temp.into());
    section.insert("model_offset".into(), model.offset.into());
    section.insert("model_mode".into(), model.mode.clone().into());
    section.insert("model_fw_version".into(), model.fw_version.clone().into());

    let mut models = Table::new();
    models.insert(model.name.clone(), Value::Table(section));
    let mut root = Table::new();
    root.insert("models".into(), Value::Table(models));
    toml::to_string(&root).wrap_err("render model TOML")
}

/// `scanner fit`.
pub fn fit(dump: &Path, name: &str, mode: FitMode, fw_version: &str) -> Result<()> {
    let rows = scanner_config::load_calibration_csv(dump)?;
    let points: Vec<CalibrationPoint> = rows.into_iter().map(CalibrationPoint::from).collect();
    let model = fit_model(name, &points, mode.into(), fw_version)?;
    tracing::info!(name, samples = points.len(), "model fitted");

    if json_mode() {
        println!(
            "{}",
            json!({
                "name": model.name,
                "model_coef": model.poly.coef(),
                "model_domain": model.poly.domain(),
                "model_range": [model.min_z, model.max_z],
                "model_temp": model.temp,
            })
        );
    } else {
        print!("{}", model_toml(&model)?);
    }
    Ok(())
}

/// Compensation target used to report how flat each capture becomes.
const CHECK_TEMP: f64 = 50.0;

/// `scanner tempfit`.
pub fn tempfit(logs: &[PathBuf]) -> Result<()> {
    let mut captures = Vec::with_capacity(logs.len());
    let mut drifts = Vec::with_capacity(logs.len());
    for path in logs {
        let rows = scanner_config::load_stream_csv(path)?;
        let temps: Vec<f64> = rows.iter().map(|r| r.temp).collect();
        let freqs: Vec<f64> = rows.iter().map(|r| r.freq).collect();
        let drift = fit_drift(&temps, &freqs)
            .wrap_err_with(|| format!("fit capture {}", path.display()))?;
        tracing::info!(path = %path.display(), ?drift, "capture fitted");
        drifts.push(drift);
        captures.push((temps, freqs));
    }
    let fit = fit_tempco(&drifts)?;

    // Residual drift of each capture once compensated to CHECK_TEMP.
    let ranges: Vec<f64> = match fit.builder().build() {
        Some(model) => captures
            .iter()
            .map(|(temps, freqs)| {
                let comp = temps
                    .iter()
                    .zip(freqs)
                    .skip(SKIP_ROWS)
                    .map(|(t, f)| model.compensate(*f, *t, CHECK_TEMP));
                let (lo, hi) = comp.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
                hi - lo
            })
            .collect(),
        None => Vec::new(),
    };

    if json_mode() {
        println!(
            "{}",
            json!({
                "tc_a_a": fit.a_a,
                "tc_a_b": fit.a_b,
                "tc_b_a": fit.b_a,
                "tc_b_b": fit.b_b,
                "tc_fmin": fit.fmin,
                "tc_fmin_temp": fit.fmin_temp,
                "compensated_range_hz": ranges,
            })
        );
    } else {
        print!("{}", fit.to_toml()?);
        for (path, range) in logs.iter().zip(&ranges) {
            println!("# {}: {range:.0} Hz left after compensation", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanner_core::polynomial::Polynomial;

    #[test]
    fn model_section_loads_back() {
        let model = ScannerModel {
            name: "bench".into(),
            poly: Polynomial::new(vec![1.5, -0.25, 0.125], [2.0e-7, 4.0e-7]),
            temp: 31.5,
            min_z: 0.1,
            max_z: 5.0,
            offset: 0.0,
            mode: "scan".into(),
            fw_version: "CARTOGRAPHER 5.1.0".into(),
        };
        let text = model_toml(&model).unwrap();
        let cfg = scanner_config::load_toml(&text).unwrap();
        let m = &cfg.models["bench"];
        assert_eq!(m.model_coef, vec![1.5, -0.25, 0.125]);
        assert_eq!(m.model_range, [0.1, 5.0]);
        assert_eq!(m.model_mode, "scan");
    }
}
