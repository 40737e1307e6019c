//! Calibrated frequency to distance models and the registry of named models.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use scanner_config::ModelCfg;
use scanner_traits::ConfigStore;

use crate::error::{Result, ScannerError, fail};
use crate::polynomial::Polynomial;
use crate::temp_model::TempModel;

/// Bisection iterations before inversion is declared divergent.
const MAX_INVERT_ITERATIONS: usize = 50;
/// Default tolerance of `dist_to_freq_raw`.
pub const INVERT_TOLERANCE: f64 = 1e-8;

/// Polynomial of distance over inverse frequency, valid on `[min_z, max_z]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerModel {
    pub name: String,
    pub poly: Polynomial,
    /// Coil temperature during calibration.
    pub temp: f64,
    pub min_z: f64,
    pub max_z: f64,
    pub offset: f64,
    /// Trigger mode the model was calibrated for (`scan` / `touch`).
    pub mode: String,
    pub fw_version: String,
}

impl ScannerModel {
    pub fn from_cfg(name: &str, cfg: &ModelCfg) -> Self {
        Self {
            name: name.to_string(),
            poly: Polynomial::new(cfg.model_coef.clone(), cfg.model_domain),
            temp: cfg.model_temp,
            min_z: cfg.model_range[0],
            max_z: cfg.model_range[1],
            offset: cfg.model_offset,
            mode: cfg.model_mode.clone(),
            fw_version: cfg.model_fw_version.clone(),
        }
    }

    pub fn section(&self) -> String {
        format!("scanner model {}", self.name)
    }

    /// Distance for `freq` with no temperature compensation.
    ///
    /// Readings beyond the calibrated domain map to `+inf` (too far) or
    /// `-inf` (too close), never to a clamped value.
    pub fn freq_to_dist_raw(&self, freq: f64) -> f64 {
        let invfreq = 1.0 / freq;
        let [begin, end] = self.poly.domain();
        if invfreq > end {
            f64::INFINITY
        } else if invfreq < begin {
            f64::NEG_INFINITY
        } else {
            self.poly.eval(invfreq) - self.offset
        }
    }

    pub fn freq_to_dist(&self, freq: f64, temp: f64, tempco: Option<&TempModel>) -> f64 {
        let freq = match tempco {
            Some(tc) => tc.compensate(freq, temp, self.temp),
            None => freq,
        };
        self.freq_to_dist_raw(freq)
    }

    /// Frequency producing `dist`, by bisection over the domain.
    pub fn dist_to_freq_raw(&self, dist: f64, max_e: f64) -> Result<f64> {
        if !(self.min_z..=self.max_z).contains(&dist) {
            return Err(fail(ScannerError::calibration(format!(
                "Attempted to map out-of-range distance {dist:.6}, valid range [{:.3}, {:.3}]",
                self.min_z, self.max_z
            ))));
        }
        let target = dist + self.offset;
        let [mut begin, mut end] = self.poly.domain();
        for _ in 0..MAX_INVERT_ITERATIONS {
            let f = (begin + end) / 2.0;
            let v = self.poly.eval(f);
            if (v - target).abs() < max_e {
                return Ok(1.0 / f);
            } else if v < target {
                begin = f;
            } else {
                end = f;
            }
        }
        Err(fail(ScannerError::calibration("Scanner model convergence error")))
    }

    pub fn dist_to_freq(&self, dist: f64, temp: f64, tempco: Option<&TempModel>) -> Result<f64> {
        let freq = self.dist_to_freq_raw(dist, INVERT_TOLERANCE)?;
        Ok(match tempco {
            Some(tc) => tc.compensate(freq, self.temp, temp),
            None => freq,
        })
    }

    /// Refuse models made by other firmware or for the other trigger mode.
    pub fn validate(&self, firmware_version: &str, mode: &str) -> Result<()> {
        if self.fw_version != firmware_version {
            return Err(fail(ScannerError::calibration(format!(
                "Scanner model '{}' was created with firmware version '{}',current firmware version is '{}'. Please recalibrate your threshold and model.",
                self.name, self.fw_version, firmware_version
            ))));
        }
        if self.mode != mode {
            return Err(fail(ScannerError::calibration(format!(
                "Scanner model '{}' was created for '{}'. Please create a new model for use with '{}'.",
                self.name, self.mode, mode
            ))));
        }
        Ok(())
    }

    /// Persist under `[scanner model NAME]`.
    pub fn save(&self, store: &mut dyn ConfigStore, mode: &str) {
        let section = self.section();
        let coef = self
            .poly
            .coef()
            .iter()
            .map(|c| format!("{c:?}"))
            .collect::<Vec<_>>()
            .join(",\n  ");
        let [d0, d1] = self.poly.domain();
        store.set(&section, "model_coef", &coef);
        store.set(&section, "model_domain", &format!("{d0:?},{d1:?}"));
        store.set(
            &section,
            "model_range",
            &format!("{:.6},{:.6}", self.min_z, self.max_z),
        );
        store.set(&section, "model_temp", &format!("{:.6}", self.temp));
        store.set(&section, "model_offset", &format!("{:.5}", self.offset));
        store.set(&section, "model_mode", mode);
        store.set(&section, "model_fw_version", &self.fw_version);
    }
}

pub fn save_message(name: &str) -> String {
    format!(
        "Scanner calibration for model '{name}' has been updated\nfor the current session. The SAVE_CONFIG command will\nupdate the printer config file and restart the printer."
    )
}

/// Named models and the active one.
///
/// The active model is an `Arc` snapshot; replacing it swaps the reference,
/// so an operation holding the old snapshot keeps consistent coefficients.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ScannerModel>>,
    active: Option<Arc<ScannerModel>>,
}

impl ModelRegistry {
    pub fn from_cfg(models: &BTreeMap<String, ModelCfg>) -> Self {
        let models = models
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(ScannerModel::from_cfg(name, cfg))))
            .collect();
        Self {
            models,
            active: None,
        }
    }

    /// Add a model read from config; names must be unique.
    pub fn load(&mut self, model: ScannerModel) -> Result<()> {
        if self.models.contains_key(&model.name) {
            return Err(fail(ScannerError::config(format!(
                "Multiple Scanner models with same name '{}'",
                model.name
            ))));
        }
        self.models.insert(model.name.clone(), Arc::new(model));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScannerModel>> {
        self.models.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn active(&self) -> Option<Arc<ScannerModel>> {
        self.active.clone()
    }

    pub fn set_active(&mut self, model: Option<Arc<ScannerModel>>) {
        self.active = model;
    }

    /// Insert or replace a model and make it active.
    pub fn register(&mut self, model: ScannerModel) -> Arc<ScannerModel> {
        let model = Arc::new(model);
        self.models.insert(model.name.clone(), Arc::clone(&model));
        self.active = Some(Arc::clone(&model));
        model
    }

    pub fn select(&mut self, name: &str) -> Result<Arc<ScannerModel>> {
        let model = self
            .get(name)
            .ok_or_else(|| fail(ScannerError::config(format!("Unknown model '{name}'"))))?;
        self.active = Some(Arc::clone(&model));
        Ok(model)
    }

    /// Drop a model; clears the active model if it was the one removed.
    pub fn remove(&mut self, name: &str) -> Result<Arc<ScannerModel>> {
        let model = self
            .models
            .remove(name)
            .ok_or_else(|| fail(ScannerError::config(format!("Unknown model '{name}'"))))?;
        if self.active.as_ref().is_some_and(|a| a.name == name) {
            self.active = None;
        }
        Ok(model)
    }

    /// Console listing used by MODEL_LIST.
    pub fn listing(&self) -> String {
        if self.models.is_empty() {
            return "No Scanner models loaded".to_string();
        }
        let active = self.active.as_ref().map(|m| m.name.as_str());
        let mut out = "List of loaded Scanner models:".to_string();
        for name in self.models.keys() {
            if Some(name.as_str()) == active {
                let _ = write!(out, "\n- {name} [active]");
            } else {
                let _ = write!(out, "\n- {name}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scanner_config::PendingConfig;

    /// Linear model: z = 10·(x' + 1) over inverse frequency domain
    /// [1/4MHz, 1/2MHz], so z spans 0..20 mm.
    pub(crate) fn linear_model() -> ScannerModel {
        ScannerModel {
            name: "default".into(),
            poly: Polynomial::new(vec![10.0, 10.0], [1.0 / 4.0e6, 1.0 / 2.0e6]),
            temp: 30.0,
            min_z: 0.5,
            max_z: 5.0,
            offset: 0.0,
            mode: "scan".into(),
            fw_version: "CARTOGRAPHER 5.1.0".into(),
        }
    }

    #[test]
    fn out_of_domain_signs() {
        let m = linear_model();
        assert_eq!(m.freq_to_dist_raw(1.0e6), f64::INFINITY);
        assert_eq!(m.freq_to_dist_raw(5.0e6), f64::NEG_INFINITY);
        assert!((m.freq_to_dist_raw(4.0e6) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_distance_is_rejected() {
        let m = linear_model();
        let err = m.dist_to_freq_raw(7.0, INVERT_TOLERANCE).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Attempted to map out-of-range distance 7.000000, valid range [0.500, 5.000]"
        );
    }

    #[test]
    fn unreachable_tolerance_fails_to_converge() {
        let m = linear_model();
        let err = m.dist_to_freq_raw(2.0, 0.0).unwrap_err();
        assert_eq!(err.to_string(), "Scanner model convergence error");
    }

    #[test]
    fn offset_shifts_distance() {
        let mut m = linear_model();
        let f = m.dist_to_freq_raw(2.0, INVERT_TOLERANCE).unwrap();
        m.offset = 0.25;
        assert!((m.freq_to_dist_raw(f) - 1.75).abs() < 1e-6);
    }

    #[test]
    fn validate_reports_firmware_then_mode() {
        let m = linear_model();
        assert!(m.validate("CARTOGRAPHER 5.1.0", "scan").is_ok());
        let err = m.validate("CARTOGRAPHER 6.0.0", "touch").unwrap_err();
        assert!(err.to_string().contains("firmware version 'CARTOGRAPHER 5.1.0'"));
        let err = m.validate("CARTOGRAPHER 5.1.0", "touch").unwrap_err();
        assert!(err.to_string().contains("was created for 'scan'"));
    }

    #[test]
    fn save_writes_all_keys() {
        let m = linear_model();
        let mut store = PendingConfig::new();
        m.save(&mut store, "scan");
        let sec = "scanner model default";
        assert_eq!(store.get(sec, "model_coef"), Some("10.0,\n  10.0"));
        assert_eq!(store.get(sec, "model_range"), Some("0.500000,5.000000"));
        assert_eq!(store.get(sec, "model_temp"), Some("30.000000"));
        assert_eq!(store.get(sec, "model_offset"), Some("0.00000"));
        assert_eq!(store.get(sec, "model_mode"), Some("scan"));
        assert_eq!(store.get(sec, "model_fw_version"), Some("CARTOGRAPHER 5.1.0"));
    }

    #[test]
    fn registry_select_remove_list() {
        let mut reg = ModelRegistry::default();
        assert_eq!(reg.listing(), "No Scanner models loaded");
        reg.load(linear_model()).unwrap();
        let mut other = linear_model();
        other.name = "pei".into();
        reg.load(other).unwrap();
        assert!(reg.load(linear_model()).is_err());

        reg.select("pei").unwrap();
        assert_eq!(
            reg.listing(),
            "List of loaded Scanner models:\n- default\n- pei [active]"
        );
        assert!(reg.select("nope").is_err());
        reg.remove("pei").unwrap();
        assert!(reg.active().is_none());
    }

    #[test]
    fn swapped_model_leaves_snapshot_intact() {
        let mut reg = ModelRegistry::default();
        reg.register(linear_model());
        let snapshot = reg.active().unwrap();
        let mut newer = linear_model();
        newer.offset = 1.0;
        reg.register(newer);
        assert_eq!(snapshot.offset, 0.0);
        assert_eq!(reg.active().unwrap().offset, 1.0);
    }

    proptest! {
        #[test]
        fn inversion_round_trips(dist in 0.5f64..=5.0) {
            let m = linear_model();
            let f = m.dist_to_freq_raw(dist, INVERT_TOLERANCE).unwrap();
            prop_assert!((m.freq_to_dist_raw(f) - dist).abs() <= 2.0 * INVERT_TOLERANCE);
        }

        #[test]
        fn beyond_domain_is_infinite(freq in 1.0e3f64..1.0e9) {
            let m = linear_model();
            let d = m.freq_to_dist_raw(freq);
            prop_assert!(!d.is_nan());
            let inv = 1.0 / freq;
            let [b, e] = m.poly.domain();
            if inv > e { prop_assert_eq!(d, f64::INFINITY); }
            if inv < b { prop_assert_eq!(d, f64::NEG_INFINITY); }
        }
    }
}
