//! Console command table and typed parameters.
//!
//! Names are resolved once when the table is built; dispatch is a `match`
//! on [`Command`] in `Scanner::run_command`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ScannerError, fail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    Probe,
    ProbeAccuracy,
    ZOffsetApplyProbe,
    BedMeshCalibrate,
    Calibrate,
    Touch,
    ThresholdScan,
    EstimateBacklash,
    Query,
    Stream,
    ProbeSwitch,
    ModelSelect,
    ModelSave,
    ModelRemove,
    ModelList,
}

impl Command {
    /// Commands registered without the sensor prefix.
    const UNPREFIXED: [(&'static str, Self); 4] = [
        ("PROBE", Self::Probe),
        ("PROBE_ACCURACY", Self::ProbeAccuracy),
        ("Z_OFFSET_APPLY_PROBE", Self::ZOffsetApplyProbe),
        ("BED_MESH_CALIBRATE", Self::BedMeshCalibrate),
    ];

    /// Suffixes registered as `<SENSOR>_<SUFFIX>`.
    const PREFIXED: [(&'static str, Self); 13] = [
        ("CALIBRATE", Self::Calibrate),
        ("TOUCH", Self::Touch),
        ("TOUCH_HOME", Self::Touch),
        ("THRESHOLD_SCAN", Self::ThresholdScan),
        ("ESTIMATE_BACKLASH", Self::EstimateBacklash),
        ("QUERY", Self::Query),
        ("STREAM", Self::Stream),
        ("PROBE_SWITCH", Self::ProbeSwitch),
        ("OFFSET_APPLY", Self::ZOffsetApplyProbe),
        ("MODEL_SELECT", Self::ModelSelect),
        ("MODEL_SAVE", Self::ModelSave),
        ("MODEL_REMOVE", Self::ModelRemove),
        ("MODEL_LIST", Self::ModelList),
    ];

    pub const fn help(self) -> &'static str {
        match self {
            Self::Probe => "Probe Z-height at current XY position",
            Self::ProbeAccuracy => "Probe Z-height accuracy at current XY position",
            Self::ZOffsetApplyProbe => "Adjust the probe's z_offset",
            Self::BedMeshCalibrate => "Perform Mesh Bed Leveling",
            Self::Calibrate => "Calibrate scanner response curve",
            Self::Touch => "Home in TOUCH mode",
            Self::ThresholdScan => "Scan THRESHOLD in TOUCH mode",
            Self::EstimateBacklash => "Estimate Z axis backlash",
            Self::Query => "Take a sample from the sensor",
            Self::Stream => "Enable Scanner Streaming",
            Self::ProbeSwitch => "Switch between scan and touch",
            Self::ModelSelect => "Load named scanner model",
            Self::ModelSave => "Save current scanner model",
            Self::ModelRemove => "Remove saved scanner model",
            Self::ModelList => "List loaded scanner models",
        }
    }
}

/// Upper-case command name to [`Command`].
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: BTreeMap<String, Command>,
}

impl CommandTable {
    /// Register every command for each sensor prefix given.
    pub fn new<'a>(prefixes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries: BTreeMap<String, Command> = Command::UNPREFIXED
            .iter()
            .map(|(name, cmd)| ((*name).to_string(), *cmd))
            .collect();
        for prefix in prefixes {
            let prefix = prefix.to_uppercase();
            for (suffix, cmd) in Command::PREFIXED {
                entries.insert(format!("{prefix}_{suffix}"), cmd);
            }
        }
        Self { entries }
    }

    pub fn resolve(&self, name: &str) -> Option<Command> {
        self.entries.get(&name.to_uppercase()).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = (&str, Command)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), *c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounds checked by the typed getters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds<T> {
    pub minval: Option<T>,
    pub maxval: Option<T>,
    pub above: Option<T>,
    pub below: Option<T>,
}

impl<T> Bounds<T> {
    pub const fn none() -> Self {
        Self {
            minval: None,
            maxval: None,
            above: None,
            below: None,
        }
    }

    #[must_use]
    pub fn min(mut self, v: T) -> Self {
        self.minval = Some(v);
        self
    }

    #[must_use]
    pub fn max(mut self, v: T) -> Self {
        self.maxval = Some(v);
        self
    }

    #[must_use]
    pub fn above(mut self, v: T) -> Self {
        self.above = Some(v);
        self
    }

    #[must_use]
    pub fn below(mut self, v: T) -> Self {
        self.below = Some(v);
        self
    }
}

/// `KEY=VALUE` parameters of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandParams {
    command: String,
    values: BTreeMap<String, String>,
}

impl CommandParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            values: BTreeMap::new(),
        }
    }

    /// Parse `KEY=VALUE` words; keys are case-insensitive.
    pub fn parse(command: impl Into<String>, args: &str) -> Result<Self> {
        let mut params = Self::new(command);
        for word in args.split_whitespace() {
            let Some((key, value)) = word.split_once('=') else {
                return Err(fail(ScannerError::host(format!(
                    "Malformed command '{}': expected KEY=VALUE, got '{word}'",
                    params.command
                ))));
            };
            params.values.insert(key.to_uppercase(), value.to_string());
        }
        Ok(params)
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.values.insert(key.to_uppercase(), value.to_string());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_uppercase())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_uppercase()).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Required string parameter.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            self.error(format!("Error on '{}': missing {key}", self.command))
        })
    }

    fn error(&self, msg: String) -> eyre::Report {
        fail(ScannerError::Host(msg))
    }

    fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.parse::<T>().map(Some).map_err(|_| {
            self.error(format!(
                "Error on '{}': unable to parse {raw}",
                self.command
            ))
        })
    }

    fn check<T: PartialOrd + fmt::Display + Copy>(
        &self,
        key: &str,
        v: T,
        b: Bounds<T>,
    ) -> Result<T> {
        let name = &self.command;
        if let Some(m) = b.minval.filter(|m| v < *m) {
            return Err(self.error(format!("Error on '{name}': {key} must have minimum of {m}")));
        }
        if let Some(m) = b.maxval.filter(|m| v > *m) {
            return Err(self.error(format!("Error on '{name}': {key} must have maximum of {m}")));
        }
        if let Some(m) = b.above.filter(|m| v <= *m) {
            return Err(self.error(format!("Error on '{name}': {key} must be above {m}")));
        }
        if let Some(m) = b.below.filter(|m| v >= *m) {
            return Err(self.error(format!("Error on '{name}': {key} must be below {m}")));
        }
        Ok(v)
    }

    pub fn float(&self, key: &str, default: f64, bounds: Bounds<f64>) -> Result<f64> {
        let v = self.parse_value::<f64>(key)?.unwrap_or(default);
        if !v.is_finite() {
            return Err(self.error(format!(
                "Error on '{}': unable to parse {v}",
                self.command
            )));
        }
        self.check(key, v, bounds)
    }

    pub fn int(&self, key: &str, default: i64, bounds: Bounds<i64>) -> Result<i64> {
        let v = self.parse_value::<i64>(key)?.unwrap_or(default);
        self.check(key, v, bounds)
    }

    /// Optional integer; bounds only apply when present.
    pub fn opt_int(&self, key: &str, bounds: Bounds<i64>) -> Result<Option<i64>> {
        self.parse_value::<i64>(key)?
            .map(|v| self.check(key, v, bounds))
            .transpose()
    }

    pub fn opt_float(&self, key: &str) -> Result<Option<f64>> {
        self.parse_value::<f64>(key)
    }

    /// Non-negative count.
    pub fn count(&self, key: &str, default: usize, min: usize) -> Result<usize> {
        let v = self.int(key, default as i64, Bounds::none().min(min as i64))?;
        Ok(usize::try_from(v).unwrap_or(min))
    }

    /// Integer flag, nonzero meaning set.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.int(key, i64::from(default), Bounds::none())? != 0)
    }

    /// `X,Y` pair, e.g. `MESH_MIN=10,20`.
    pub fn pair<T: FromStr>(&self, key: &str) -> Result<Option<[T; 2]>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let parsed = raw
            .split_once(',')
            .and_then(|(a, b)| Some([a.trim().parse().ok()?, b.trim().parse().ok()?]));
        parsed
            .map(Some)
            .ok_or_else(|| self.error(format!("Unable to parse parameter '{key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_resolves_prefixed_aliases() {
        let t = CommandTable::new(["cartographer", "scanner"]);
        assert_eq!(t.resolve("CARTOGRAPHER_QUERY"), Some(Command::Query));
        assert_eq!(t.resolve("scanner_touch_home"), Some(Command::Touch));
        assert_eq!(t.resolve("SCANNER_OFFSET_APPLY"), Some(Command::ZOffsetApplyProbe));
        assert_eq!(t.resolve("PROBE"), Some(Command::Probe));
        assert_eq!(t.resolve("IDM_QUERY"), None);
        assert_eq!(t.len(), 4 + 2 * 13);
    }

    #[test]
    fn bound_violations_use_host_wording() {
        let p = CommandParams::parse("CARTOGRAPHER_TOUCH", "threshold=50 speed=0").unwrap();
        let err = p
            .int("THRESHOLD", 2500, Bounds::none().min(100))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error on 'CARTOGRAPHER_TOUCH': THRESHOLD must have minimum of 100"
        );
        let err = p.float("SPEED", 3.0, Bounds::none().above(0.0)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error on 'CARTOGRAPHER_TOUCH': SPEED must be above 0"
        );
        assert_eq!(p.float("RETRACT", 2.0, Bounds::none().min(1.0)).unwrap(), 2.0);
    }

    #[test]
    fn pairs_and_garbage() {
        let p = CommandParams::parse("BED_MESH_CALIBRATE", "MESH_MIN=10,20.5 PROBE_COUNT=x").unwrap();
        assert_eq!(p.pair::<f64>("MESH_MIN").unwrap(), Some([10.0, 20.5]));
        assert!(p.pair::<usize>("PROBE_COUNT").is_err());
        assert!(CommandParams::parse("PROBE", "SAMPLES").is_err());
    }
}
