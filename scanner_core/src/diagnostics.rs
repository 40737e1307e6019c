//! Console diagnostics and model management: `QUERY`, `STREAM`,
//! `PROBE_SWITCH` and the `MODEL_*` commands.

use std::fs::File;
use std::path::Path;

use crate::commands::{Bounds, CommandParams};
use crate::config::ProbeMode;
use crate::error::{Result, ScannerError, fail};
use crate::sample::Sample;
use crate::scanner::Scanner;
use crate::session::{Flow, SampleCallback};
use crate::util::format_macro;

pub use scanner_config::STREAM_HEADERS;

/// One `STREAM` log line; position and velocity are blank when no planner
/// move covered the sample.
pub fn stream_row(s: &Sample) -> [String; 10] {
    let pos = |i: usize| s.pos.map_or_else(String::new, |p| format!("{:.3}", p[i]));
    [
        format!("{:.4}", s.time),
        s.data.to_string(),
        format!("{:.2}", s.data_smooth),
        format!("{:.5}", s.freq),
        s.dist.map_or_else(String::new, |d| format!("{d:.5}")),
        format!("{:.2}", s.temp),
        pos(0),
        pos(1),
        pos(2),
        s.vel.map_or_else(String::new, |v| format!("{v:.3}")),
    ]
}

/// Session callback appending every sample to a CSV file.
fn stream_logger(path: &Path) -> Result<SampleCallback> {
    let mut w: csv::Writer<File> = csv::Writer::from_path(path)?;
    w.write_record(STREAM_HEADERS)?;
    let mut failed = false;
    Ok(Box::new(move |s: &Sample| {
        if let Err(e) = w.write_record(stream_row(s)) {
            if !failed {
                tracing::warn!(error = %e, "stream log write failed");
                failed = true;
            }
        }
        Flow::Continue
    }))
}

impl Scanner {
    /// `<SENSOR>_QUERY`.
    pub fn cmd_query(&mut self, _p: &CommandParams) -> Result<()> {
        let sample = self.sensor.sample_async()?;
        let mut last = sample;
        last.dist = sample.finite_dist();
        self.sensor.last_sample = Some(last);
        match sample.dist {
            None => self.respond(&format!(
                "Last reading: {:.2}Hz, {:.2}C, no model",
                sample.freq, sample.temp
            )),
            Some(dist) => self.respond(&format!(
                "Last reading: {:.2}Hz, {:.2}C, {dist:.5}mm",
                sample.freq, sample.temp
            )),
        }
        Ok(())
    }

    /// `<SENSOR>_STREAM`: toggle a CSV capture of every sample.
    pub fn cmd_stream(&mut self, p: &CommandParams) -> Result<()> {
        if let Some(id) = self.log_stream.take() {
            self.sensor.release(id)?;
            self.respond("Scanner Streaming disabled");
            return Ok(());
        }
        let path = self.stream_dir.join(p.require("FILENAME")?);
        let cb = stream_logger(&path)?;
        let shown = path.display().to_string();
        let done = Box::new(move || tracing::info!(path = %shown, "stream log closed"));
        self.log_stream = Some(self.sensor.acquire(cb, None, Some(done))?);
        tracing::info!(path = %path.display(), "stream log opened");
        self.respond("Scanner Streaming enabled");
        Ok(())
    }

    /// `<SENSOR>_PROBE_SWITCH`.
    pub fn cmd_probe_switch(&mut self, p: &CommandParams) -> Result<()> {
        let mode = match p.get_or("MODE", "none").to_lowercase().as_str() {
            "scan" => Some(ProbeMode::Scan),
            "touch" => Some(ProbeMode::Touch),
            _ => None,
        };
        if let Some(mode) = mode {
            self.sensor.probe_mode = mode;
            self.sensor.trigger = self.sensor.trigger.reset();
            self.sensor.store.set("scanner", "mode", mode.as_str());
            self.respond(&format!(
                "Mode switched to {}. Please use {} to save this mode.",
                mode.as_str().to_uppercase(),
                format_macro("SAVE_CONFIG")
            ));
        }

        let current = i64::from(self.sensor.detect_threshold);
        let threshold = p.int("THRESHOLD", current, Bounds::none().min(0))?;
        if threshold != current {
            self.sensor.detect_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
            self.sensor
                .store
                .set("scanner", "scanner_touch_threshold", &threshold.to_string());
            self.respond(&format!("Detect Threshold Changed {threshold}"));
        }
        Ok(())
    }

    /// `<SENSOR>_MODEL_SELECT`.
    pub fn cmd_model_select(&mut self, p: &CommandParams) -> Result<()> {
        let name = p.require("NAME")?;
        self.sensor.models.select(name)?;
        self.respond(&format!("Selected Scanner model '{name}'"));
        Ok(())
    }

    /// `<SENSOR>_MODEL_SAVE`: persist the active model, optionally under a
    /// new name.
    pub fn cmd_model_save(&mut self, p: &CommandParams) -> Result<()> {
        let Some(active) = self.sensor.models.active() else {
            return Err(fail(ScannerError::calibration(format!(
                "No model currently selected - make sure you have run {}_CALIBRATE first",
                self.sensor.name().to_uppercase()
            ))));
        };
        let name = p.get_or("NAME", &active.name).to_string();
        let mut model = (*active).clone();
        model.name.clone_from(&name);
        model.save(self.sensor.store.as_mut(), self.sensor.probe_mode.as_str());
        if name != active.name {
            self.sensor.models.register(model);
            self.sensor.models.set_active(Some(active));
        }
        self.respond(&format!("Scanner model '{name}' saved"));
        Ok(())
    }

    /// `<SENSOR>_MODEL_REMOVE`.
    pub fn cmd_model_remove(&mut self, p: &CommandParams) -> Result<()> {
        let name = p.require("NAME")?;
        let model = self.sensor.models.remove(name)?;
        self.sensor.store.remove_section(&model.section());
        self.respond(&format!(
            "Model '{name}' was removed for the current session.\nRun {} to update the printer configuration and restart the printer.",
            format_macro("SAVE_CONFIG")
        ));
        Ok(())
    }

    /// `<SENSOR>_MODEL_LIST`.
    pub fn cmd_model_list(&mut self, _p: &CommandParams) -> Result<()> {
        let listing = self.sensor.models.listing();
        self.respond(&listing);
        Ok(())
    }
}
