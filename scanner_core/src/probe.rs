//! Scan probing: `PROBE`, `PROBE_ACCURACY`, `Z_OFFSET_APPLY_PROBE` and the
//! backlash estimate.
//!
//! A scan probe never relies on the trigger position alone. The reading at
//! the final height is folded into the kinematic Z as a correction, so the
//! approach direction and backlash stay consistent between probes.

use crate::commands::{Bounds, CommandParams};
use crate::config::ProbeMode;
use crate::error::{Result, ScannerError, fail};
use crate::scanner::Scanner;
use crate::util::{format_macro, median};

/// Samples averaged per scan probe.
const PROBE_SAMPLES: usize = 10;
/// Samples skipped before the first probe reading.
const PROBE_SKIP: usize = 5;
/// Readings within this distance of the median count as in range.
const IN_RANGE_BAND: f64 = 0.05;

/// Summary printed by `PROBE_ACCURACY`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyStats {
    pub max: f64,
    pub min: f64,
    pub range: f64,
    pub avg: f64,
    pub median: f64,
    /// Population standard deviation.
    pub sigma: f64,
    pub in_range: usize,
    pub early: usize,
    pub late: usize,
    pub samples: usize,
}

impl AccuracyStats {
    /// Stats over `zs`, or `None` when nothing was kept.
    pub fn from_zs(zs: &[f64]) -> Option<Self> {
        if zs.is_empty() {
            return None;
        }
        let max = zs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = zs.iter().copied().fold(f64::INFINITY, f64::min);
        let avg = zs.iter().sum::<f64>() / zs.len() as f64;
        let mid = median(zs);
        let (mut in_range, mut early, mut late) = (0, 0, 0);
        for z in zs {
            if (mid - z).abs() < IN_RANGE_BAND {
                in_range += 1;
            } else if *z > mid {
                early += 1;
            } else {
                late += 1;
            }
        }
        let sigma = (zs.iter().map(|z| (z - avg).powi(2)).sum::<f64>() / zs.len() as f64).sqrt();
        Some(Self {
            max,
            min,
            range: max - min,
            avg,
            median: mid,
            sigma,
            in_range,
            early,
            late,
            samples: zs.len(),
        })
    }

    /// Stats of a run that kept no samples.
    pub const fn empty() -> Self {
        Self {
            max: f64::INFINITY,
            min: f64::NEG_INFINITY,
            range: f64::INFINITY,
            avg: f64::INFINITY,
            median: f64::INFINITY,
            sigma: f64::INFINITY,
            in_range: 0,
            early: 0,
            late: 0,
            samples: 0,
        }
    }
}

impl Scanner {
    pub(crate) fn lift_speed(&self, p: &CommandParams) -> Result<f64> {
        p.float("LIFT_SPEED", self.probe.lift_speed, Bounds::none().above(0.0))
    }

    fn sample_retract_dist(&self, p: &CommandParams) -> Result<f64> {
        p.float(
            "SAMPLE_RETRACT_DIST",
            self.probe.samples_retract_dist,
            Bounds::none().above(0.0),
        )
    }

    /// One probe at the current XY with the stream engaged for its duration.
    pub fn run_probe(&mut self, p: &CommandParams) -> Result<[f64; 3]> {
        if self.sensor.model().is_none() {
            return Err(fail(ScannerError::probe("No Scanner model loaded")));
        }
        let speed = p.float("PROBE_SPEED", self.probe.speed, Bounds::none().above(0.0))?;
        let skip = p.int("SKIP", 0, Bounds::none())? == 1;
        let allow_faulty = p.flag("ALLOW_FAULTY_COORDINATE", false)?;
        if !self.kinematics().is_homed('z') {
            return Err(fail(ScannerError::probe("Must home before probe")));
        }

        self.sensor.start_streaming()?;
        let probed = self.probe_at(speed, skip, allow_faulty, true);
        let stopped = self.sensor.stop_streaming();
        let pos = probed?;
        stopped?;
        Ok(pos)
    }

    /// Probe policy at the current XY; the stream must already be engaged.
    pub(crate) fn probe_at(
        &mut self,
        speed: f64,
        skip: bool,
        allow_faulty: bool,
        verbose: bool,
    ) -> Result<[f64; 3]> {
        if self.sensor.probe_mode == ProbeMode::Touch {
            return self.touch_probe_once(speed, skip, verbose);
        }
        let target = self.sensor.settings.trigger_distance;
        let dive = self.probe.trigger_dive_threshold;
        let settle = self.sensor.settings.z_settling_time;

        let (mut dist, mut samples) = self.sensor.sample(PROBE_SKIP, PROBE_SAMPLES)?;
        self.wait_moves()?;
        let at = samples
            .first()
            .and_then(|s| s.pos)
            .unwrap_or_else(|| self.position());
        if self.is_faulty(at[0], at[1], true) {
            let msg = "Probing within a faulty area";
            if !allow_faulty {
                return Err(fail(ScannerError::probe(msg)));
            }
            self.sensor.respond_error(msg);
        }

        if dist > target + dive {
            self.probing_move_to_probing_height(speed)?;
            (dist, samples) = self.sensor.sample(settle, PROBE_SAMPLES)?;
        } else if dist == f64::NEG_INFINITY {
            return Err(fail(ScannerError::probe(
                "Attempted to probe with Scanner below calibrated model range",
            )));
        } else if self.position()[2] < target - dive {
            self.move_to_probing_height(speed)?;
            (dist, samples) = self.sensor.sample(settle, PROBE_SAMPLES)?;
        }

        let pos = samples
            .first()
            .and_then(|s| s.pos)
            .unwrap_or_else(|| self.position());
        if verbose {
            let note = if skip { " - SKIPPED - result not added" } else { "" };
            self.respond(&format!(
                "probe at {:.3},{:.3},{:.3} is z={dist:.6}{note}",
                pos[0], pos[1], pos[2]
            ));
        }
        tracing::debug!(?pos, dist, "scan probe");
        Ok([pos[0], pos[1], pos[2] + target - dist])
    }

    /// Touch probe with the trigger armed for this one contact.
    fn touch_probe_once(&mut self, speed: f64, skip: bool, verbose: bool) -> Result<[f64; 3]> {
        self.sensor.trigger = self.sensor.trigger.enter_touch(self.sensor.detect_threshold);
        let touched = self.touch_probe(speed, skip, verbose);
        self.sensor.trigger = self.sensor.trigger.reset();
        touched
    }

    /// Approach the trigger height from above to take up backlash.
    pub(crate) fn move_to_probing_height(&mut self, speed: f64) -> Result<()> {
        let target = self.sensor.settings.trigger_distance;
        let top = target + self.probe.backlash_comp;
        if self.position()[2] < top {
            self.move_to([None, None, Some(top)], speed)?;
        }
        self.move_to([None, None, Some(target)], speed)?;
        self.wait_moves()
    }

    /// Probing move down to the trigger height, then let the reading settle.
    fn probing_move_to_probing_height(&mut self, speed: f64) -> Result<()> {
        let mut pos = self.position();
        pos[2] = self.kinematics().axis_minimum[2];
        let moved = self
            .probing_move(pos, speed)
            .and_then(|_| self.sensor.sample_printtime_sync(self.sensor.settings.z_settling_time, 0));
        match moved {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.downcast_ref::<ScannerError>(), Some(ScannerError::Timeout)) => {
                Err(fail(ScannerError::probe(format!(
                    "Timeout during probing move\nThis is generally indicative of an intermittent communication failure between the host and the sensor MCU ({e})"
                ))))
            }
            Err(e) => Err(e),
        }
    }

    /// `PROBE`.
    pub fn cmd_probe(&mut self, p: &CommandParams) -> Result<()> {
        let pos = self.run_probe(p)?;
        self.respond(&format!("Result is z={:.6}", pos[2]));
        self.last_z_result = pos[2];
        Ok(())
    }

    /// `PROBE_ACCURACY`.
    pub fn cmd_probe_accuracy(&mut self, p: &CommandParams) -> Result<()> {
        let speed = p.float("PROBE_SPEED", self.probe.probe_speed, Bounds::none().above(0.0))?;
        let lift_speed = self.lift_speed(p)?;
        let count = p.count("SAMPLES", 10, 1)?;
        let skip = p.count("SKIP", 0, 0)?;
        let retract = self.sample_retract_dist(p)?;
        let allow_faulty = p.flag("ALLOW_FAULTY_COORDINATE", false)?;
        let pos = self.position();
        self.respond(&format!(
            "PROBE_ACCURACY at X:{:.3} Y:{:.3} Z:{:.3} (samples={count} sample_retract_dist={retract:.3} speed={speed:.1} lift_speed={lift_speed:.1} skip={skip})\n",
            pos[0], pos[1], pos[2]
        ));

        let stats = self.probe_accuracy_check(speed, lift_speed, count, skip, retract, allow_faulty)?;
        self.respond(&format!(
            "probe accuracy results: maximum {:.6}, minimum {:.6}, range {:.6}, average {:.6}, median {:.6}, standard deviation {:.6}",
            stats.max, stats.min, stats.range, stats.avg, stats.median, stats.sigma
        ));
        Ok(())
    }

    fn probe_accuracy_check(
        &mut self,
        speed: f64,
        lift_speed: f64,
        count: usize,
        skip: usize,
        retract: f64,
        allow_faulty: bool,
    ) -> Result<AccuracyStats> {
        let lift = [None, None, Some(self.sensor.settings.trigger_distance + retract)];
        let mut zs: Vec<f64> = Vec::with_capacity(count);

        if self.sensor.probe_mode == ProbeMode::Scan {
            self.move_to(lift, lift_speed)?;
            self.sensor.start_streaming()?;
            let mut run = || -> Result<()> {
                while zs.len() < count {
                    let skipped = zs.len() < skip;
                    let pos = self.probe_at(speed, skipped, allow_faulty, true)?;
                    zs.push(pos[2]);
                    self.move_to(lift, lift_speed)?;
                }
                Ok(())
            };
            let ran = run();
            let stopped = self.sensor.stop_streaming();
            ran?;
            stopped?;
        } else {
            while zs.len() < count {
                let skipped = zs.len() < skip;
                let z = match self.touch_probe_once(speed, skipped, true) {
                    Ok(pos) => pos[2],
                    Err(e) if !self.kinematics().is_homed('z') => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "touch sample failed");
                        f64::INFINITY
                    }
                };
                self.move_to(lift, lift_speed)?;
                zs.push(z);
            }
        }
        let kept = zs.get(skip..).unwrap_or_default();
        Ok(AccuracyStats::from_zs(kept).unwrap_or(AccuracyStats::empty()))
    }

    /// `Z_OFFSET_APPLY_PROBE`: fold the gcode Z offset into the model or the
    /// touch offset.
    pub fn cmd_z_offset_apply_probe(&mut self, _p: &CommandParams) -> Result<()> {
        let offset = self.sensor.printer.homing_origin_z();
        if offset == 0.0 {
            self.respond("Nothing to do: Z Offset is 0");
            return Ok(());
        }
        let Some(model) = self.sensor.model() else {
            return Err(fail(ScannerError::calibration(
                "You must calibrate your model first.",
            )));
        };
        let save_config = format_macro("SAVE_CONFIG");

        if self.sensor.probe_mode == ProbeMode::Touch {
            let updated = self.touch.z_offset + offset;
            if updated < 0.0 {
                self.touch.z_offset = 0.0;
                self.sensor.store.set("scanner", "scanner_touch_z_offset", "0.000");
                self.respond(&format!(
                    "Touch offset attempted to update to {updated:.3}.\nHowever it cannot be less than 0. So its been set to 0.\nPlease check your printers calibration and try again."
                ));
                return Ok(());
            }
            self.touch.z_offset = updated;
            self.sensor
                .store
                .set("scanner", "scanner_touch_z_offset", &format!("{updated:.3}"));
            self.respond(&format!(
                "Touch offset has been updated by {offset:.3} to {updated:.3}.\nYou must run the {save_config} command now to update the\nprinter config file and restart the printer."
            ));
            return Ok(());
        }

        // The gcode offset stays in effect until restart, so only the
        // persisted copy moves.
        let mut adjusted = (*model).clone();
        adjusted.offset += offset;
        adjusted.save(self.sensor.store.as_mut(), self.sensor.probe_mode.as_str());
        self.respond(&format!(
            "Scanner model offset has been updated to {:.3}.\nYou must run the {save_config} command now to update the\nprinter config file and restart the printer.",
            adjusted.offset
        ));
        Ok(())
    }

    /// `<SENSOR>_ESTIMATE_BACKLASH`.
    pub fn cmd_estimate_backlash(&mut self, p: &CommandParams) -> Result<()> {
        let overrun = p.float("OVERRUN", 1.0, Bounds::none())?;
        let speed = p.float("PROBE_SPEED", self.probe.speed, Bounds::none().above(0.0))?;
        let cur_z = self.position()[2];
        self.move_to([None, None, Some(cur_z + overrun)], speed)?;
        self.run_probe(p)?;

        let lift_speed = self.lift_speed(p)?;
        let target = p.float("Z", self.sensor.settings.trigger_distance, Bounds::none())?;
        let total = p.count("SAMPLES", 20, 0)?;
        let settle = self.sensor.settings.z_settling_time;

        self.sensor.start_streaming()?;
        let mut up = Vec::new();
        let mut down = Vec::new();
        let mut run = || -> Result<()> {
            let (cur_dist, _) = self.sensor.sample(settle, PROBE_SAMPLES)?;
            let kin_target = self.position()[2] + target - cur_dist;
            self.respond(&format!("Target kinematic Z is {kin_target:.3}"));
            if kin_target - overrun < 0.0 {
                return Err(fail(ScannerError::probe(
                    "Target minus overrun must exceed 0mm",
                )));
            }
            let mut from_below = true;
            while up.len() + down.len() < total {
                let approach = if from_below { -overrun } else { overrun };
                self.move_to([None, None, Some(kin_target + approach)], lift_speed)?;
                self.move_to([None, None, Some(kin_target)], lift_speed)?;
                self.wait_moves()?;
                let (dist, _) = self.sensor.sample(settle, PROBE_SAMPLES)?;
                if from_below {
                    up.push(dist);
                } else {
                    down.push(dist);
                }
                from_below = !from_below;
            }
            Ok(())
        };
        let ran = run();
        let stopped = self.sensor.stop_streaming();
        ran?;
        stopped?;

        let (res_up, res_down) = (median(&up), median(&down));
        self.respond(&format!(
            "Median distance moving up {res_up:.5}, down {res_down:.5}, delta {:.5} over {total} samples",
            res_down - res_up
        ));
        Ok(())
    }
}
