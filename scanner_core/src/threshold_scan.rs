//! Touch threshold auto-tuning.
//!
//! Candidate thresholds are swept upward from a minimum. Each candidate runs
//! one touch consensus; a candidate that settles quickly with a low spread
//! is re-verified before being accepted.

use crate::commands::{Bounds, CommandParams};
use crate::config::ProbeMode;
use crate::error::{Result, ScannerError, fail};
use crate::hw_error::host;
use crate::scanner::Scanner;
use crate::touch::{TouchPlan, TouchSeries};
use crate::util::format_macro;

pub const THRESHOLD_MIN_LIMIT: i64 = 750;
pub const THRESHOLD_SCALING_FACTOR: f64 = 0.25;
pub const THRESHOLD_ROUNDING_BASE: i64 = 250;
/// Steps added past the first good candidate.
pub const THRESHOLD_INCREMENT_MULTIPLIER: i64 = 5;
/// Default sweep width in steps.
pub const THRESHOLD_STEP_MULTIPLIER: i64 = 10;
/// Share of the qualify budget a good candidate may spend on retries.
pub const THRESHOLD_ACCEPTANCE_FACTOR: f64 = 0.66;

const DEFAULT_STEP: i64 = 250;
const DEFAULT_TARGET: f64 = 0.015;

/// Sweep start when no MIN is given.
pub fn default_min(detect_threshold: u32) -> i64 {
    let scaled = f64::from(detect_threshold) * THRESHOLD_SCALING_FACTOR
        / THRESHOLD_ROUNDING_BASE as f64;
    THRESHOLD_MIN_LIMIT.max(scaled.round_ties_even() as i64 * THRESHOLD_ROUNDING_BASE)
}

/// Retry count a good candidate may not exceed.
pub fn max_acceptable_retries(qualify_samples: usize) -> usize {
    (qualify_samples as f64 * THRESHOLD_ACCEPTANCE_FACTOR).round_ties_even() as usize
}

/// Upper bound of the sweep. Extends once past the first good candidate
/// unless the user fixed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepLimit {
    pub max: i64,
    extended: bool,
}

impl SweepLimit {
    pub fn new(min: i64, step: i64, user_max: Option<i64>) -> Self {
        match user_max {
            Some(max) => Self {
                max,
                extended: true,
            },
            None => Self {
                max: min + THRESHOLD_STEP_MULTIPLIER * step,
                extended: false,
            },
        }
    }

    pub fn on_good(&mut self, threshold: i64, step: i64) {
        if !self.extended {
            self.max = threshold + THRESHOLD_INCREMENT_MULTIPLIER * step;
            self.extended = true;
        }
    }
}

/// One tested threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub threshold: i64,
    pub retries: usize,
    pub std_dev: Option<f64>,
    pub success: bool,
    /// Passed every verification run.
    pub consistent: bool,
}

impl Candidate {
    fn rank(&self) -> (usize, f64) {
        (self.retries, self.std_dev.unwrap_or(f64::INFINITY))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    NotFound,
    Optimal(Candidate),
    BestEffort(Candidate),
}

/// Fewest retries, then lowest spread; verified candidates first.
pub fn pick_best(results: &[Candidate]) -> Verdict {
    if results.iter().all(|r| !r.success) {
        return Verdict::NotFound;
    }
    if let Some(c) = lowest(results.iter().filter(|r| r.consistent)) {
        return Verdict::Optimal(c);
    }
    lowest(results.iter()).map_or(Verdict::NotFound, Verdict::BestEffort)
}

fn lowest<'a>(it: impl Iterator<Item = &'a Candidate>) -> Option<Candidate> {
    it.min_by(|a, b| {
        let (ra, sa) = a.rank();
        let (rb, sb) = b.rank();
        ra.cmp(&rb).then(sa.total_cmp(&sb))
    })
    .cloned()
}

/// Result of one consensus run at a fixed threshold.
#[derive(Debug, Clone, Copy)]
struct Trial {
    retries: usize,
    std_dev: Option<f64>,
    success: bool,
}

struct SweepSpec {
    step: i64,
    min: i64,
    user_max: Option<i64>,
    override_save: bool,
    verify: usize,
    max_retries_ok: usize,
    target: f64,
}

impl Scanner {
    fn threshold_trial(&mut self, plan: &TouchPlan, series: TouchSeries, threshold: i64) -> Result<Trial> {
        let threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
        let out = self
            .touch_consensus(plan, series, threshold, plan.samples)
            .and_then(|out| {
                self.wait_moves()?;
                host(self.sensor.toolhead.flush_step_generation())?;
                Ok(out)
            });
        match out {
            Ok(out) => Ok(Trial {
                retries: out.retries,
                std_dev: if out.complete { out.std_dev() } else { None },
                success: out.complete,
            }),
            Err(e) => {
                self.sensor.trigger = self.sensor.trigger.reset();
                self.sensor.toolhead.note_z_not_homed();
                Err(e)
            }
        }
    }

    fn sweep_thresholds(
        &mut self,
        plan: &TouchPlan,
        series: TouchSeries,
        spec: &SweepSpec,
    ) -> Result<Vec<Candidate>> {
        let mut results: Vec<Candidate> = Vec::new();
        let mut limit = SweepLimit::new(spec.min, spec.step, spec.user_max);
        let mut threshold = spec.min;
        while threshold <= limit.max {
            self.respond(&format!("Testing Threshold value {threshold}..."));
            self.sensor.detect_threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
            let trial = self.threshold_trial(plan, series, threshold)?;
            let mut candidate = Candidate {
                threshold,
                retries: trial.retries,
                std_dev: trial.std_dev,
                success: trial.success,
                consistent: false,
            };
            let good = trial.success
                && trial.retries <= spec.max_retries_ok
                && trial.std_dev.is_some_and(|s| s <= spec.target);
            if good {
                limit.on_good(threshold, spec.step);
                self.respond(&format!("Good Threshold Found: {threshold}."));
                let mut consistent = true;
                let mut last = trial;
                for attempt in 1..=spec.verify {
                    last = self.threshold_trial(plan, series, threshold)?;
                    match last.std_dev.filter(|s| last.success && *s <= spec.target) {
                        Some(std) => self.respond(&format!(
                            "Qualify attempt {attempt} successful with std dev: {std:.5}"
                        )),
                        None => {
                            self.respond(&format!(
                                "Qualify attempt {attempt} failed for threshold {threshold}"
                            ));
                            consistent = false;
                            break;
                        }
                    }
                }
                candidate.consistent = consistent;
                candidate.std_dev = if consistent { last.std_dev } else { None };
                candidate.success = consistent && last.success;
                let accepted = consistent && !spec.override_save;
                results.push(candidate);
                if accepted {
                    self.save_threshold(threshold, plan.speed);
                    break;
                }
            } else {
                results.push(candidate);
            }
            threshold += spec.step;
        }
        Ok(results)
    }

    /// Persist the touch threshold with the speed it was found at.
    pub(crate) fn save_threshold(&mut self, threshold: i64, speed: f64) {
        let store = self.sensor.store.as_mut();
        store.set("scanner", "scanner_touch_threshold", &threshold.to_string());
        store.set("scanner", "scanner_touch_speed", &(speed.trunc() as i64).to_string());
    }

    /// `<SENSOR>_THRESHOLD_SCAN`.
    pub fn cmd_threshold_scan(&mut self, p: &CommandParams) -> Result<()> {
        if self.sensor.probe_mode != ProbeMode::Touch {
            self.sensor.trigger = self.sensor.trigger.reset();
            return Ok(());
        }
        let plan = TouchPlan::from_params(&self.touch, p)?;
        let step = p.int("STEP", DEFAULT_STEP, Bounds::none().min(1))?;
        let min = p
            .opt_int("MIN", Bounds::none().min(0))?
            .unwrap_or_else(|| default_min(self.sensor.detect_threshold));
        let qualify = p.count("QUALIFY_SAMPLES", 5, 0)?;
        let verify_key = if p.contains("VERIFICATION_SAMPLES") {
            "VERIFICATION_SAMPLES"
        } else {
            "VERIFY_SAMPLES"
        };
        let spec = SweepSpec {
            step,
            min,
            user_max: p.opt_int("MAX", Bounds::none())?,
            override_save: p.flag("OVERRIDE", false)?,
            verify: p.count(verify_key, 3, 0)?,
            max_retries_ok: max_acceptable_retries(qualify),
            target: p.float("TARGET", DEFAULT_TARGET, Bounds::none().above(0.0))?,
        };

        self.check_temp()?;
        self.wait_moves()?;
        let kin = self.kinematics();
        if !['x', 'y', 'z'].iter().all(|a| kin.is_homed(*a)) {
            self.sensor.trigger = self.sensor.trigger.reset();
            return Err(fail(ScannerError::probe("Must home all axes first")));
        }
        self.sensor.validate_model_loaded()?;
        if let Some(lev) = self.sensor.printer.bed_leveling().filter(|l| !l.applied) {
            self.sensor.trigger = self.sensor.trigger.reset();
            return Err(fail(ScannerError::probe(format!(
                "Bed leveling required before threshold scan. Please run {}",
                format_macro(&lev.command)
            ))));
        }

        self.zhop()?;
        self.move_to(
            [Some(plan.location[0]), Some(plan.location[1]), None],
            plan.move_speed,
        )?;
        let mut initial = self.position();
        initial[2] = kin.axis_maximum[2];
        let series = TouchSeries {
            initial,
            homing_z: kin.axis_minimum[2],
            z_max: kin.axis_maximum[2],
            max_accel: self.sensor.toolhead.max_accel(),
        };
        let scan_plan = TouchPlan {
            max_retries: qualify,
            ..plan
        };

        let original = self.sensor.detect_threshold;
        let swept = self.sweep_thresholds(&scan_plan, series, &spec);
        let hopped = self.zhop();
        self.sensor.trigger = self.sensor.trigger.reset();
        let results = match swept {
            Ok(r) => r,
            Err(e) => {
                self.sensor.detect_threshold = original;
                return Err(e);
            }
        };
        hopped?;

        let (best, optimal) = match pick_best(&results) {
            Verdict::NotFound => {
                self.sensor.detect_threshold = original;
                self.respond("No suitable threshold was found during the scan.");
                return Ok(());
            }
            Verdict::Optimal(c) => (c, true),
            Verdict::BestEffort(c) => (c, false),
        };
        self.sensor.detect_threshold = u32::try_from(best.threshold).unwrap_or(u32::MAX);
        self.save_threshold(best.threshold, scan_plan.speed);
        let std = best
            .std_dev
            .map_or_else(|| "N/A".to_string(), |s| format!("{s:.5}"));
        if optimal {
            self.respond(&format!(
                "Optimal Threshold Determined: {} with standard deviation of {std}",
                best.threshold
            ));
        } else {
            self.respond(&format!(
                "No fully optimal threshold found. Best attempt: {} with standard deviation of {std}",
                best.threshold
            ));
        }
        self.respond(&format!(
            "You can now {} to save your threshold.",
            format_macro("SAVE_CONFIG")
        ));
        tracing::info!(threshold = best.threshold, optimal, "threshold scan finished");
        Ok(())
    }
}
