//! Touch homing: repeated nozzle contacts reduced to one Z by consensus.
//!
//! [`Consensus`] is the pure retry policy; [`Scanner::start_touch`] feeds it
//! real probing moves through [`Toucher`]. The threshold scan reuses the
//! same loop with its own acceptance rule.

use rand::Rng;

use crate::commands::{Bounds, CommandParams};
use crate::config::{ProbeMode, TouchSettings};
use crate::error::{Result, ScannerError, fail};
use crate::hw_error::host;
use crate::scanner::Scanner;
use crate::util::{mean, median, round_to, std_dev};

/// Feed rate of the jitter move between retries, mm/s.
const FUZZY_MOVE_SPEED: f64 = 20.0;
/// Settle time after each retract, seconds.
const RETRACT_DWELL: f64 = 1.0;

/// Source of touch readings for [`Consensus::run`].
pub trait Toucher {
    /// Perform one touch and return the contact Z. `retry` is set for the
    /// first touch after a rejected set.
    fn touch(&mut self, retry: bool) -> Result<f64>;

    /// A set was thrown away; `attempt` counts from 1.
    fn rejected(&mut self, _attempt: usize, _max_retries: usize, _deviation: f64) {}
}

/// Retry policy of touch homing.
///
/// Samples are collected until `samples` agree: after every touch the
/// largest distance from the running median (rounded to 4 places) must stay
/// within `tolerance`, otherwise the set is discarded and a retry counted.
/// The loop gives up once `max_retries` sets were discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consensus {
    pub samples: usize,
    pub tolerance: f64,
    pub max_retries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    pub samples: Vec<f64>,
    pub retries: usize,
    /// All samples were collected before the retry budget ran out.
    pub complete: bool,
}

impl ConsensusOutcome {
    pub fn std_dev(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| std_dev(&self.samples))
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| mean(&self.samples))
    }
}

impl Consensus {
    pub fn run(&self, toucher: &mut impl Toucher) -> Result<ConsensusOutcome> {
        let mut samples = Vec::with_capacity(self.samples);
        let mut retries = 0;
        let mut retry = false;
        while samples.len() < self.samples {
            if retries >= self.max_retries {
                return Ok(ConsensusOutcome {
                    samples,
                    retries,
                    complete: false,
                });
            }
            samples.push(toucher.touch(retry)?);
            retry = false;
            let mid = median(&samples);
            let deviation = round_to(
                samples.iter().map(|s| (s - mid).abs()).fold(0.0, f64::max),
                4,
            );
            if deviation > self.tolerance {
                toucher.rejected(retries + 1, self.max_retries, deviation);
                retries += 1;
                retry = true;
                samples.clear();
            }
        }
        Ok(ConsensusOutcome {
            samples,
            retries,
            complete: true,
        })
    }
}

/// Touch parameters shared by TOUCH and THRESHOLD_SCAN, after overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchPlan {
    pub speed: f64,
    pub move_speed: f64,
    pub accel: f64,
    pub retract_dist: f64,
    pub retract_speed: f64,
    pub samples: usize,
    pub tolerance: f64,
    pub max_retries: usize,
    pub location: [f64; 2],
    pub fuzzy: f64,
    pub verbose: bool,
}

impl TouchPlan {
    pub fn from_params(touch: &TouchSettings, p: &CommandParams) -> Result<Self> {
        let retries = p.int(
            "RETRIES",
            i64::try_from(touch.max_retries).unwrap_or(i64::MAX),
            Bounds::none().min(0),
        )?;
        Ok(Self {
            speed: p.float(
                "SPEED",
                touch.speed,
                Bounds::none().above(0.0).max(touch.max_speed),
            )?,
            move_speed: p.float("MOVEMENT_SPEED", touch.move_speed, Bounds::none().above(0.0))?,
            accel: p.float("ACCEL", touch.accel, Bounds::none().min(1.0))?,
            retract_dist: p.float("RETRACT", touch.retract_dist, Bounds::none().min(1.0))?,
            retract_speed: p.float("RETRACT_SPEED", touch.retract_speed, Bounds::none().min(1.0))?,
            samples: p.count("SAMPLES", touch.sample_count, 1)?,
            tolerance: round_to(
                p.float("TOLERANCE", touch.tolerance, Bounds::none().above(0.0))?,
                4,
            ),
            max_retries: usize::try_from(retries).unwrap_or(0),
            location: [
                p.float("TOUCH_LOCATION_X", touch.location[0], Bounds::none())?,
                p.float("TOUCH_LOCATION_Y", touch.location[1], Bounds::none())?,
            ],
            fuzzy: p.float("FUZZY_TOUCH", touch.fuzzy_touch, Bounds::none().min(0.0).max(10.0))?,
            verbose: p.flag("DEBUG", false)?,
        })
    }

    pub const fn consensus(&self, samples: usize) -> Consensus {
        Consensus {
            samples,
            tolerance: self.tolerance,
            max_retries: self.max_retries,
        }
    }
}

/// Start and end of the touch descent in the forced Z frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TouchSeries {
    /// Position declared before the first touch; Z is the axis maximum.
    pub initial: [f64; 3],
    pub homing_z: f64,
    pub z_max: f64,
    pub max_accel: f64,
}

/// Result of [`Scanner::start_touch`].
#[derive(Debug, Clone, PartialEq)]
pub struct TouchOutcome {
    pub samples: Vec<f64>,
    pub std_dev: Option<f64>,
    pub retries: usize,
    pub success: bool,
    pub final_position: [f64; 3],
}

/// Probing moves driving a [`Consensus`].
struct TouchRun<'a> {
    scanner: &'a mut Scanner,
    plan: &'a TouchPlan,
    series: TouchSeries,
    xy: [f64; 2],
    count: usize,
}

impl Toucher for TouchRun<'_> {
    fn touch(&mut self, retry: bool) -> Result<f64> {
        let plan = self.plan;
        let sc = &mut *self.scanner;
        if retry && plan.fuzzy > 0.0 {
            let origin = self.series.initial;
            self.xy = [
                origin[0] + sc.rng.gen_range(-plan.fuzzy..=plan.fuzzy),
                origin[1] + sc.rng.gen_range(-plan.fuzzy..=plan.fuzzy),
            ];
            sc.move_to(
                [Some(self.xy[0]), Some(self.xy[1]), Some(origin[2])],
                FUZZY_MOVE_SPEED,
            )?;
            sc.respond(&format!(
                "Moving touch location to (x: {:.2}, y: {:.2})",
                self.xy[0], self.xy[1]
            ));
        }
        sc.wait_moves()?;
        host(sc.sensor.toolhead.set_max_accel(plan.accel))?;
        let probed = sc.probing_move([self.xy[0], self.xy[1], self.series.homing_z], plan.speed);
        let restored = host(sc.sensor.toolhead.set_max_accel(self.series.max_accel));
        let contact = match probed {
            Ok(pos) => pos,
            Err(e) if sc.sensor.printer.is_shutdown() => {
                tracing::error!(error = %e, "touch interrupted by shutdown");
                return Err(fail(ScannerError::Shutdown(
                    "Touch procedure interrupted due to printer shutdown".into(),
                )));
            }
            Err(e) => return Err(e),
        };
        restored?;

        let mut retract = sc.position();
        retract[2] = (retract[2] + plan.retract_dist).min(self.series.z_max);
        sc.move_to(retract.map(Some), plan.retract_speed)?;
        host(sc.sensor.toolhead.dwell(RETRACT_DWELL))?;

        self.count += 1;
        if plan.verbose {
            sc.respond(&format!("Touch {} result: {:.4}", self.count, contact[2]));
        }
        Ok(contact[2])
    }

    fn rejected(&mut self, attempt: usize, max_retries: usize, deviation: f64) {
        self.count = 0;
        if self.plan.verbose {
            self.scanner.respond(&format!(
                "Deviation of {deviation:.4} exceeds tolerance of {:.4}",
                self.plan.tolerance
            ));
        }
        self.scanner.respond(&format!(
            "Attempt {attempt}/{max_retries} failed with deviation {deviation:.4}."
        ));
    }
}

impl Scanner {
    /// Declare the forced start position and collect `samples` agreeing
    /// touches with the touch trigger armed at `threshold`.
    ///
    /// The trigger mode is left in touch; callers reset it.
    pub(crate) fn touch_consensus(
        &mut self,
        plan: &TouchPlan,
        series: TouchSeries,
        threshold: u32,
        samples: usize,
    ) -> Result<ConsensusOutcome> {
        self.sensor.trigger = self.sensor.trigger.enter_touch(threshold);
        self.set_position(series.initial, &[2])?;
        let consensus = plan.consensus(samples);
        let mut run = TouchRun {
            scanner: self,
            plan,
            series,
            xy: [series.initial[0], series.initial[1]],
            count: 0,
        };
        consensus.run(&mut run)
    }

    /// Touch home: consensus Z becomes the kinematic Z.
    pub(crate) fn start_touch(
        &mut self,
        plan: &TouchPlan,
        series: TouchSeries,
        threshold: u32,
        z_offset: f64,
    ) -> Result<TouchOutcome> {
        let outcome = match self.touch_consensus(plan, series, threshold, plan.samples) {
            Ok(o) => o,
            Err(e) => {
                self.sensor.trigger = self.sensor.trigger.reset();
                self.sensor.toolhead.note_z_not_homed();
                return Err(e);
            }
        };
        if !outcome.complete {
            self.sensor.trigger = self.sensor.trigger.reset();
            let hopped = self.zhop();
            self.sensor.toolhead.note_z_not_homed();
            hopped?;
            return Err(fail(ScannerError::probe(format!(
                "Exceeded maximum attempts [{}/{}]",
                outcome.retries, plan.max_retries
            ))));
        }

        let std = outcome.std_dev().unwrap_or(f64::NAN);
        let mut final_position = self.position();
        let success = std <= plan.tolerance;
        if success {
            self.respond(&format!(
                "Completed {} touches with a standard deviation of {std:.4}",
                outcome.samples.len()
            ));
            let position_difference = series.initial[2] - final_position[2];
            let adjusted_difference = series.initial[2] - outcome.mean().unwrap_or(f64::NAN);
            if plan.verbose {
                self.respond(&format!(
                    "Position Difference: {position_difference:.4}\nAdjusted Difference: {adjusted_difference:.4}"
                ));
            }
            final_position[2] = adjusted_difference - position_difference;
            if z_offset > 0.0 {
                self.respond(&format!("Offsetting by {z_offset:.3}"));
                final_position[2] -= z_offset;
            }
            let settled = self
                .set_position(final_position, &[])
                .and_then(|()| self.wait_moves())
                .and_then(|()| host(self.sensor.toolhead.flush_step_generation()));
            if let Err(e) = settled {
                self.sensor.trigger = self.sensor.trigger.reset();
                self.sensor.toolhead.note_z_not_homed();
                return Err(e);
            }
            self.sensor.trigger = self.sensor.trigger.reset();
        }
        tracing::info!(
            success,
            retries = outcome.retries,
            std,
            z = final_position[2],
            "touch finished"
        );
        Ok(TouchOutcome {
            std_dev: outcome.std_dev(),
            samples: outcome.samples,
            retries: outcome.retries,
            success,
            final_position,
        })
    }

    /// `<SENSOR>_TOUCH`.
    pub fn cmd_touch(&mut self, p: &CommandParams) -> Result<()> {
        let plan = TouchPlan::from_params(&self.touch, p)?;
        let threshold = p.int(
            "THRESHOLD",
            i64::from(self.sensor.detect_threshold),
            Bounds::none().min(100),
        )?;
        let threshold = u32::try_from(threshold).unwrap_or(u32::MAX);
        let calibrate = p.float(
            "CALIBRATE",
            if self.touch.calibrate { 1.0 } else { 0.0 },
            Bounds::none(),
        )? == 1.0;
        let mut z_offset = p.float("Z_OFFSET", self.touch.z_offset, Bounds::none().min(0.0))?;
        let manual = p.get("METHOD").is_some_and(|m| m.eq_ignore_ascii_case("manual"));
        if plan.verbose {
            self.respond(&format!(
                "SPEED: {}\nSAMPLES: {}\nTOLERANCE: {}\nRETRIES: {}\nTHRESHOLD: {threshold}\nZ_OFFSET: {z_offset}\nMOVE: {}",
                plan.speed, plan.samples, plan.tolerance, plan.max_retries, plan.fuzzy
            ));
        }

        if self.sensor.probe_mode != ProbeMode::Touch {
            self.sensor.trigger = self.sensor.trigger.reset();
            if calibrate || manual {
                return self.start_calibration(p);
            }
            return Ok(());
        }

        self.check_temp()?;
        self.wait_moves()?;
        let kin = self.kinematics();
        if !kin.is_homed('x') || !kin.is_homed('y') {
            self.sensor.trigger = self.sensor.trigger.reset();
            return Err(fail(ScannerError::probe("Must home X and Y axes first")));
        }
        self.zhop()?;
        self.move_to(
            [Some(plan.location[0]), Some(plan.location[1]), None],
            plan.move_speed,
        )?;

        if manual {
            return self.start_calibration(p);
        }

        self.respond("Starting nozzle touch..");
        let mut initial = self.position();
        initial[2] = kin.axis_maximum[2];
        let series = TouchSeries {
            initial,
            homing_z: kin.axis_minimum[2],
            z_max: kin.axis_maximum[2],
            max_accel: self.sensor.toolhead.max_accel(),
        };
        if calibrate {
            z_offset = 0.0;
        }

        let outcome = self.start_touch(&plan, series, threshold, z_offset)?;
        if outcome.success {
            if plan.verbose {
                self.respond(&format!(
                    "Touch procedure successful with {} attempts.",
                    outcome.retries + 1
                ));
            }
            if calibrate {
                let pos = outcome.final_position;
                self.calibrate_sweep(p, pos, Some(pos[2]), false)?;
            }
        } else {
            self.sensor.trigger = self.sensor.trigger.reset();
            self.respond("Touch procedure failed.");
        }
        self.zhop()?;
        self.restore_temp()?;
        Ok(())
    }

    /// Keep the nozzle below the touch temperature limit before contact.
    pub(crate) fn check_temp(&mut self) -> Result<()> {
        let Some(heater) = self.sensor.toolhead.extruder_status() else {
            return Ok(());
        };
        self.extruder_target = heater.target;
        let max = self.touch.max_temp;
        let ceiling = max + 5.0;
        if heater.target > max {
            self.respond(&format!(
                "Target hotend temperature {:.1} exceeds maximum allowed temperature {max:.1} lowering to {max:.1}",
                heater.target
            ));
            host(self.sensor.toolhead.set_extruder_target(max))?;
            host(self.sensor.toolhead.wait_extruder(None, Some(ceiling)))?;
        } else if heater.temperature > ceiling {
            self.respond(&format!(
                "Extruder temperature {:.1}C is still too high, waiting until below {ceiling:.1}C",
                heater.temperature
            ));
            host(self.sensor.toolhead.wait_extruder(None, Some(ceiling)))?;
        }
        Ok(())
    }

    /// Reheat to the target saved by [`Scanner::check_temp`].
    pub(crate) fn restore_temp(&mut self) -> Result<()> {
        let target = std::mem::take(&mut self.extruder_target);
        let Some(heater) = self.sensor.toolhead.extruder_status() else {
            return Ok(());
        };
        if target > heater.temperature {
            self.respond(&format!("Heating hotend to {target:.1}"));
            host(self.sensor.toolhead.set_extruder_target(target))?;
            host(self.sensor.toolhead.wait_extruder(Some(target), None))?;
        }
        Ok(())
    }

    /// Single touch for PROBE in touch mode.
    pub(crate) fn touch_probe(&mut self, speed: f64, skip: bool, verbose: bool) -> Result<[f64; 3]> {
        let kin = self.kinematics();
        if !kin.is_homed('z') {
            return Err(fail(ScannerError::probe("Must home before probe")));
        }
        let mut target = self.position();
        target[2] = kin.axis_minimum[2];
        let epos = self.probing_move(target, speed)?;
        if verbose {
            let note = if skip { " - SKIPPED - result not added" } else { "" };
            self.respond(&format!(
                "probe at {:.3},{:.3} is z={:.6}{note}",
                epos[0], epos[1], epos[2]
            ));
        }
        Ok(epos)
    }
}
