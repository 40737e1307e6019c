//! Virtual Z endstop backed by the sensor.
//!
//! The homing module drives the endstop through [`ScannerEndstop`], a short
//! lived borrow of the [`Sensor`]. Progress through one homing move is
//! tracked by [`EndstopPhase`].

use scanner_traits::mcu::reason;
use scanner_traits::{HomingEndstop, HomingState, HostResult, McuCommand};

use crate::error::{Result, ScannerError, fail};
use crate::hw_error::{host, to_host};
use crate::mode::TriggerMode;
use crate::sensor::Sensor;

/// Trigger sync expiry with more than one MCU involved.
pub const TRSYNC_TIMEOUT: f64 = 0.025;
pub const TRSYNC_SINGLE_MCU_TIMEOUT: f64 = 0.250;

/// Where the endstop is within a homing move.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EndstopPhase {
    #[default]
    Idle,
    Armed {
        print_time: f64,
    },
    Triggered {
        at: f64,
    },
    /// The move ended without the trigger line asserting.
    NoTrigger,
    CommsError,
}

impl EndstopPhase {
    /// Arm for a move starting at `print_time`.
    #[must_use]
    pub fn arm(self, print_time: f64) -> Self {
        if let Self::Armed { .. } = self {
            tracing::warn!("endstop re-armed before the previous move completed");
        }
        Self::Armed { print_time }
    }

    /// Resolve the trigger sync stop reasons of every MCU.
    ///
    /// A comms timeout on any MCU wins; otherwise the first MCU decides.
    #[must_use]
    pub fn complete(self, reasons: &[u8], home_end_time: f64) -> Self {
        if reasons.contains(&reason::COMMS_TIMEOUT) {
            Self::CommsError
        } else if reasons.first() == Some(&reason::ENDSTOP_HIT) {
            Self::Triggered { at: home_end_time }
        } else {
            Self::NoTrigger
        }
    }

    /// Trigger time as the homing module expects it, 0.0 when not triggered.
    pub fn trigger_time(self) -> f64 {
        match self {
            Self::Triggered { at } => at,
            _ => 0.0,
        }
    }

    pub const fn is_armed(self) -> bool {
        matches!(self, Self::Armed { .. })
    }
}

impl Sensor {
    fn home_command(&self, threshold: u32, mode: TriggerMode) -> McuCommand {
        McuCommand::Home {
            trsync_oid: self.trsync.oid(),
            trigger_reason: reason::ENDSTOP_HIT,
            trigger_invert: 0,
            threshold,
            trigger_method: mode.method(),
        }
    }

    /// Touch arms the firmware before the move is queued.
    pub fn homing_move_begin(&mut self) -> Result<()> {
        if let Some(threshold) = self.trigger.touch_threshold() {
            let cmd = self.home_command(threshold, self.trigger);
            host(self.mcu.send(cmd))?;
        }
        Ok(())
    }

    pub fn home_start(&mut self, print_time: f64) -> Result<()> {
        let model = self.models.active();
        if let Some(model) = &model {
            model.validate(&self.mcu.firmware_version(), self.probe_mode.as_str())?;
        }
        if model.is_none() && !self.trigger.is_touch() {
            return Err(fail(ScannerError::probe("No Scanner model loaded")));
        }

        self.is_homing = true;
        if !self.trigger.is_touch() {
            self.apply_threshold()?;
            self.sample_async()?;
        }
        let expire = if self.trsync.mcu_count() > 1 {
            TRSYNC_TIMEOUT
        } else {
            TRSYNC_SINGLE_MCU_TIMEOUT
        };
        host(self.trsync.start(print_time, expire))?;
        self.trsync.dispatch_start(reason::HOST_REQUEST);
        self.phase = self.phase.arm(print_time);
        tracing::debug!(print_time, mode = %self.trigger, "endstop armed");

        if self.trigger.is_touch() {
            return Ok(());
        }
        let cmd = self.home_command(self.detect_threshold, self.trigger);
        host(self.mcu.send(cmd))
    }

    /// Wait for the trigger; returns the trigger time or 0.0.
    pub fn home_wait(&mut self, home_end_time: f64) -> Result<f64> {
        self.trsync.set_home_end_time(home_end_time);
        if self.mcu.is_fileoutput() {
            self.trsync.complete();
        }
        let waited = host(self.trsync.wait());
        let stopped = host(self.mcu.send(McuCommand::StopHome));
        self.trsync.dispatch_stop();
        let reasons = self.trsync.stop();
        waited?;
        stopped?;

        self.phase = self.phase.complete(&reasons, home_end_time);
        tracing::debug!(?reasons, phase = ?self.phase, "endstop move finished");
        if self.phase == EndstopPhase::CommsError {
            return Err(fail(ScannerError::host(
                "Communication timeout during homing",
            )));
        }
        Ok(self.phase.trigger_time())
    }

    pub fn query_endstop(&mut self) -> Result<bool> {
        if self.models.active().is_none() {
            return Ok(true);
        }
        let sample = self.sample_async()?;
        Ok(self.trigger_freq.is_some_and(|t| t <= sample.freq))
    }

    pub fn position_endstop(&self) -> f64 {
        self.settings.trigger_distance
    }

    pub fn home_rails_begin(&mut self) {
        self.is_homing = false;
    }

    /// Replace the homed Z with a fresh reading after a scan home.
    pub fn home_rails_end(&mut self, state: &mut HomingState) -> Result<()> {
        let homing = std::mem::take(&mut self.is_homing);
        self.phase = EndstopPhase::Idle;
        if self.models.active().is_none() && !self.trigger.is_touch() {
            return Ok(());
        }
        if !homing || !state.axes.contains(&2) {
            return Ok(());
        }
        if self.trigger.is_touch() {
            state.set_homed_position([None, None, Some(0.0)]);
            return Ok(());
        }
        let (dist, samples) = self.sample(self.settings.z_settling_time, 10)?;
        if dist.is_infinite() {
            tracing::error!(?samples, "post-homing adjustment below model range");
            return Err(fail(ScannerError::probe(
                "Toolhead stopped below model range",
            )));
        }
        state.set_homed_position([None, None, Some(dist)]);
        Ok(())
    }
}

/// [`HomingEndstop`] view of a sensor for the duration of one homing call.
pub struct ScannerEndstop<'a> {
    sensor: &'a mut Sensor,
}

impl<'a> ScannerEndstop<'a> {
    pub fn new(sensor: &'a mut Sensor) -> Self {
        Self { sensor }
    }
}

impl HomingEndstop for ScannerEndstop<'_> {
    fn homing_move_begin(&mut self) -> HostResult<()> {
        self.sensor.homing_move_begin().map_err(to_host)
    }

    fn home_start(&mut self, print_time: f64) -> HostResult<()> {
        self.sensor.home_start(print_time).map_err(to_host)
    }

    fn home_wait(&mut self, home_end_time: f64) -> HostResult<f64> {
        self.sensor.home_wait(home_end_time).map_err(to_host)
    }

    fn query_endstop(&mut self, _print_time: f64) -> HostResult<bool> {
        self.sensor.query_endstop().map_err(to_host)
    }

    fn position_endstop(&self) -> f64 {
        self.sensor.position_endstop()
    }

    fn home_rails_begin(&mut self) {
        self.sensor.home_rails_begin();
    }

    fn home_rails_end(&mut self, state: &mut HomingState) -> HostResult<()> {
        self.sensor.home_rails_end(state).map_err(to_host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[reason::ENDSTOP_HIT], EndstopPhase::Triggered { at: 12.5 })]
    #[case(&[reason::PAST_END_TIME], EndstopPhase::NoTrigger)]
    #[case(&[reason::PAST_END_TIME, reason::ENDSTOP_HIT], EndstopPhase::NoTrigger)]
    #[case(&[reason::ENDSTOP_HIT, reason::COMMS_TIMEOUT], EndstopPhase::CommsError)]
    fn stop_reasons(#[case] reasons: &[u8], #[case] expected: EndstopPhase) {
        let phase = EndstopPhase::Idle.arm(10.0).complete(reasons, 12.5);
        assert_eq!(phase, expected);
    }

    #[test]
    fn only_triggered_reports_a_time() {
        assert_eq!(EndstopPhase::Triggered { at: 3.0 }.trigger_time(), 3.0);
        assert_eq!(EndstopPhase::NoTrigger.trigger_time(), 0.0);
        assert!(EndstopPhase::Idle.arm(1.0).is_armed());
    }
}
