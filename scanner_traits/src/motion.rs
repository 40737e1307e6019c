//! Motion planner, kinematics and homing collaborators.

use crate::HostResult;

/// Snapshot of the kinematic state.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicsStatus {
    /// Homed axes as letters, e.g. `"xyz"`.
    pub homed_axes: String,
    pub axis_minimum: [f64; 3],
    pub axis_maximum: [f64; 3],
}

impl KinematicsStatus {
    pub fn is_homed(&self, axis: char) -> bool {
        self.homed_axes.contains(axis)
    }
}

/// Hotend heater status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterStatus {
    pub temperature: f64,
    pub target: f64,
}

/// The planner's toolhead.
pub trait Toolhead {
    fn get_position(&self) -> [f64; 3];
    /// Move with optional per-axis targets; `None` keeps the current coordinate.
    fn manual_move(&mut self, coord: [Option<f64>; 3], speed: f64) -> HostResult<()>;
    /// Redefine the current position, marking `homing_axes` (0=x, 1=y, 2=z) as homed.
    fn set_position(&mut self, pos: [f64; 3], homing_axes: &[usize]) -> HostResult<()>;
    fn wait_moves(&mut self) -> HostResult<()>;
    fn dwell(&mut self, delay: f64) -> HostResult<()>;
    /// Print time at which all queued moves complete.
    fn get_last_move_time(&mut self) -> f64;
    fn flush_step_generation(&mut self) -> HostResult<()>;
    fn kinematics_status(&self) -> KinematicsStatus;
    fn note_z_not_homed(&mut self);
    /// Position derived from the steppers' commanded positions.
    fn commanded_position(&self) -> [f64; 3];
    fn max_accel(&self) -> f64;
    fn set_max_accel(&mut self, accel: f64) -> HostResult<()>;
    fn extruder_status(&self) -> Option<HeaterStatus> {
        None
    }
    fn set_extruder_target(&mut self, _target: f64) -> HostResult<()> {
        Ok(())
    }
    /// Block until the hotend temperature is within the given bounds.
    fn wait_extruder(&mut self, _minimum: Option<f64>, _maximum: Option<f64>) -> HostResult<()> {
        Ok(())
    }
}

/// One segment pulled from the trapezoidal motion queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapMove {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub accel: f64,
    pub start_pos: [f64; 3],
    pub axes_r: [f64; 3],
}

impl TrapMove {
    /// Position and velocity along this move at `print_time`, clamped to the segment.
    pub fn position_at(&self, print_time: f64) -> ([f64; 3], f64) {
        let move_time = (print_time - self.print_time).clamp(0.0, self.move_t.max(0.0));
        let dist = (self.start_v + 0.5 * self.accel * move_time) * move_time;
        let pos = [
            self.start_pos[0] + self.axes_r[0] * dist,
            self.start_pos[1] + self.axes_r[1] * dist,
            self.start_pos[2] + self.axes_r[2] * dist,
        ];
        (pos, self.start_v + self.accel * move_time)
    }
}

/// Read access to the planner's trajectory history.
pub trait TrajectoryQueue {
    /// The move active at (or most recently before) `print_time`.
    fn extract(&self, print_time: f64) -> Option<TrapMove>;
}

/// State shared with endstops during a rails homing operation.
#[derive(Debug, Clone, PartialEq)]
pub struct HomingState {
    pub axes: Vec<usize>,
    /// Per-axis overrides applied as the final homed position.
    pub homed_position: [Option<f64>; 3],
    /// Planner time after the homing moves finished.
    pub move_time: f64,
}

impl HomingState {
    pub fn new(axes: Vec<usize>, move_time: f64) -> Self {
        Self {
            axes,
            homed_position: [None; 3],
            move_time,
        }
    }

    pub fn set_homed_position(&mut self, pos: [Option<f64>; 3]) {
        for (slot, v) in self.homed_position.iter_mut().zip(pos) {
            if v.is_some() {
                *slot = v;
            }
        }
    }
}

/// An endstop usable by the homing module.
pub trait HomingEndstop {
    fn homing_move_begin(&mut self) -> HostResult<()>;
    fn home_start(&mut self, print_time: f64) -> HostResult<()>;
    /// Returns the trigger time, or 0.0 when the endstop never triggered.
    fn home_wait(&mut self, home_end_time: f64) -> HostResult<f64>;
    fn query_endstop(&mut self, print_time: f64) -> HostResult<bool>;
    fn position_endstop(&self) -> f64;
    fn home_rails_begin(&mut self);
    fn home_rails_end(&mut self, state: &mut HomingState) -> HostResult<()>;
}

/// The host homing module.
pub trait Homing {
    /// Move towards `pos` until `endstop` triggers; returns the trigger position.
    fn probing_move(
        &mut self,
        endstop: &mut dyn HomingEndstop,
        pos: [f64; 3],
        speed: f64,
    ) -> HostResult<[f64; 3]>;
    /// Home the given rails using `endstop`.
    fn home_rails(&mut self, endstop: &mut dyn HomingEndstop, axes: &[usize]) -> HostResult<()>;
    /// Interactive paper-test session; `None` when the operator aborts.
    fn manual_probe(&mut self) -> HostResult<Option<[f64; 3]>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_move_clamps_to_segment() {
        let mv = TrapMove {
            print_time: 1.0,
            move_t: 2.0,
            start_v: 0.0,
            accel: 2.0,
            start_pos: [0.0, 0.0, 5.0],
            axes_r: [0.0, 0.0, -1.0],
        };
        let (pos, vel) = mv.position_at(0.5);
        assert_eq!(pos, [0.0, 0.0, 5.0]);
        assert_eq!(vel, 0.0);
        let (pos, vel) = mv.position_at(2.0);
        assert!((pos[2] - 4.0).abs() < 1e-12);
        assert!((vel - 2.0).abs() < 1e-12);
        let (pos, _) = mv.position_at(10.0);
        assert!((pos[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn homed_position_merges_only_given_axes() {
        let mut st = HomingState::new(vec![2], 0.0);
        st.set_homed_position([None, None, Some(1.5)]);
        st.set_homed_position([Some(3.0), None, None]);
        assert_eq!(st.homed_position, [Some(3.0), None, Some(1.5)]);
    }
}
