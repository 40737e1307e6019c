//! Host collaborator traits for the scanner probe driver.
//!
//! Every boundary the driver crosses (MCU link, planner, homing, console,
//! config persistence) is a trait here so the core stays host-agnostic.
pub mod clock;
pub mod host;
pub mod mcu;
pub mod motion;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use host::{AxisTwist, BedLeveling, BedMesh, ConfigStore, Printer, TemperatureSource, ZMesh};
pub use mcu::{BaseCalibration, BaseRead, Mcu, McuCommand, RawSample, SampleFeed, SampleSource, TriggerSync};
pub use motion::{
    HeaterStatus, Homing, HomingEndstop, HomingState, KinematicsStatus, Toolhead, TrajectoryQueue,
    TrapMove,
};

/// Error type at every trait boundary.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;
pub type HostResult<T> = Result<T, HostError>;
