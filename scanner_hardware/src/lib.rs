//! Sensor-side plumbing: wire rendering, base block decoding and a
//! deterministic simulator implementing every host collaborator trait.
pub mod error;
pub mod replay;
pub mod sim;
pub mod wire;

pub use error::HwError;
pub use replay::ReplaySource;
pub use sim::{SimConfig, SimulatedPrinter};
pub use scanner_traits::BaseCalibration;
pub use wire::{decode_base, encode_base, render};
