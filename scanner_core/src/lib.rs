#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core eddy-current probe driver (host-agnostic).
//!
//! Every interaction with the printer host goes through the traits in
//! `scanner_traits`; the sensor MCU, the planner, homing and the console are
//! collaborators handed to [`ScannerBuilder`].
//!
//! ## Architecture
//!
//! - **Signal path**: raw counts are smoothed by an alpha-beta tracker
//!   (`filter`), converted to Hz, compensated for coil temperature
//!   (`temp_model`, `thermistor`) and mapped to millimetres by the
//!   calibrated inverse polynomial (`model`, `polynomial`)
//! - **Streaming**: `stream` buffers raw samples, `enrich` turns them into
//!   [`Sample`]s, `session` delivers them to subscribers with reference
//!   counted MCU stream enable
//! - **Endstop**: `endstop` drives the trsync arming sequence for both
//!   trigger modes (`mode`)
//! - **Prober**: scan probing, touch consensus, threshold auto-tuning,
//!   calibration sweeps and diagnostics (`probe`, `touch`,
//!   `threshold_scan`, `calibrate`, `diagnostics`)
//! - **Mesh**: serpentine fly path, cluster binning, faulty-region
//!   reconstruction on a worker thread (`mesh`)
//! - **Commands**: static command table and typed parameters (`commands`)
//!
//! All sample processing runs on the caller's thread; only the MCU transport
//! (`transport`) and mesh interpolation use worker threads.

pub mod calibrate;
pub mod commands;
pub mod config;
pub mod conversions;
pub mod diagnostics;
pub mod endstop;
pub mod enrich;
pub mod error;
pub mod filter;
pub mod hw_error;
pub mod mesh;
pub mod mocks;
pub mod mode;
pub mod model;
pub mod polynomial;
pub mod probe;
pub mod sample;
pub mod scanner;
pub mod sensor;
pub mod session;
pub mod status;
pub mod stream;
pub mod temp_model;
pub mod tempfit;
pub mod thermistor;
pub mod threshold_scan;
pub mod touch;
pub mod transport;
pub mod util;

pub use commands::{Command, CommandParams, CommandTable};
pub use error::{BuildError, Report, Result, ScannerError};
pub use filter::AlphaBetaFilter;
pub use mode::TriggerMode;
pub use model::{ModelRegistry, ScannerModel};
pub use sample::Sample;
pub use scanner::{Scanner, ScannerBuilder};
pub use session::Flow;
pub use temp_model::{TempModel, TempModelBuilder};
