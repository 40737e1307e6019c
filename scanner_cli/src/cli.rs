//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "scanner", version, about = "Eddy-current scanner probe driver")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/scanner.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); defaults to
    /// `[logging] level`, then warn
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Calibration mode recorded in a fitted model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum FitMode {
    Scan,
    Touch,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the config file and print a summary
    Check,
    /// Run scanner commands against the simulated printer
    Run {
        /// File with one command per line ('#' and ';' start comments)
        #[arg(long, value_name = "FILE")]
        script: Option<PathBuf>,
        /// Command line to run, e.g. "CARTOGRAPHER_QUERY" (repeatable)
        #[arg(short = 'c', long = "command", value_name = "LINE")]
        commands: Vec<String>,
        /// Seed for the simulator noise and fuzzy touch offsets
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Leave X and Y unhomed at start
        #[arg(long, action = ArgAction::SetTrue)]
        no_home: bool,
        /// Directory for STREAM captures
        #[arg(long, value_name = "DIR")]
        stream_dir: Option<PathBuf>,
        /// Keep going after a failed command
        #[arg(long, action = ArgAction::SetTrue)]
        keep_going: bool,
    },
    /// Fit a scan model from a calibration dump (freq,z,temp)
    Fit {
        /// Calibration CSV written by the calibration sweep
        #[arg(long, value_name = "FILE")]
        dump: PathBuf,
        /// Model name for the emitted [models.NAME] section
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long, value_enum, default_value = "scan")]
        mode: FitMode,
        /// Sensor firmware version recorded in the model
        #[arg(long, default_value = "UNKNOWN")]
        fw_version: String,
    },
    /// Fit tc_* temperature coefficients from STREAM captures
    Tempfit {
        /// At least three captures, each recorded at its own height
        #[arg(value_name = "CSV", required = true)]
        logs: Vec<PathBuf>,
    },
    /// Quick health check (config loads, simulated sensor streams)
    SelfCheck,
}
