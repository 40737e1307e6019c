use thiserror::Error;

/// Typed failures surfaced by the driver.
///
/// Display strings are what the console shows, so most variants carry the
/// complete message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScannerError {
    /// Invalid or contradictory configuration; fix the config and restart.
    #[error("{0}")]
    Config(String),
    /// The loaded model cannot be used; recalibration required.
    #[error("{0}")]
    Calibration(String),
    /// Probing or touch failed for this command.
    #[error("{0}")]
    Probe(String),
    /// Coil or stream fault reported by the sensor.
    #[error("{0}")]
    HardwareFault(String),
    /// The printer shut down while the command was running.
    #[error("{0}")]
    Shutdown(String),
    /// A host collaborator rejected a request.
    #[error("{0}")]
    Host(String),
    #[error("{0}")]
    Mesh(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("timeout waiting for sensor")]
    Timeout,
}

impl ScannerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn calibration(msg: impl Into<String>) -> Self {
        Self::Calibration(msg.into())
    }

    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    pub fn mesh(msg: impl Into<String>) -> Self {
        Self::Mesh(msg.into())
    }
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing sensor mcu")]
    MissingMcu,
    #[error("missing sample feed")]
    MissingFeed,
    #[error("missing trajectory queue")]
    MissingTrapq,
    #[error("missing toolhead")]
    MissingToolhead,
    #[error("missing homing module")]
    MissingHoming,
    #[error("missing trigger sync")]
    MissingTriggerSync,
    #[error("missing printer")]
    MissingPrinter,
    #[error("missing config store")]
    MissingConfigStore,
    #[error("missing config")]
    MissingConfig,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

/// Build a `Report` carrying a typed error.
pub(crate) fn fail(err: ScannerError) -> Report {
    Report::new(err)
}
