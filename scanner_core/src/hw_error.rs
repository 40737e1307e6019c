//! Maps `Box<dyn Error>` from trait boundaries to typed `ScannerError`.
//!
//! The traits in `scanner_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to the typed enum, with an optional feature-gated
//! path for `scanner_hardware::HwError` downcasting.

use scanner_traits::{HostError, HostResult};

use crate::error::{Report, Result, ScannerError};

/// Map a trait-boundary error to a typed `ScannerError`.
///
/// Errors raised by this crate and tunnelled through a host callback are
/// recovered as-is; known hardware errors are mapped next, then string
/// heuristics.
pub fn map_host_error(e: &(dyn std::error::Error + 'static)) -> ScannerError {
    if let Some(own) = e.downcast_ref::<ScannerError>() {
        return own.clone();
    }

    #[cfg(feature = "hardware-errors")]
    {
        use scanner_hardware::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => ScannerError::Timeout,
                HwError::NoTrigger => ScannerError::Probe(hw.to_string()),
                HwError::Shutdown(_) => ScannerError::Shutdown(hw.to_string()),
                HwError::OutOfRange(msg) => ScannerError::Host(msg.clone()),
                other => ScannerError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        ScannerError::Timeout
    } else {
        ScannerError::Host(s)
    }
}

/// Lift a host result into the crate's `Result`.
pub(crate) fn host<T>(r: HostResult<T>) -> Result<T> {
    r.map_err(|e| Report::new(map_host_error(e.as_ref())))
}

/// Hand a report back across a host trait boundary, keeping the typed error
/// recoverable by `map_host_error` on the other side.
pub(crate) fn to_host(report: Report) -> HostError {
    match report.downcast::<ScannerError>() {
        Ok(typed) => Box::new(typed),
        Err(other) => other.into(),
    }
}
