//! Tracing setup: console output plus an optional JSON-lines log file.

use std::path::Path;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::FILE_GUARD;

fn rotation(policy: Option<&str>) -> tracing_appender::rolling::Rotation {
    use tracing_appender::rolling::Rotation;
    match policy.map(str::to_ascii_lowercase).as_deref() {
        Some("daily") => Rotation::DAILY,
        Some("hourly") => Rotation::HOURLY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
///
/// Console logs go to stderr so stdout stays reserved for command output.
pub fn init_tracing(json: bool, level: &str, logging: Option<&scanner_config::Logging>) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_writer = logging.and_then(|l| l.file.as_deref()).map(|file| {
        let path = Path::new(file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path.file_name().map_or_else(|| "scanner.log".into(), |n| n.to_os_string());
        let appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation(logging.and_then(|l| l.rotation.as_deref())),
            dir,
            name,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        writer
    });

    // try_init: tests may call this more than once in-process.
    let result = match (json, file_writer) {
        (true, Some(file)) => fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr.and(file))
            .try_init(),
        (true, None) => fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init(),
        (false, Some(file)) => fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr.and(file))
            .with_ansi(false)
            .try_init(),
        (false, None) => fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_appender::rolling::Rotation;

    #[test]
    fn rotation_defaults_to_never() {
        assert_eq!(rotation(None), Rotation::NEVER);
        assert_eq!(rotation(Some("Daily")), Rotation::DAILY);
        assert_eq!(rotation(Some("hourly")), Rotation::HOURLY);
        assert_eq!(rotation(Some("weekly")), Rotation::NEVER);
    }
}
