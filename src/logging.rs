//! Tracing subscriber setup.
//!
//! Logs go to stderr (pretty or JSON) and optionally to a file through a
//! non-blocking writer. The filter accepts anything `EnvFilter` does, so a
//! `RUST_LOG`-style directive such as `cograph::sync=debug,info` works as
//! well as a bare level.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::LogFormat;
use crate::{Error, Result};

/// Build the filter for a level or directive string.
pub fn filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the life of the process.
pub fn init(directive: &str, format: LogFormat, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = filter(directive)?;

    let stderr_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match file {
        Some(path) => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .ok_or_else(|| Error::Config(format!("log file has no name: {}", path.display())))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to install logger: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_levels_and_directives() {
        assert!(filter("info").is_ok());
        assert!(filter("cograph::sync=debug,warn").is_ok());
    }

    #[test]
    fn test_filter_rejects_garbage() {
        assert!(matches!(filter("cograph=loud"), Err(Error::Config(_))));
    }
}
