//! Tracing subscriber setup for the `delve` binary.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingSection;

pub const LOG_FILE_PREFIX: &str = "delve.log";

/// How the process should log.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Number of `-v` flags
    pub verbosity: u8,
    pub json: bool,
    /// Directory for a daily-rotated JSON log file
    pub dir: Option<PathBuf>,
}

impl LogOptions {
    pub fn from_config(section: &LoggingSection, verbosity: u8) -> Self {
        Self {
            verbosity,
            json: section.json,
            dir: section.dir.clone(),
        }
    }
}

/// Filter directive for a verbosity level. `RUST_LOG` takes precedence.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. Console output goes to stderr.
///
/// Keep the returned guard alive for the life of the process, or buffered
/// file output is lost.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(options.verbosity)));

    let (file_layer, guard) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let json_layer = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!options.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_verbosity() {
        assert_eq!(level_for(0), "warn");
        assert_eq!(level_for(1), "info");
        assert_eq!(level_for(2), "debug");
        assert_eq!(level_for(7), "trace");
    }

    #[test]
    fn test_options_from_config() {
        let section = LoggingSection {
            json: true,
            dir: Some(PathBuf::from("/tmp/logs")),
        };
        let options = LogOptions::from_config(&section, 2);
        assert!(options.json);
        assert_eq!(options.verbosity, 2);
        assert_eq!(options.dir, Some(PathBuf::from("/tmp/logs")));
    }
}
