//! Configuration and initialization for application logging.
//!
//! `LogConfig` selects where log records go (stdout, stderr, journald, a file),
//! how they are rendered and the minimum level that is recorded. Controllers
//! usually run in containers, so records go to stdout in the compact format
//! unless configured otherwise.
use std::{fs::OpenOptions, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use tracing_subscriber::{
    Layer, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

/// Represents the configuration for the application's logging system.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Optional path to a file where logs should be appended.
    #[serde(default = "LogConfig::default_file_path")]
    pub file_path: Option<PathBuf>,

    /// Whether logs are emitted to `journald`.
    #[serde(default = "LogConfig::default_emit_journald")]
    pub emit_journald: bool,

    /// Whether logs are emitted to standard output.
    #[serde(default = "LogConfig::default_emit_stdout")]
    pub emit_stdout: bool,

    /// Whether logs are emitted to standard error.
    #[serde(default = "LogConfig::default_emit_stderr")]
    pub emit_stderr: bool,

    /// Rendering used by the stdout, stderr and file outputs.
    #[serde(default)]
    pub format: LogFormat,

    /// The minimum log level to be recorded.
    #[serde(default = "LogConfig::default_log_level")]
    #[serde_as(as = "DisplayFromStr")]
    pub level: tracing::Level,
}

/// Rendering of formatted log records.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    /// Single-line records, one per event.
    #[default]
    Compact,
    /// Multi-line, human friendly records.
    Pretty,
}

impl Default for LogConfig {
    /// Logs at `INFO` level to stdout only, in the compact format.
    fn default() -> Self {
        Self {
            file_path: Self::default_file_path(),
            emit_journald: Self::default_emit_journald(),
            emit_stdout: Self::default_emit_stdout(),
            emit_stderr: Self::default_emit_stderr(),
            format: LogFormat::default(),
            level: Self::default_log_level(),
        }
    }
}

impl LogConfig {
    #[inline]
    #[must_use]
    pub const fn default_log_level() -> tracing::Level { tracing::Level::INFO }

    #[inline]
    #[must_use]
    pub const fn default_file_path() -> Option<PathBuf> { None }

    #[inline]
    #[must_use]
    pub const fn default_emit_journald() -> bool { false }

    #[inline]
    #[must_use]
    pub const fn default_emit_stdout() -> bool { true }

    #[inline]
    #[must_use]
    pub const fn default_emit_stderr() -> bool { false }

    /// Installs the global `tracing` subscriber described by this config.
    ///
    /// # Panics
    ///
    /// Panics if a global subscriber has already been installed.
    pub fn registry(&self) {
        let Self { emit_journald, file_path, emit_stdout, emit_stderr, format, level } = self;

        let filter_layer = tracing_subscriber::filter::LevelFilter::from_level(*level);

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(emit_journald.then(|| LogDriver::Journald.layer(*format)))
            .with(file_path.clone().map(|path| LogDriver::File(path).layer(*format)))
            .with(emit_stdout.then(|| LogDriver::Stdout.layer(*format)))
            .with(emit_stderr.then(|| LogDriver::Stderr.layer(*format)))
            .init();
    }
}

#[derive(Clone, Debug)]
enum LogDriver {
    Stdout,
    Stderr,
    Journald,
    File(PathBuf),
}

impl LogDriver {
    /// Creates the `tracing_subscriber::Layer` writing to this driver's output.
    ///
    /// Returns `None` when the output cannot be opened (an unwritable file, or
    /// no journald socket).
    #[allow(clippy::type_repetition_in_bounds)]
    fn layer<S>(self, format: LogFormat) -> Option<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: tracing::Subscriber,
        for<'a> S: LookupSpan<'a>,
    {
        if let Self::Journald = self {
            return Some(Box::new(tracing_journald::layer().ok()?));
        }

        let fmt = tracing_subscriber::fmt::layer().with_thread_ids(true).with_target(true);
        match (self, format) {
            (Self::Stdout, LogFormat::Compact) => {
                Some(Box::new(fmt.compact().with_writer(std::io::stdout)))
            }
            (Self::Stdout, LogFormat::Pretty) => {
                Some(Box::new(fmt.pretty().with_writer(std::io::stdout)))
            }
            (Self::Stderr, LogFormat::Compact) => {
                Some(Box::new(fmt.compact().with_writer(std::io::stderr)))
            }
            (Self::Stderr, LogFormat::Pretty) => {
                Some(Box::new(fmt.pretty().with_writer(std::io::stderr)))
            }
            (Self::File(path), format) => {
                let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
                match format {
                    LogFormat::Compact => {
                        Some(Box::new(fmt.compact().with_ansi(false).with_writer(file)))
                    }
                    LogFormat::Pretty => {
                        Some(Box::new(fmt.pretty().with_ansi(false).with_writer(file)))
                    }
                }
            }
            (Self::Journald, _) => None,
        }
    }
}
