//! Tracing subscriber setup: a console layer plus the detailed log file.
//!
//! The detailed log is append-only, one line per event:
//!
//! ```text
//! 2024-06-01 00:00:04,512 - INFO - Scheduling download for iPhone16,1_17.5_21F79_Restore.ipsw for iPhone 15 Pro (iPhone16,1)...
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Target of per-transfer events, kept out of the console.
pub const TRANSFER_TARGET: &str = "ipsw_downloader::transfer";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The detailed log path has no file name.
    #[error("detailed log path '{}' has no file name", path.display())]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },

    /// The log directory could not be created.
    #[error("cannot create log directory '{}': {source}", path.display())]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be opened.
    #[error("cannot open detailed log '{}': {reason}", path.display())]
    Open {
        /// Log file path.
        path: PathBuf,
        /// Appender error description.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("tracing subscriber already initialised: {reason}")]
    AlreadyInitialised {
        /// Error description.
        reason: String,
    },
}

/// Maps `-v`/`-q` to a default filter directive.
#[must_use]
pub fn default_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Formats events as `<timestamp> - <LEVEL> - <message>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetailedFormat;

impl<S, N> FormatEvent<S, N> for DetailedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. The returned guard
/// flushes the detailed log when dropped; keep it alive for the whole process.
///
/// # Errors
///
/// Returns [`LoggingError`] if the detailed log cannot be opened or a
/// subscriber is already installed.
pub fn init_logging(default_directive: &str, detailed_log: &Path) -> Result<WorkerGuard, LoggingError> {
    let file_name = detailed_log
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath {
            path: detailed_log.to_path_buf(),
        })?;
    let directory = match detailed_log.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&directory).map_err(|source| LoggingError::CreateDir {
        path: directory.clone(),
        source,
    })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(&directory)
        .map_err(|e| LoggingError::Open {
            path: detailed_log.to_path_buf(),
            reason: e.to_string(),
        })?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter_fn(|metadata| metadata.target() != TRANSFER_TARGET));

    let detailed = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .event_format(DetailedFormat);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(detailed)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialised {
            reason: e.to_string(),
        })?;

    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::capture::Captured;

    #[test]
    fn test_default_level_mapping() {
        assert_eq!(default_level(0, false), "info");
        assert_eq!(default_level(1, false), "debug");
        assert_eq!(default_level(2, false), "trace");
        assert_eq!(default_level(2, true), "warn");
    }

    #[test]
    fn test_detailed_format_line_shape() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .event_format(DetailedFormat)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Downloaded {}", "/srv/ipsw/a.ipsw");
        });

        let output = captured.contents();
        let line = output.lines().next().unwrap();
        let (timestamp, rest) = line.split_once(" - ").unwrap();
        assert_eq!(timestamp.len(), "2024-06-01 00:00:04,512".len());
        assert_eq!(rest, "INFO - Downloaded /srv/ipsw/a.ipsw");
    }

    #[test]
    fn test_init_logging_rejects_path_without_file_name() {
        let result = init_logging("info", Path::new("/"));
        assert!(matches!(result, Err(LoggingError::InvalidPath { .. })));
    }
}
