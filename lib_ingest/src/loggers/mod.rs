//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` (taken
//! from `RUST_LOG` when set, otherwise from the configured level), a console
//! layer, and a JSON file layer written through a non-blocking appender.
//! Each run logs to a fresh timestamped file; older files in the directory
//! are removed at start so only the previous run's file is kept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Extension of the files managed by [`init_tracing`].
pub const LOG_EXTENSION: &str = "log";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("a global subscriber is already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Where and how to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub dir: PathBuf,
    /// File name prefix, usually the binary name.
    pub prefix: String,
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `lib_ingest=debug`.
    pub level: String,
    /// Console output as JSON instead of the human-readable format.
    pub json: bool,
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes and stops the file writer.
pub fn init_tracing(opts: &LogOptions) -> Result<WorkerGuard, LoggerError> {
    let io_err = |source| LoggerError::Io {
        path: opts.dir.clone(),
        source,
    };
    fs::create_dir_all(&opts.dir).map_err(io_err)?;
    let removed = cleanup_old_logs(&opts.dir).map_err(io_err)?;

    let file_name = format!(
        "{}_{}.{LOG_EXTENSION}",
        opts.prefix,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&opts.dir, file_name));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&opts.level)?,
    };
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer).json();
    let console_text = (!opts.json).then(|| fmt::layer().with_target(true));
    let console_json = opts.json.then(|| fmt::layer().json());

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()?;

    info!(dir = %opts.dir.display(), level = %opts.level, removed, "logging initialized");
    Ok(guard)
}

/// Deletes every `.log` file in `dir` except the most recently modified one.
/// Returns how many files were removed.
pub fn cleanup_old_logs(dir: &Path) -> io::Result<usize> {
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == LOG_EXTENSION))
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();

    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(1) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("failed to delete old log file {}: {e}", path.display()),
        }
    }
    Ok(removed)
}
