use std::path::PathBuf;

use thiserror::Error;

/// Configuration load and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON or does not match the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Two readers share one identity.
    #[error("duplicate reader id {0:?}")]
    DuplicateReader(String),

    /// A timezone name is not in the IANA database.
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    /// A reader section is internally inconsistent.
    #[error("reader {id}: {reason}")]
    InvalidReader { id: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReader {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
