//! # Error Taxonomy
//!
//! Errors are grouped by who is allowed to see them:
//!
//! - [`AdapterError`]: transport failures. A failed connect or receive is fatal
//!   to the owning source and travels on the registry's error stream.
//! - [`ProcessError`]: recoverable per-message failures. Logged with the reader
//!   and message identity, the message is rejected, and ingestion continues.
//! - [`DispatchError`]: post-processing failures for one event.
//! - [`ServiceError`]: registry lifecycle and management operations.

use thiserror::Error;

use crate::configs::ConfigError;

/// Transport-level failures raised by a [`crate::ingestors::SourceAdapter`].
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("acknowledgement failed for message {id}: {reason}")]
    Ack { id: String, reason: String },

    #[error("adapter is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "redis-reader")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "sql-reader")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// A raw message could not be turned into a field map.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// The filter evaluator could not reach a verdict.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter not found: {0}")]
    NotFound(String),

    #[error("malformed filter rule {rule:?}: {reason}")]
    Malformed { rule: String, reason: String },

    #[error("unsupported filter type {0}")]
    Unsupported(String),
}

/// A field template could not be applied.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mandatory field {tag} is missing (value {value:?})")]
    MissingMandatory { tag: String, value: String },

    #[error("invalid template path {0:?}")]
    InvalidPath(String),
}

/// Recoverable failure while processing one message.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("filter: {0}")]
    Filter(#[from] FilterError),

    #[error("mapping: {0}")]
    Mapping(#[from] MappingError),

    #[error("correlation: {0}")]
    Correlation(String),

    #[error("unsupported leg {kind:?} for record <{key}>")]
    UnsupportedLeg { kind: String, key: String },

    /// The shared event stream refused the event, usually because the
    /// registry already shut down.
    #[error("could not post event {0}")]
    Post(String),
}

/// Failure of one post-processing step for a dispatched event.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported request type for flags {0:?}")]
    UnsupportedRequestType(Vec<String>),

    #[error("unsupported flag {0:?}")]
    UnsupportedFlag(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Error returned by a downstream collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{call}: {reason}")]
pub struct BackendError {
    /// Name of the call that failed (e.g. `ProcessMessage`).
    pub call: &'static str,
    /// Reason reported by the collaborator.
    pub reason: String,
}

/// Registry lifecycle and management errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported reader type {0:?}")]
    UnsupportedReaderType(String),

    #[error("no reader with id {0:?}")]
    ReaderNotFound(String),

    #[error("reader {id} runs in {mode} mode; only on_demand readers can be run manually")]
    UnsupportedRunMode { id: String, mode: String },

    #[error("reader {0} does not support manual processing")]
    ManualUnsupported(String),

    #[error("failed to start reader {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: AdapterError,
    },

    #[error("reader {id} failed: {source}")]
    SourceFailure {
        id: String,
        #[source]
        source: AdapterError,
    },

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("the service is already serving")]
    AlreadyServing,
}
