//! # lib_ingest
//!
//! Event-ingestion layer for the charging platform. Sources (queues, SQL
//! tables, file drops) are driven by token-gated ingestion loops, their
//! records are decoded, filtered and mapped into canonical events, partial
//! records are correlated until complete, and a registry multiplexes every
//! running source onto one post-processing pipeline.

#![forbid(unsafe_code)]

/// Reader and service configuration.
pub mod configs;
/// Admission control, ingestion loops, registry and post-processing.
pub mod core;
/// Partial-record correlation and TTL eviction.
pub mod correlation;
/// Error taxonomy shared across the crate.
pub mod errors;
/// Source adapters, one per transport kind.
pub mod ingestors;
/// Tracing subscriber setup.
pub mod loggers;
/// Record decoders, inline filters and field templates.
pub mod records;
/// Hashing, time and file-name helpers.
pub mod utils;

// Re-export everything a binary needs to wire the service.
pub use configs::{load_config, ErsConfig, RunMode, SourceDescriptor};
pub use core::{
    AdmissionPool, AdmissionToken, CanonicalEvent, ChargingBackend, FieldMap, IngestionLoop,
    RawMessage, ReaderEvent, ReaderService,
};
pub use errors::{AdapterError, DispatchError, ProcessError, ServiceError};
pub use ingestors::{DefaultReaderFactory, ReaderFactory, SourceAdapter};
