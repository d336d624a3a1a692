//! # Source Adapters Module
//!
//! Every transport is an independent implementation of [`SourceAdapter`],
//! picked by a [`ReaderFactory`] keyed on the configured reader type. The
//! ingestion loop depends only on the trait.
//!
//! ## Contained Modules:
//! - **`directory`**: file readers (`*file_csv`, `*flatstore`, `*file_json`)
//!   scanning a spool directory.
//! - **`redis_list`**: a reliable-queue reader on a Redis list
//!   (feature `redis-reader`).
//! - **`postgres_table`**: a PostgreSQL table poller (feature `sql-reader`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Spool directory readers.
pub mod directory;
/// Redis list reader.
#[cfg(feature = "redis-reader")]
pub mod redis_list;
/// PostgreSQL table reader.
#[cfg(feature = "sql-reader")]
pub mod postgres_table;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::configs::SourceDescriptor;
use crate::core::event::RawMessage;
use crate::errors::{AdapterError, ServiceError};
use crate::records::{decoder_for, RecordDecoder};

// --- Public API Re-exports ---
pub use directory::DirectoryAdapter;
#[cfg(feature = "redis-reader")]
pub use redis_list::RedisListAdapter;
#[cfg(feature = "sql-reader")]
pub use postgres_table::PostgresTableAdapter;

/// The minimal contract the ingestion loop needs from a transport.
///
/// Methods take `&self`: one loop calls `next` sequentially while processing
/// units concurrently call `ack`/`reject` for earlier messages.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Dials the transport. A failure here keeps the reader from starting.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Suspends until the next message. `Ok(None)` is a clean end of stream;
    /// an error is a transport failure fatal to the reader.
    async fn next(&self) -> Result<Option<RawMessage>, AdapterError>;

    /// Confirms a message was fully handled.
    async fn ack(&self, msg: &RawMessage) -> Result<(), AdapterError>;

    /// Gives a message back. With `redeliver` the transport should offer it
    /// again, otherwise drop it.
    async fn reject(&self, msg: &RawMessage, redeliver: bool) -> Result<(), AdapterError>;

    /// Closes the transport. Further `next` calls end the stream.
    async fn close(&self) -> Result<(), AdapterError>;

    /// Whether rejected messages can be offered again.
    fn redeliverable(&self) -> bool {
        true
    }

    /// Whether `next` drains to an end of stream, so the source can be run
    /// on demand.
    fn supports_manual(&self) -> bool {
        false
    }
}

/// Reader types known to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    /// Placeholder reader that is never started.
    None,
    /// Comma-separated records, one per line.
    FileCsv,
    /// Pipe-separated call legs, one per line.
    Flatstore,
    /// One JSON object per file.
    FileJson,
    /// Redis list used as a reliable queue.
    Redis,
    /// PostgreSQL table.
    Sql,
}

impl FromStr for ReaderKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*none" => Ok(ReaderKind::None),
            "*file_csv" => Ok(ReaderKind::FileCsv),
            "*flatstore" => Ok(ReaderKind::Flatstore),
            "*file_json" => Ok(ReaderKind::FileJson),
            "*redis" => Ok(ReaderKind::Redis),
            "*sql" => Ok(ReaderKind::Sql),
            other => Err(ServiceError::UnsupportedReaderType(other.to_string())),
        }
    }
}

/// Builds transport adapters and record decoders for reader descriptors.
pub trait ReaderFactory: Send + Sync {
    /// Constructs an unconnected adapter for the reader.
    fn build(&self, desc: &SourceDescriptor) -> Result<Arc<dyn SourceAdapter>, ServiceError>;

    /// Decoder for the reader's records.
    fn decoder(&self, desc: &SourceDescriptor) -> Arc<dyn RecordDecoder> {
        decoder_for(&desc.kind, desc.opts.field_separator.as_deref())
    }
}

/// Factory for the transports built into this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReaderFactory;

impl ReaderFactory for DefaultReaderFactory {
    fn build(&self, desc: &SourceDescriptor) -> Result<Arc<dyn SourceAdapter>, ServiceError> {
        match desc.kind.parse::<ReaderKind>()? {
            ReaderKind::FileCsv | ReaderKind::Flatstore => {
                Ok(Arc::new(DirectoryAdapter::lines(desc)))
            }
            ReaderKind::FileJson => Ok(Arc::new(DirectoryAdapter::documents(desc))),
            #[cfg(feature = "redis-reader")]
            ReaderKind::Redis => Ok(Arc::new(RedisListAdapter::new(desc))),
            #[cfg(feature = "sql-reader")]
            ReaderKind::Sql => Ok(Arc::new(PostgresTableAdapter::new(desc)?)),
            unsupported => Err(ServiceError::UnsupportedReaderType(format!(
                "{} ({unsupported:?} is not available in this build)",
                desc.kind
            ))),
        }
    }
}
