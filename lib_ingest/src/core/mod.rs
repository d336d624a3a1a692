//! # Core Engine Module
//!
//! The moving parts of the reader service: per-source admission control, the
//! ingestion loop that drives a source adapter, the registry that multiplexes
//! every running source onto one event stream, and the flag-driven
//! post-processing of the events that come out of it.
//!
//! ## Core Components:
//!
//! - **`admission`**: the per-source Admission Token Pool. Every message
//!   processing unit holds one token, returned on every exit path.
//!
//! - **`event`**: raw messages, canonical events and the envelope placed on
//!   the shared event stream.
//!
//! - **`ingestion`**: the loop driving one source from connection to
//!   shutdown, plus the "run now" operation for on-demand sources.
//!
//! - **`registry`**: the reader registry with start, serve, hot reload and
//!   shutdown.
//!
//! - **`flags`** and **`dispatcher`**: reader flags parsed into a closed set
//!   and the post-processing calls they select.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-source concurrency budget.
pub mod admission;
/// Flag-driven post-processing.
pub mod dispatcher;
/// Messages and events.
pub mod event;
/// Reader flags and request types.
pub mod flags;
/// The per-source ingestion loop.
pub mod ingestion;
/// Reader registry and hot reload.
pub mod registry;

// --- Public API Re-exports ---
pub use admission::{AdmissionPool, AdmissionToken};
pub use dispatcher::{BackendCall, BackendReply, ChargingBackend, Dispatcher, SessionArgs};
pub use event::{CanonicalEvent, Disposition, FieldMap, RawMessage, ReaderEvent, SourceFailure};
pub use flags::{FlagKind, FlagSet, RequestType};
pub use ingestion::{IngestionLoop, Outlets, Pipeline};
pub use registry::{ReaderService, ReloadSummary, RunningSource, SourceState};
