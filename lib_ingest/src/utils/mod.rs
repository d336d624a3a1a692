//! # Utilities Module
//!
//! Small helpers shared by the correlation engine and the ingestion loop.
//!
//! ## Contained Modules:
//!
//! - **`hash`**: content-derived correlation keys and event identifiers.
//! - **`time`**: timestamp parsing for the fragment sort key.
//! - **`files`**: file-name sanitizing for dump files.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// File-name helpers.
pub mod files;
/// SHA-256 based identifiers.
pub mod hash;
/// Timestamp parsing.
pub mod time;

// --- Public API Re-exports ---
pub use files::sanitize_file_name;
pub use hash::{correlation_key, event_id};
pub use time::parse_timestamp;
