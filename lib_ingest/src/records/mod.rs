//! # Records Module
//!
//! Collaborators that sit between a raw message and a canonical event. The
//! ingestion loop depends only on the traits; the implementations here are
//! the defaults the registry wires in.
//!
//! ## Contained Modules:
//! - **`decoder`**: [`RecordDecoder`] with JSON and delimited decoders.
//! - **`filter`**: [`EventFilter`] with the inline rule evaluator.
//! - **`template`**: [`FieldMapper`] with the template mapper, plus export
//!   rendering used by eviction dumps.

/// Raw message decoders.
pub mod decoder;
/// Record filters.
pub mod filter;
/// Field templates.
pub mod template;

// --- Public API Re-exports ---
pub use decoder::{decoder_for, DelimitedDecoder, JsonDecoder, RecordDecoder};
pub use filter::{EventFilter, InlineFilters};
pub use template::{render_record, FieldMapper, FieldTemplate, MappingContext, TemplateKind, TemplateMapper};
