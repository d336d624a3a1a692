//! # Configuration Module
//!
//! Reader service configuration as loaded from a JSON document. Durations are
//! written in humantime notation (`"500ms"`, `"2s"`).
//!
//! ## Contained Modules:
//! - **`reader`**: the per-reader [`SourceDescriptor`] with its completion
//!   policy, eviction settings and transport options.
//! - **`service`**: the service-wide [`ErsConfig`] and [`load_config`].
//! - **`error`**: [`ConfigError`].

/// Configuration errors.
pub mod error;
/// Per-reader descriptors.
pub mod reader;
/// Service-wide configuration and loading.
pub mod service;

// --- Public API Re-exports ---
pub use error::ConfigError;
pub use reader::{
    parse_timezone, CompletionPolicy, EvictionAction, ExporterIds, FailedCallRule,
    FragmentPolicy, LegMatchingPolicy, LegRequirement, PartialConfig, RunMode, SourceDescriptor,
    SourceOpts,
};
pub use service::{load_config, ErsConfig, SourceDefaults};
