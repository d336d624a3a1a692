//! # Source Descriptor
//!
//! Immutable per-reader configuration snapshot. The registry hands an
//! `Arc<SourceDescriptor>` to every component of a running source; nothing
//! downstream mutates it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::records::FieldTemplate;

/// How a reader is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Poll the source every `run_delay`.
    #[default]
    Continuous,
    /// Watch the source for new records with a short poll interval.
    Watch,
    /// No background pull; records are processed only through "run now".
    OnDemand,
    /// The reader is configured but never started.
    Disabled,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Continuous => "continuous",
            RunMode::Watch => "watch",
            RunMode::OnDemand => "on_demand",
            RunMode::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Which legs a leg-matching group needs before it completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRequirement {
    /// Setup and teardown only: `INVITE` + `BYE`.
    AckOptional,
    /// Setup, acknowledgment and teardown: `INVITE` + `ACK` + `BYE`.
    AckMandatory,
    /// An explicit list of leg kinds.
    Custom(Vec<String>),
}

impl LegRequirement {
    /// Required leg kinds in merge order.
    pub fn legs(&self) -> Vec<String> {
        match self {
            LegRequirement::AckOptional => vec!["INVITE".into(), "BYE".into()],
            LegRequirement::AckMandatory => vec!["INVITE".into(), "ACK".into(), "BYE".into()],
            LegRequirement::Custom(legs) => legs.clone(),
        }
    }
}

/// Classifies a leg as a self-contained failure record by the prefix of one
/// of its values (e.g. `*opts.*fileName` starting with `missed_calls`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCallRule {
    pub path: String,
    pub prefix: String,
}

/// Leg-matching completion: one group per session, complete once every
/// required leg kind has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegMatchingPolicy {
    pub legs: LegRequirement,
    #[serde(default = "default_leg_field")]
    pub leg_field: String,
    #[serde(default = "default_leg_keys")]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub failed_call: Option<FailedCallRule>,
}

/// Fragment completion: fragments are buffered until one carries the final
/// marker, then sorted and merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentPolicy {
    #[serde(default = "default_fragment_keys")]
    pub key_fields: Vec<String>,
    #[serde(default = "default_order_field")]
    pub order_field: String,
    #[serde(default = "default_order_fallback_field")]
    pub order_fallback_field: String,
}

impl Default for FragmentPolicy {
    fn default() -> Self {
        Self {
            key_fields: default_fragment_keys(),
            order_field: default_order_field(),
            order_fallback_field: default_order_fallback_field(),
        }
    }
}

/// Completion policy for partial records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every event is complete and forwarded immediately.
    #[default]
    None,
    LegMatching(LegMatchingPolicy),
    FinalFragment(FragmentPolicy),
}

/// What happens to a correlation group whose TTL expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionAction {
    #[default]
    Discard,
    /// Append one rendered line per buffered fragment to `<dump_path>/<key>.tmp`.
    DumpToFile,
    /// Write the later-wins merge of all fragments to `<dump_path>/<key>.json`.
    DumpToJson,
    /// Merge like a completed group and forward anyway.
    PostEvent,
}

impl EvictionAction {
    /// Whether the action writes into the dump directory.
    pub fn needs_dump_path(self) -> bool {
        matches!(self, EvictionAction::DumpToFile | EvictionAction::DumpToJson)
    }
}

/// Correlation settings of a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub policy: CompletionPolicy,
    #[serde(with = "humantime_serde", default = "default_partial_ttl")]
    pub ttl: Duration,
    #[serde(default)]
    pub action: EvictionAction,
    #[serde(default)]
    pub dump_path: Option<PathBuf>,
    #[serde(default = "default_dump_separator")]
    pub field_separator: String,
}

impl Default for PartialConfig {
    fn default() -> Self {
        Self {
            policy: CompletionPolicy::None,
            ttl: default_partial_ttl(),
            action: EvictionAction::Discard,
            dump_path: None,
            field_separator: default_dump_separator(),
        }
    }
}

/// Exporter ids used by post-processing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExporterIds {
    /// Targets of the `*export` flag.
    #[serde(default)]
    pub export_ids: Vec<String>,
    /// Raw field maps of successfully processed events.
    #[serde(default)]
    pub success_ids: Vec<String>,
    /// Raw field maps of events whose processing failed.
    #[serde(default)]
    pub failed_ids: Vec<String>,
}

/// Transport options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceOpts {
    /// Field separator for delimited records; defaults per reader type.
    #[serde(default)]
    pub field_separator: Option<String>,
    /// Number of leading lines skipped in every delimited file.
    #[serde(default)]
    pub header_lines: usize,
    #[serde(default)]
    pub redis_list: Option<String>,
    #[serde(default)]
    pub sql_table: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Configuration of one reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    /// Reader type (`*file_csv`, `*flatstore`, `*file_json`, `*redis`, `*sql`, `*none`).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(with = "humantime_serde", default = "default_run_delay")]
    pub run_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub start_delay: Duration,
    /// Size of the admission pool; 0 means unbounded.
    #[serde(default)]
    pub concurrent_requests: usize,
    /// Directory for file readers, connection URL for queue and SQL readers.
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub processed_path: Option<PathBuf>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldTemplate>,
    #[serde(default)]
    pub cache_dump_fields: Vec<FieldTemplate>,
    #[serde(default)]
    pub partial: PartialConfig,
    #[serde(default)]
    pub exporters: ExporterIds,
    #[serde(default)]
    pub opts: SourceOpts,
}

impl SourceDescriptor {
    /// A descriptor with defaults everywhere except identity and type.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            run_mode: RunMode::default(),
            run_delay: default_run_delay(),
            start_delay: Duration::ZERO,
            concurrent_requests: 0,
            source_path: String::new(),
            processed_path: None,
            tenant: None,
            timezone: None,
            filters: Vec::new(),
            flags: Vec::new(),
            fields: Vec::new(),
            cache_dump_fields: Vec::new(),
            partial: PartialConfig::default(),
            exporters: ExporterIds::default(),
            opts: SourceOpts::default(),
        }
    }

    /// Readers of type `*none` or in `disabled` mode are never started.
    pub fn is_enabled(&self) -> bool {
        self.run_mode != RunMode::Disabled && self.kind != "*none"
    }

    /// Checks the descriptor for inconsistencies the runtime cannot recover from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::invalid("<empty>", "reader id must not be empty"));
        }
        if let Some(tz) = &self.timezone {
            parse_timezone(tz)?;
        }
        match &self.partial.policy {
            CompletionPolicy::None => {}
            CompletionPolicy::LegMatching(policy) => {
                if policy.legs.legs().is_empty() {
                    return Err(ConfigError::invalid(&self.id, "leg matching needs at least one leg"));
                }
                if policy.key_fields.is_empty() {
                    return Err(ConfigError::invalid(&self.id, "leg matching needs a key field"));
                }
                self.validate_eviction()?;
            }
            CompletionPolicy::FinalFragment(policy) => {
                if policy.key_fields.is_empty() {
                    return Err(ConfigError::invalid(&self.id, "fragment policy needs a key field"));
                }
                self.validate_eviction()?;
            }
        }
        Ok(())
    }

    fn validate_eviction(&self) -> Result<(), ConfigError> {
        if self.partial.ttl.is_zero() {
            return Err(ConfigError::invalid(&self.id, "partial ttl must be greater than zero"));
        }
        if self.partial.action.needs_dump_path() && self.partial.dump_path.is_none() {
            return Err(ConfigError::invalid(
                &self.id,
                format!("eviction action {:?} requires partial.dump_path", self.partial.action),
            ));
        }
        Ok(())
    }
}

/// Parses an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

fn default_run_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_partial_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_dump_separator() -> String {
    ",".to_string()
}

fn default_leg_field() -> String {
    "Method".to_string()
}

fn default_leg_keys() -> Vec<String> {
    vec!["OriginID".to_string()]
}

fn default_fragment_keys() -> Vec<String> {
    vec!["OriginID".to_string(), "OriginHost".to_string()]
}

fn default_order_field() -> String {
    "AnswerTime".to_string()
}

fn default_order_fallback_field() -> String {
    "SetupTime".to_string()
}
