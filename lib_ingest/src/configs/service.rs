use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ConfigError;
use super::reader::{parse_timezone, SourceDescriptor};

/// Service-wide configuration: defaults applied to readers plus the reader list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Bound on concurrently post-processed events; 0 means unbounded.
    #[serde(default)]
    pub concurrent_events: usize,
    /// Capacity of the shared event stream.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Upper bound on the period of the correlation eviction sweep.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    #[serde(default)]
    pub readers: Vec<SourceDescriptor>,
}

impl Default for ErsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_tenant: default_tenant(),
            default_timezone: default_timezone(),
            concurrent_events: 0,
            event_buffer: default_event_buffer(),
            sweep_interval: default_sweep_interval(),
            readers: Vec::new(),
        }
    }
}

impl ErsConfig {
    /// Validates service defaults and every reader, rejecting duplicate ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_timezone(&self.default_timezone)?;
        let mut seen = HashSet::new();
        for reader in &self.readers {
            reader.validate()?;
            if !seen.insert(reader.id.as_str()) {
                return Err(ConfigError::DuplicateReader(reader.id.clone()));
            }
        }
        Ok(())
    }

    /// Tenant and timezone fallbacks for readers that set none.
    pub fn defaults(&self) -> Result<SourceDefaults, ConfigError> {
        Ok(SourceDefaults {
            tenant: self.default_tenant.clone(),
            timezone: parse_timezone(&self.default_timezone)?,
        })
    }

    /// Parses a configuration document. The reader service section may sit
    /// under an `"ers"` key or be the document root.
    pub fn from_json_str(doc: &str, origin: &Path) -> Result<Self, ConfigError> {
        let parse_err = |source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        };
        let mut value: Value = serde_json::from_str(doc).map_err(parse_err)?;
        if let Some(section) = value.get_mut("ers") {
            value = section.take();
        }
        serde_json::from_value(value).map_err(parse_err)
    }
}

/// Resolved service defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefaults {
    pub tenant: String,
    pub timezone: Tz,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            tenant: default_tenant(),
            timezone: Tz::UTC,
        }
    }
}

impl SourceDefaults {
    /// Tenant for a reader, falling back to the service default.
    pub fn tenant_for(&self, desc: &SourceDescriptor) -> String {
        desc.tenant.clone().unwrap_or_else(|| self.tenant.clone())
    }

    /// Timezone for a reader. Readers are validated before they start, so an
    /// unparsable name falls back to the service default.
    pub fn timezone_for(&self, desc: &SourceDescriptor) -> Tz {
        desc.timezone
            .as_deref()
            .and_then(|name| parse_timezone(name).ok())
            .unwrap_or(self.timezone)
    }
}

/// Reads, parses and validates the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<ErsConfig, ConfigError> {
    let doc = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = ErsConfig::from_json_str(&doc, path)?;
    config.validate()?;
    tracing::debug!(path = %path.display(), readers = config.readers.len(), "configuration loaded");
    Ok(config)
}

fn default_enabled() -> bool {
    true
}

fn default_tenant() -> String {
    "cgrates.org".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_event_buffer() -> usize {
    64
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}
