//! Eviction of groups that outlived their TTL.
//!
//! Planning is a pure function of the settings, the key and the buffered
//! fragments, so every action can be checked without touching the file
//! system or a channel. Executing a plan is the correlator's job.

use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::configs::{EvictionAction, SourceDescriptor};
use crate::core::event::{value_to_string, CanonicalEvent};
use crate::errors::MappingError;
use crate::records::{render_record, FieldTemplate};
use crate::utils::sanitize_file_name;

use super::group::Fragment;

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("no dump directory configured")]
    NoDumpPath,

    #[error("render: {0}")]
    Render(#[from] MappingError),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Eviction settings of one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionSettings {
    pub action: EvictionAction,
    pub dump_dir: Option<PathBuf>,
    pub separator: String,
    pub dump_fields: Vec<FieldTemplate>,
}

impl EvictionSettings {
    pub fn from_descriptor(desc: &SourceDescriptor) -> Self {
        Self {
            action: desc.partial.action,
            dump_dir: desc.partial.dump_path.clone(),
            separator: desc.partial.field_separator.clone(),
            dump_fields: desc.cache_dump_fields.clone(),
        }
    }
}

/// Side effect decided for one evicted group.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionPlan {
    Nothing,
    /// Write `contents` to `path`, appending when `append` is set.
    Dump {
        path: PathBuf,
        contents: String,
        append: bool,
    },
    Forward(CanonicalEvent),
}

/// Decides what to do with an expired group. `merge` builds the best-effort
/// event for [`EvictionAction::PostEvent`] with the same rules as completion.
pub fn plan_eviction<M>(
    settings: &EvictionSettings,
    key: &str,
    fragments: &[Fragment],
    merge: M,
) -> Result<EvictionPlan, EvictionError>
where
    M: FnOnce(&[Fragment]) -> Option<CanonicalEvent>,
{
    if fragments.is_empty() {
        return Ok(EvictionPlan::Nothing);
    }
    match settings.action {
        EvictionAction::Discard => Ok(EvictionPlan::Nothing),
        EvictionAction::PostEvent => Ok(merge(fragments).map_or(EvictionPlan::Nothing, EvictionPlan::Forward)),
        EvictionAction::DumpToFile => {
            let dir = settings.dump_dir.as_ref().ok_or(EvictionError::NoDumpPath)?;
            let mut contents = String::new();
            for fragment in fragments {
                contents.push_str(&render_line(settings, &fragment.event)?);
                contents.push('\n');
            }
            Ok(EvictionPlan::Dump {
                path: dir.join(format!("{}.tmp", sanitize_file_name(key))),
                contents,
                append: true,
            })
        }
        EvictionAction::DumpToJson => {
            let dir = settings.dump_dir.as_ref().ok_or(EvictionError::NoDumpPath)?;
            let mut fields = Map::new();
            let mut opts = Map::new();
            for fragment in fragments {
                fields.extend(fragment.event.fields.clone());
                opts.extend(fragment.event.opts.clone());
            }
            let first = &fragments[0].event;
            let doc = serde_json::json!({
                "tenant": first.tenant,
                "id": first.id,
                "time": first.time,
                "fields": Value::Object(fields),
                "opts": Value::Object(opts),
            });
            Ok(EvictionPlan::Dump {
                path: dir.join(format!("{}.json", sanitize_file_name(key))),
                contents: serde_json::to_string_pretty(&doc)?,
                append: false,
            })
        }
    }
}

/// One line per fragment: the dump templates when configured, otherwise the
/// field values in field-name order.
fn render_line(settings: &EvictionSettings, event: &CanonicalEvent) -> Result<String, EvictionError> {
    let values = if settings.dump_fields.is_empty() {
        event.fields.values().map(|v| value_to_string(v).unwrap_or_default()).collect()
    } else {
        render_record(&settings.dump_fields, event)?
    };
    Ok(values.join(&settings.separator))
}
