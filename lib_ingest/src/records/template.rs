//! Field templates: projection of a decoded record into a canonical event,
//! and rendering of an event into an export line.
//!
//! A template writes one `path` (`*cgreq.<name>`, `*exp.<name>` or
//! `*opts.<name>`) from a `value` made of `;`-separated parts. A part is
//! either a reference (`~*req.<name>`, `~*cgreq.<name>`, `~*opts.<name>`)
//! or a literal.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::event::{value_to_string, CanonicalEvent, FieldMap};
use crate::errors::MappingError;
use crate::utils::parse_timestamp;

/// Fields tried, in order, for the event timestamp.
const TIME_FIELDS: [&str; 2] = ["AnswerTime", "SetupTime"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemplateKind {
    /// Resolve the parts and write the result.
    #[default]
    #[serde(rename = "*variable")]
    Variable,
    /// Write `value` verbatim.
    #[serde(rename = "*constant")]
    Constant,
    /// Append the resolved parts to whatever the path already holds.
    #[serde(rename = "*composed")]
    Composed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTemplate {
    pub tag: String,
    pub path: String,
    #[serde(rename = "type", default)]
    pub kind: TemplateKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub mandatory: bool,
}

impl FieldTemplate {
    /// A `*variable` template copying `~*req.<source>` into `*cgreq.<tag>`.
    pub fn variable(tag: &str, value: &str) -> Self {
        Self {
            tag: tag.to_string(),
            path: format!("*cgreq.{tag}"),
            kind: TemplateKind::Variable,
            value: value.to_string(),
            mandatory: false,
        }
    }

    pub fn constant(path: &str, value: &str) -> Self {
        Self {
            tag: path.rsplit('.').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            kind: TemplateKind::Constant,
            value: value.to_string(),
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Inputs to one projection besides the decoded record.
#[derive(Debug, Clone)]
pub struct MappingContext {
    pub tenant: String,
    pub timezone: Tz,
    pub event_id: String,
    /// Options stamped by the ingestion loop (`*readerID`, `*fileName`).
    pub opts: FieldMap,
}

/// Projects a decoded field map into a canonical event.
pub trait FieldMapper: Send + Sync {
    fn project(
        &self,
        ctx: MappingContext,
        fields: &FieldMap,
        templates: &[FieldTemplate],
    ) -> Result<CanonicalEvent, MappingError>;
}

/// Applies [`FieldTemplate`]s in order. With no templates the decoded fields
/// are copied as they are.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateMapper;

enum Target {
    Field(String),
    Opt(String),
}

fn target_of(path: &str) -> Result<Target, MappingError> {
    if let Some(name) = path.strip_prefix("*cgreq.").or_else(|| path.strip_prefix("*exp.")) {
        Ok(Target::Field(name.to_string()))
    } else if let Some(name) = path.strip_prefix("*opts.") {
        Ok(Target::Opt(name.to_string()))
    } else {
        Err(MappingError::InvalidPath(path.to_string()))
    }
}

/// Resolves the `;`-separated parts of a template value. A single reference
/// keeps its JSON type; several parts are concatenated as strings. `None`
/// when every reference part is missing.
fn resolve(value: &str, fields: &FieldMap, opts: &FieldMap) -> Option<Value> {
    let parts: Vec<&str> = value.split(';').collect();
    if let [single] = parts.as_slice() {
        return match lookup(single, fields, opts) {
            Some(found) => found.cloned(),
            None => Some(Value::String(single.to_string())),
        };
    }

    let mut out = String::new();
    let mut refs = 0;
    let mut found = 0;
    for part in parts {
        match lookup(part, fields, opts) {
            Some(hit) => {
                refs += 1;
                if let Some(s) = hit.and_then(value_to_string) {
                    found += 1;
                    out.push_str(&s);
                }
            }
            None => out.push_str(part),
        }
    }
    (refs == 0 || found > 0).then_some(Value::String(out))
}

/// `None` for literals, `Some(None)` for references that resolve to nothing.
fn lookup<'a>(part: &str, fields: &'a FieldMap, opts: &'a FieldMap) -> Option<Option<&'a Value>> {
    if let Some(name) = part.strip_prefix("~*req.").or_else(|| part.strip_prefix("~*cgreq.")) {
        Some(fields.get(name).filter(|v| !v.is_null()))
    } else {
        part.strip_prefix("~*opts.").map(|name| opts.get(name).filter(|v| !v.is_null()))
    }
}

fn compose(existing: Option<&Value>, addition: Value) -> Value {
    match existing.and_then(value_to_string) {
        Some(mut prefix) => {
            prefix.push_str(&value_to_string(&addition).unwrap_or_default());
            Value::String(prefix)
        }
        None => addition,
    }
}

impl FieldMapper for TemplateMapper {
    fn project(
        &self,
        ctx: MappingContext,
        fields: &FieldMap,
        templates: &[FieldTemplate],
    ) -> Result<CanonicalEvent, MappingError> {
        let mut event = CanonicalEvent::new(ctx.tenant, ctx.event_id);
        event.opts = ctx.opts;

        if templates.is_empty() {
            event.fields = fields.clone();
        }
        for tpl in templates {
            let target = target_of(&tpl.path)?;
            let value = match tpl.kind {
                TemplateKind::Constant => Some(Value::String(tpl.value.clone())),
                TemplateKind::Variable | TemplateKind::Composed => {
                    resolve(&tpl.value, fields, &event.opts)
                }
            };
            let Some(value) = value else {
                if tpl.mandatory {
                    return Err(MappingError::MissingMandatory {
                        tag: tpl.tag.clone(),
                        value: tpl.value.clone(),
                    });
                }
                continue;
            };
            let (map, name) = match target {
                Target::Field(name) => (&mut event.fields, name),
                Target::Opt(name) => (&mut event.opts, name),
            };
            let value = match tpl.kind {
                TemplateKind::Composed => compose(map.get(&name), value),
                _ => value,
            };
            map.insert(name, value);
        }

        if let Some(ts) = TIME_FIELDS
            .iter()
            .filter_map(|f| event.fields.get(*f))
            .find_map(|v| parse_timestamp(v, ctx.timezone))
        {
            event.time = ts;
        }
        Ok(event)
    }
}

/// Renders an event through export templates, one string per template.
/// Missing optional values render as empty strings.
pub fn render_record(templates: &[FieldTemplate], event: &CanonicalEvent) -> Result<Vec<String>, MappingError> {
    templates
        .iter()
        .map(|tpl| {
            let value = match tpl.kind {
                TemplateKind::Constant => Some(Value::String(tpl.value.clone())),
                _ => resolve(&tpl.value, &event.fields, &event.opts),
            };
            match value {
                Some(v) => Ok(value_to_string(&v).unwrap_or_default()),
                None if tpl.mandatory => Err(MappingError::MissingMandatory {
                    tag: tpl.tag.clone(),
                    value: tpl.value.clone(),
                }),
                None => Ok(String::new()),
            }
        })
        .collect()
}
