//! Inline filter evaluation.
//!
//! Rules have the shape `<type>:<path>:<value1>|<value2>`, where the path
//! selects a decoded field with `~*req.<name>`. Supported types: `*string`,
//! `*prefix`, `*suffix`, `*exists`, and their `*not` negations. All rules of
//! a reader must pass. Filter profile ids (rules without a leading `*`) are
//! resolved by an external filter service; the inline evaluator reports them
//! as not found.

use crate::core::event::{value_to_string, FieldMap};
use crate::errors::FilterError;

/// Decides whether a decoded record should be processed.
pub trait EventFilter: Send + Sync {
    fn pass(&self, tenant: &str, filters: &[String], fields: &FieldMap) -> Result<bool, FilterError>;
}

/// Evaluates inline filter rules against the decoded field map.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineFilters;

impl EventFilter for InlineFilters {
    fn pass(&self, _tenant: &str, filters: &[String], fields: &FieldMap) -> Result<bool, FilterError> {
        for rule in filters {
            if !evaluate(rule, fields)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn evaluate(rule: &str, fields: &FieldMap) -> Result<bool, FilterError> {
    if !rule.starts_with('*') {
        return Err(FilterError::NotFound(rule.to_string()));
    }
    let mut parts = rule.splitn(3, ':');
    let kind = parts.next().unwrap_or_default();
    let path = parts.next().ok_or_else(|| FilterError::Malformed {
        rule: rule.to_string(),
        reason: "missing path".into(),
    })?;
    let values: Vec<&str> = parts.next().map(|v| v.split('|').collect()).unwrap_or_default();

    let name = path.strip_prefix("~*req.").ok_or_else(|| FilterError::Malformed {
        rule: rule.to_string(),
        reason: format!("unsupported path {path:?}"),
    })?;
    let actual = fields.get(name).and_then(value_to_string);

    let (negate, base) = match kind.strip_prefix("*not") {
        Some(rest) => (true, format!("*{rest}")),
        None => (false, kind.to_string()),
    };
    let needs_values = base != "*exists";
    if needs_values && values.is_empty() {
        return Err(FilterError::Malformed {
            rule: rule.to_string(),
            reason: "missing values".into(),
        });
    }

    let matched = match base.as_str() {
        "*exists" => actual.is_some(),
        "*string" => actual.is_some_and(|a| values.iter().any(|v| a == *v)),
        "*prefix" => actual.is_some_and(|a| values.iter().any(|v| a.starts_with(v))),
        "*suffix" => actual.is_some_and(|a| values.iter().any(|v| a.ends_with(v))),
        _ => return Err(FilterError::Unsupported(kind.to_string())),
    };
    Ok(matched != negate)
}
