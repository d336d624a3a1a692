//! # Event Model
//!
//! The units that travel through a running source: the opaque [`RawMessage`]
//! produced by an adapter, the normalized [`CanonicalEvent`] produced by
//! mapping, and the [`ReaderEvent`] envelope placed on the shared stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::configs::SourceDescriptor;
use crate::errors::AdapterError;

/// Decoded record fields, ordered by name.
pub type FieldMap = BTreeMap<String, Value>;

/// Option key marking a fragment; `false` (or empty) marks the final one.
pub const OPT_PARTIAL: &str = "*partial";
/// Option key carrying the id of the reader that produced the event.
pub const OPT_READER_ID: &str = "*readerID";
/// Option key carrying the originating file name for file readers.
pub const OPT_FILE_NAME: &str = "*fileName";
/// Message attribute holding the originating file name.
pub const ATTR_FILE_NAME: &str = "fileName";

/// One message as produced by a source adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Transport-level identifier, used in logs.
    pub id: String,
    pub payload: Bytes,
    /// Transport metadata such as the originating file name.
    pub attributes: BTreeMap<String, String>,
    /// Acknowledgment handle understood by the adapter that produced the message.
    pub receipt: String,
}

impl RawMessage {
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let id = id.into();
        Self {
            receipt: id.clone(),
            id,
            payload: payload.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = receipt.into();
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Whether an event can be forwarded as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    Partial,
}

/// The normalized, tenant-scoped output of the mapping step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub tenant: String,
    pub id: String,
    pub time: DateTime<Utc>,
    pub fields: FieldMap,
    pub opts: FieldMap,
}

impl CanonicalEvent {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            time: Utc::now(),
            fields: FieldMap::new(),
            opts: FieldMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_opt(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.opts.insert(key.into(), value.into());
        self
    }

    /// Field value rendered as a string; `None` for missing or null fields.
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(value_to_string)
    }

    /// Option value rendered as a string.
    pub fn opt_str(&self, name: &str) -> Option<String> {
        self.opts.get(name).and_then(value_to_string)
    }

    /// Looks up a `*opts.<name>`, `*cgreq.<name>` or bare field path.
    pub fn path_str(&self, path: &str) -> Option<String> {
        if let Some(name) = path.strip_prefix("*opts.") {
            self.opt_str(name)
        } else {
            self.field_str(path.strip_prefix("*cgreq.").unwrap_or(path))
        }
    }

    /// `Some(true)` for a non-final fragment, `Some(false)` for the final one,
    /// `None` when the event carries no fragment marker.
    pub fn partial_marker(&self) -> Option<bool> {
        self.opts.get(OPT_PARTIAL).map(|v| match v {
            Value::Bool(b) => *b,
            Value::Null => false,
            other => value_to_string(other)
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "" | "false" | "0"))
                .unwrap_or(false),
        })
    }
}

/// Renders scalar values as strings; nested values are rendered as JSON.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Envelope placed on the shared event stream.
#[derive(Debug, Clone)]
pub struct ReaderEvent {
    /// Descriptor of the reader that produced the event. Carried by value so
    /// events of a reader removed by a reload are still post-processed.
    pub source: Arc<SourceDescriptor>,
    pub event: CanonicalEvent,
    /// Field map for raw-event export: the decoded record, or the merged
    /// fields of a completed partial record. Evicted groups have none.
    pub raw: Option<FieldMap>,
}

impl ReaderEvent {
    pub fn reader_id(&self) -> &str {
        &self.source.id
    }
}

/// Fatal transport failure of one reader, sent on the shared error stream.
#[derive(Debug)]
pub struct SourceFailure {
    pub reader_id: String,
    pub error: AdapterError,
}
