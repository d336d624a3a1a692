use std::sync::Arc;

use serde_json::Value;

use crate::core::event::{FieldMap, RawMessage};
use crate::errors::DecodeError;

/// Turns one raw message into a field map.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, msg: &RawMessage) -> Result<FieldMap, DecodeError>;
}

/// Decodes a JSON object payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl RecordDecoder for JsonDecoder {
    fn decode(&self, msg: &RawMessage) -> Result<FieldMap, DecodeError> {
        if msg.payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        match serde_json::from_slice::<Value>(&msg.payload)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Array(_) => Err(DecodeError::NotAnObject("array")),
            Value::String(_) => Err(DecodeError::NotAnObject("string")),
            Value::Number(_) => Err(DecodeError::NotAnObject("number")),
            Value::Bool(_) => Err(DecodeError::NotAnObject("bool")),
            Value::Null => Err(DecodeError::NotAnObject("null")),
        }
    }
}

/// Decodes one delimited line into positional fields `"0"`, `"1"`, ...
#[derive(Debug, Clone)]
pub struct DelimitedDecoder {
    separator: String,
}

impl DelimitedDecoder {
    pub fn new(separator: impl Into<String>) -> Self {
        let separator = separator.into();
        Self {
            separator: if separator.is_empty() { ",".into() } else { separator },
        }
    }
}

impl RecordDecoder for DelimitedDecoder {
    fn decode(&self, msg: &RawMessage) -> Result<FieldMap, DecodeError> {
        let line = std::str::from_utf8(&msg.payload)?.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(line
            .split(self.separator.as_str())
            .enumerate()
            .map(|(idx, value)| (idx.to_string(), Value::String(value.to_string())))
            .collect())
    }
}

/// Picks the decoder for a reader type; delimited readers honor the
/// configured separator, falling back to `,` for CSV and `|` for flatstore.
pub fn decoder_for(kind: &str, separator: Option<&str>) -> Arc<dyn RecordDecoder> {
    match kind {
        "*file_csv" => Arc::new(DelimitedDecoder::new(separator.unwrap_or(","))),
        "*flatstore" => Arc::new(DelimitedDecoder::new(separator.unwrap_or("|"))),
        _ => Arc::new(JsonDecoder),
    }
}
