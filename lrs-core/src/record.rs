//! Records - Backend-Neutral Value Types
//!
//! `TigerStyle`: One shape for a stored unit across every engine.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::constants::{
    RECORD_ID_BYTES_MAX, RECORD_ID_FIELD, RECORD_PHYSICAL_ID_BYTES, RECORD_TIMESTAMP_FIELD,
};
use crate::error::{BackendError, BackendResult};

/// A stored unit: string keys to JSON values.
pub type Document = Map<String, Value>;

// =============================================================================
// Record
// =============================================================================

/// A record as returned by a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Engine-assigned unique identifier (tie-breaker source)
    pub id: String,
    /// The stored mapping
    pub document: Document,
    /// Values of the effective sort keys observed for this record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_values: Vec<Value>,
}

impl Record {
    /// Create a record without sort values.
    #[must_use]
    pub fn new(id: impl Into<String>, document: Document) -> Self {
        Self {
            id: id.into(),
            document,
            sort_values: Vec::new(),
        }
    }

    /// Attach the effective sort tuple.
    #[must_use]
    pub fn with_sort_values(mut self, sort_values: Vec<Value>) -> Self {
        self.sort_values = sort_values;
        self
    }

    /// Logical statement id, when present.
    #[must_use]
    pub fn logical_id(&self) -> Option<&str> {
        self.document.get(RECORD_ID_FIELD).and_then(Value::as_str)
    }

    /// Serialize the document as one JSON line (no trailing newline).
    ///
    /// # Errors
    /// Returns `BadFormat` if the document cannot be serialized.
    pub fn to_json_line(&self) -> BackendResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.document)?))
    }
}

// =============================================================================
// Write input and operations
// =============================================================================

/// One item handed to `write`: a decoded mapping or raw JSON bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteInput {
    /// Already decoded mapping
    Document(Document),
    /// One JSON object, still encoded
    Raw(Bytes),
}

impl From<Document> for WriteInput {
    fn from(document: Document) -> Self {
        Self::Document(document)
    }
}

impl From<Bytes> for WriteInput {
    fn from(raw: Bytes) -> Self {
        Self::Raw(raw)
    }
}

impl From<&str> for WriteInput {
    fn from(raw: &str) -> Self {
        Self::Raw(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

impl WriteInput {
    /// Decode into a mapping.
    ///
    /// # Errors
    /// Returns `BadFormat` when raw bytes are not a JSON object.
    pub fn decode(self) -> BackendResult<Document> {
        match self {
            Self::Document(document) => Ok(document),
            Self::Raw(raw) => match serde_json::from_slice::<Value>(&raw) {
                Ok(Value::Object(document)) => Ok(document),
                Ok(other) => Err(BackendError::bad_format(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                ))),
                Err(e) => Err(BackendError::bad_format(format!(
                    "failed to decode record: {e}"
                ))),
            },
        }
    }
}

/// Write intent applied to every record of one write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Upsert
    Index,
    /// Insert, rejected on duplicate identifier
    #[default]
    Create,
    /// Overwrite an existing record
    Update,
    /// Remove by identifier
    Delete,
    /// Not supported by any engine
    Append,
}

impl Operation {
    /// Lowercase name, as used in logs and engine requests.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Append => "append",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Validated records
// =============================================================================

/// A record that passed bulk-write validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    /// Logical `id` field
    pub id: String,
    /// Parsed `timestamp`, absent only for deletes
    pub timestamp: Option<DateTime<Utc>>,
    /// Full mapping
    pub document: Document,
}

impl ValidatedRecord {
    /// Validate the mandatory fields for `operation`.
    ///
    /// Every operation requires a non-empty string `id`; all but `Delete`
    /// also require an RFC 3339 `timestamp`.
    ///
    /// # Errors
    /// Returns `BadFormat` naming the missing or invalid field.
    pub fn validate(document: Document, operation: Operation) -> BackendResult<Self> {
        let (id, timestamp) = Self::check(&document, operation)?;
        Ok(Self {
            id,
            timestamp,
            document,
        })
    }

    /// Check the mandatory fields without taking ownership.
    ///
    /// # Errors
    /// Same as [`ValidatedRecord::validate`].
    pub fn check(
        document: &Document,
        operation: Operation,
    ) -> BackendResult<(String, Option<DateTime<Utc>>)> {
        let id = match document.get(RECORD_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(BackendError::bad_format(
                    "field `id` must be a non-empty string",
                ))
            }
            None => return Err(BackendError::bad_format("missing mandatory field `id`")),
        };
        if id.len() > RECORD_ID_BYTES_MAX {
            return Err(BackendError::bad_format(format!(
                "field `id` exceeds {RECORD_ID_BYTES_MAX} bytes"
            )));
        }

        let timestamp = match document.get(RECORD_TIMESTAMP_FIELD) {
            Some(Value::String(raw)) => Some(parse_timestamp(raw).ok_or_else(|| {
                BackendError::bad_format(format!("field `timestamp` is not RFC 3339: {raw}"))
            })?),
            Some(_) => {
                return Err(BackendError::bad_format(
                    "field `timestamp` must be a string",
                ))
            }
            None if operation == Operation::Delete => None,
            None => {
                return Err(BackendError::bad_format(
                    "missing mandatory field `timestamp`",
                ))
            }
        };
        Ok((id, timestamp))
    }

    /// Content-derived identifier of this record.
    #[must_use]
    pub fn physical_id(&self) -> String {
        physical_id(&self.id)
    }
}

/// Stable identifier derived from a logical id.
///
/// Re-submitting the same logical record always yields the same value, so
/// duplicate creates surface as identifier conflicts.
#[must_use]
pub fn physical_id(logical_id: &str) -> String {
    let digest = Sha256::digest(logical_id.as_bytes());
    hex::encode(&digest[..RECORD_PHYSICAL_ID_BYTES])
}

/// Parse an RFC 3339 timestamp into UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical text form of a timestamp (UTC, microseconds).
#[must_use]
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Value at a dotted path inside a document.
#[must_use]
pub fn field_value<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
