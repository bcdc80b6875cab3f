//! Cursor - Opaque Continuation Token
//!
//! `TigerStyle`: Typed internally, two strings at the boundary.
//!
//! The sort tuple is serialized as the `|`-joined, URL-safe base64 (no
//! padding) encoding of each value's JSON. The engine handle, when present,
//! passes through untouched.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    CURSOR_HANDLE_BYTES_MAX, CURSOR_SEPARATOR, CURSOR_SORT_TUPLE_BYTES_MAX,
    CURSOR_SORT_VALUES_COUNT_MAX,
};
use crate::error::{BackendError, BackendResult};

/// Continuation state of a paged query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    /// Sort-key values of the last record of the previous page
    pub sort_values: Vec<Value>,
    /// Engine execution-context handle (e.g. a point in time id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl Cursor {
    /// Create a cursor from a sort tuple.
    #[must_use]
    pub fn new(sort_values: Vec<Value>) -> Self {
        Self {
            sort_values,
            handle: None,
        }
    }

    /// Attach an engine handle.
    #[must_use]
    pub fn with_handle(mut self, handle: Option<String>) -> Self {
        self.handle = handle;
        self
    }

    /// Serialized sort tuple.
    #[must_use]
    pub fn sort_tuple(&self) -> String {
        let mut out = String::new();
        for (i, value) in self.sort_values.iter().enumerate() {
            if i > 0 {
                out.push(CURSOR_SEPARATOR);
            }
            // Serializing a `Value` cannot fail.
            let json = serde_json::to_vec(value).unwrap_or_default();
            out.push_str(&URL_SAFE_NO_PAD.encode(json));
        }
        out
    }

    /// Split into the two boundary strings: sort tuple and optional handle.
    #[must_use]
    pub fn to_parts(&self) -> (String, Option<String>) {
        (self.sort_tuple(), self.handle.clone())
    }

    /// Rebuild a cursor previously emitted by [`Cursor::to_parts`].
    ///
    /// # Errors
    /// Returns `Parameter` when the tuple is malformed or exceeds limits.
    pub fn from_parts(sort_tuple: &str, handle: Option<&str>) -> BackendResult<Self> {
        if sort_tuple.is_empty() {
            return Err(BackendError::parameter("cursor sort tuple is empty"));
        }
        if sort_tuple.len() > CURSOR_SORT_TUPLE_BYTES_MAX {
            return Err(BackendError::parameter(format!(
                "cursor sort tuple exceeds {CURSOR_SORT_TUPLE_BYTES_MAX} bytes"
            )));
        }

        let sort_values = sort_tuple
            .split(CURSOR_SEPARATOR)
            .map(decode_component)
            .collect::<BackendResult<Vec<_>>>()?;
        if sort_values.len() > CURSOR_SORT_VALUES_COUNT_MAX {
            return Err(BackendError::parameter(format!(
                "cursor carries {} sort values, at most {CURSOR_SORT_VALUES_COUNT_MAX} allowed",
                sort_values.len()
            )));
        }

        let handle = match handle {
            Some(h) if h.is_empty() => None,
            Some(h) if h.len() > CURSOR_HANDLE_BYTES_MAX => {
                return Err(BackendError::parameter(format!(
                    "cursor handle exceeds {CURSOR_HANDLE_BYTES_MAX} bytes"
                )))
            }
            Some(h) => Some(h.to_string()),
            None => None,
        };

        Ok(Self {
            sort_values,
            handle,
        })
    }
}

fn decode_component(component: &str) -> BackendResult<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(component)
        .map_err(|e| BackendError::parameter(format!("invalid cursor component: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BackendError::parameter(format!("invalid cursor component: {e}")))
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sort_tuple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parts_round_trip_with_handle() {
        let cursor = Cursor::new(vec![json!(1_704_067_200_000_u64), json!("a|b c"), json!(null)])
            .with_handle(Some("pit-46ToAwMDaWR5BXV1aWQy".to_string()));

        let (tuple, handle) = cursor.to_parts();
        assert_eq!(tuple.matches('|').count(), 2);

        let parsed = Cursor::from_parts(&tuple, handle.as_deref()).unwrap();
        assert_eq!(parsed, cursor);
    }

    #[test]
    fn test_sort_tuple_is_url_safe() {
        let cursor = Cursor::new(vec![json!("2024-01-01T00:00:00+00:00"), json!("?&=/+")]);
        let tuple = cursor.sort_tuple();
        assert!(tuple
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '|'));
    }

    #[test]
    fn test_empty_handle_is_absent() {
        let parsed = Cursor::from_parts("MQ", Some("")).unwrap();
        assert_eq!(parsed.sort_values, vec![json!(1)]);
        assert!(parsed.handle.is_none());
    }

    #[test]
    fn test_malformed_tuple_is_parameter_error() {
        assert!(Cursor::from_parts("", None).unwrap_err().is_parameter());
        assert!(Cursor::from_parts("!!!", None).unwrap_err().is_parameter());
        // valid base64 of invalid JSON
        let bogus = URL_SAFE_NO_PAD.encode("{oops");
        assert!(Cursor::from_parts(&bogus, None).unwrap_err().is_parameter());
    }

    #[test]
    fn test_too_many_components_rejected() {
        let tuple = vec!["MQ"; CURSOR_SORT_VALUES_COUNT_MAX + 1].join("|");
        let err = Cursor::from_parts(&tuple, None).unwrap_err();
        assert!(err.to_string().contains("sort values"));
    }
}
