//! Storage - Engine Adapters
//!
//! TigerStyle: One contract, independent adapters, simulation-first testing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  lrs_core::Backend Trait                     │
//! └─────────────────────────────────────────────────────────────┘
//!      ↑           ↑             ↑            ↑           ↑
//! ┌────┴────┐ ┌────┴─────┐ ┌─────┴──────┐ ┌───┴────┐ ┌────┴─────┐
//! │SimBack. │ │EsBackend │ │ Postgres / │ │  Fs /  │ │WsBackend │
//! │(testing)│ │ (search) │ │ ClickHouse │ │ Object │ │ (stream) │
//! └─────────┘ └──────────┘ └────────────┘ └────────┘ └──────────┘
//! ```
//!
//! Engines with a query language translate the neutral query; the others
//! evaluate it in memory through `lrs_core::eval`.

pub mod clickhouse;
pub mod es;
mod fs;
mod http;
mod object;
pub mod postgres;
mod sim;
mod ws;

use std::borrow::Cow;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use lrs_core::constants::{
    BACKEND_READ_CHUNK_SIZE_DEFAULT, BACKEND_READ_CHUNK_SIZE_MAX, BACKEND_TARGET_BYTES_MAX,
};
use lrs_core::{
    BackendError, BackendResult, Comparison, Document, Filter, NativeQuery, Query,
    StructuredQuery,
};

pub use clickhouse::ClickHouseBackend;
pub use es::EsBackend;
pub use fs::FsBackend;
pub use object::ObjectStoreBackend;
pub use sim::SimBackend;
pub use ws::WsBackend;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

// =============================================================================
// Shared helpers
// =============================================================================

/// A stream that yields `err` once.
pub(crate) fn failed<'a, T: Send + 'a>(err: BackendError) -> BoxStream<'a, BackendResult<T>> {
    stream::once(async move { Err(err) }).boxed()
}

/// Records fetched per underlying call.
pub(crate) fn read_chunk_size(requested: Option<usize>) -> usize {
    requested
        .filter(|&size| size > 0)
        .unwrap_or(BACKEND_READ_CHUNK_SIZE_DEFAULT)
        .min(BACKEND_READ_CHUNK_SIZE_MAX)
}

/// Reject target names that could escape their namespace.
///
/// Allowed: ASCII letters, digits, `_`, `-`, `.`, and `/` between
/// segments. No `..` segment, no leading `/`.
pub(crate) fn validate_target(target: &str) -> BackendResult<()> {
    if target.is_empty() || target.len() > BACKEND_TARGET_BYTES_MAX {
        return Err(BackendError::parameter(format!(
            "target must be 1 to {BACKEND_TARGET_BYTES_MAX} bytes"
        )));
    }
    let charset_ok = target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'));
    let segments_ok = target
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if !charset_ok || !segments_ok {
        return Err(BackendError::parameter(format!("invalid target `{target}`")));
    }
    Ok(())
}

/// Structured form of a query for engines that evaluate in memory.
///
/// A native object is an exact-match template: each key must equal its
/// value. Native text has no meaning for these engines.
pub(crate) fn local_query<'a>(
    engine: &str,
    query: &'a Query,
) -> BackendResult<Cow<'a, StructuredQuery>> {
    match query {
        Query::Structured(structured) => Ok(Cow::Borrowed(structured)),
        Query::Native(NativeQuery::Object(template)) => {
            let filters = template
                .iter()
                .map(|(field, value)| Filter::new(field.clone(), Comparison::Eq(value.clone())))
                .collect();
            let structured = StructuredQuery {
                filters,
                ..Default::default()
            };
            structured.validate()?;
            Ok(Cow::Owned(structured))
        }
        Query::Native(NativeQuery::Text(_)) => Err(BackendError::parameter(format!(
            "{engine} does not accept text queries"
        ))),
    }
}

/// `{"name": ..., <extra>...}` details mapping for `list`.
pub(crate) fn details(
    name: &str,
    extra: impl IntoIterator<Item = (&'static str, Value)>,
) -> Document {
    let mut details = Document::new();
    details.insert("name".into(), Value::String(name.to_string()));
    for (key, value) in extra {
        details.insert(key.into(), value);
    }
    details
}
