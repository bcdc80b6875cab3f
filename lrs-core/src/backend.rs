//! Backend - The Contract Every Engine Implements
//!
//! `TigerStyle`: One interface, independent adapters, shared algorithms.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Backend Trait                          │
//! │   read · write · list · status · close · query_statements     │
//! └──────────────────────────────────────────────────────────────┘
//!        │ composes                         │ composes
//! ┌──────┴──────────┐              ┌────────┴────────┐
//! │ pagination      │              │ bulk            │
//! │ (PageSource)    │              │ (ChunkWriter)   │
//! └─────────────────┘              └─────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::bulk::WriteOptions;
use crate::constants::{QUERY_IDS_CHUNK_SIZE_COUNT_MAX, RECORD_ID_FIELD};
use crate::error::BackendResult;
use crate::pagination::StatementQueryResult;
use crate::query::{Comparison, Filter, Query, StructuredQuery};
use crate::record::{Document, Record, WriteInput};
use crate::status::BackendStatus;

/// One item produced by `list`.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEntry {
    /// Target identifier
    Name(String),
    /// Engine-specific details about a target
    Details(Document),
}

impl ListEntry {
    /// Target identifier, when the entry is a name or details carry one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Details(details) => details.get("name").and_then(Value::as_str),
        }
    }
}

/// Storage engine adapter.
///
/// Reads return lazy, forward-only streams; dropping one before the end
/// is allowed and leaves engine-side contexts to `close` or engine timeouts.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Engine name.
    fn name(&self) -> &'static str;

    /// Probe the engine. Never fails: unreachable engines are `Away`.
    async fn status(&self) -> BackendStatus;

    /// Enumerate targets (indices, tables, files, prefixes).
    ///
    /// With `new`, targets already read through this instance are skipped.
    fn list<'a>(
        &'a self,
        target: Option<&'a str>,
        details: bool,
        new: bool,
    ) -> BoxStream<'a, BackendResult<ListEntry>>;

    /// Stream records matching `query`, fetching `chunk_size` per call.
    fn read<'a>(
        &'a self,
        query: &'a Query,
        target: Option<&'a str>,
        chunk_size: Option<usize>,
    ) -> BoxStream<'a, BackendResult<Record>>;

    /// Stream records as one JSON line each.
    fn read_raw<'a>(
        &'a self,
        query: &'a Query,
        target: Option<&'a str>,
        chunk_size: Option<usize>,
    ) -> BoxStream<'a, BackendResult<Bytes>> {
        self.read(query, target, chunk_size)
            .and_then(|record| async move { record.to_json_line() })
            .boxed()
    }

    /// Write records; returns how many the engine applied.
    async fn write(
        &self,
        data: BoxStream<'_, WriteInput>,
        options: &WriteOptions,
    ) -> BackendResult<usize>;

    /// Fetch one page of statements with a continuation cursor.
    async fn query_statements(
        &self,
        query: &StructuredQuery,
        target: Option<&str>,
    ) -> BackendResult<StatementQueryResult>;

    /// Fetch statements by logical id, in chunks of bounded size.
    async fn query_statements_by_ids(
        &self,
        ids: &[String],
        target: Option<&str>,
    ) -> BackendResult<Vec<Record>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(QUERY_IDS_CHUNK_SIZE_COUNT_MAX) {
            let query = Query::Structured(StructuredQuery {
                filters: vec![Filter::new(
                    RECORD_ID_FIELD,
                    Comparison::In(chunk.iter().cloned().map(Value::String).collect()),
                )],
                ..Default::default()
            });
            let found: Vec<Record> = self.read(&query, target, None).try_collect().await?;
            records.extend(found);
        }
        Ok(records)
    }

    /// Release resources. Idempotent.
    async fn close(&self) -> BackendResult<()>;
}
