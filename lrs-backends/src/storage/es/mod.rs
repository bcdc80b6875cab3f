//! `EsBackend` - Elasticsearch Adapter
//!
//! `TigerStyle`: Point-in-time snapshots, keyset paging, per-item bulk outcomes.
//!
//! # Paging
//!
//! The first page of a read opens a point in time (PIT) on the index; every
//! following page searches that PIT with `search_after` on the previous
//! hit's sort values. `_id` in the neutral sort becomes `_shard_doc`, which
//! is unique within a PIT. The PIT id travels in the cursor handle, so
//! `query_statements` continuations resume on the same snapshot. A cursor
//! without a PIT id is rejected: its `_shard_doc` value means nothing in a
//! fresh snapshot. An expired PIT surfaces as the engine's error message,
//! verbatim.

pub mod bulk;
pub mod translate;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{header, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter};
use lrs_core::pagination::{paged_stream, query_page, Page, PageRequest, PageSource};
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendError, BackendResult, BackendStatus, Document, ListEntry, NativeQuery,
    Operation, Query, Record, StatementQueryResult, StructuredQuery, ValidatedRecord,
    WriteInput, WriteOptions,
};

use self::bulk::{bulk_body, reconcile_bulk_response};
use self::translate::{native_sort, source_clause, EsTranslator};
use super::http::{self, Answer};
use super::{details, failed, read_chunk_size, validate_target};
use crate::config::EsSettings;

const ENGINE: &str = "es";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Document,
    #[serde(default)]
    sort: Vec<Value>,
}

impl SearchResponse {
    fn into_page(self, fallback_pit: String) -> Page {
        let records = self
            .hits
            .hits
            .into_iter()
            .map(|hit| Record::new(hit.id, hit.source).with_sort_values(hit.sort))
            .collect();
        Page {
            records,
            handle: Some(self.pit_id.unwrap_or(fallback_pit)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClusterHealth {
    status: String,
}

/// Probe outcome for a `_cluster/health` status.
///
/// Green is healthy; yellow is healthy only when `allow_yellow` is set.
#[must_use]
pub fn cluster_probe(status: &str, allow_yellow: bool) -> Probe {
    match status {
        "green" => Probe::Healthy,
        "yellow" if allow_yellow => Probe::Healthy,
        other => Probe::Degraded(format!("cluster health is {other}")),
    }
}

/// PIT to search for `request`; `None` opens a new one.
///
/// # Errors
/// Returns `Parameter` for a resume position without a PIT id.
fn snapshot_handle<'r>(request: &PageRequest<'r>) -> BackendResult<Option<&'r str>> {
    match request.after {
        Some(cursor) => cursor.handle.as_deref().map(Some).ok_or_else(|| {
            BackendError::parameter("es cursor needs the point-in-time id it was issued with")
        }),
        None => Ok(None),
    }
}

/// Index names of a `GET /<pattern>` answer, sorted.
fn index_names(body: &str) -> BackendResult<Vec<(String, Value)>> {
    let indices: serde_json::Map<String, Value> = serde_json::from_str(body)
        .map_err(|e| BackendError::engine(format!("unexpected index listing: {e}")))?;
    let mut names: Vec<(String, Value)> = indices.into_iter().collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(names)
}

// =============================================================================
// EsBackend
// =============================================================================

/// Elasticsearch engine over its REST API.
#[derive(Debug)]
pub struct EsBackend {
    client: reqwest::Client,
    settings: EsSettings,
    translator: EsTranslator,
    /// PITs opened by reads, released by `close`
    open_pits: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl EsBackend {
    /// Create a backend; no request is sent until the first operation.
    ///
    /// # Errors
    /// Returns `Engine` if the HTTP client cannot be built, `Parameter` if
    /// the default index name is invalid.
    pub fn new(settings: EsSettings) -> BackendResult<Self> {
        validate_target(&settings.index)?;
        let client = http::client(ENGINE, settings.request_timeout_secs)?;
        Ok(Self {
            client,
            translator: EsTranslator::new(settings.date_fields.clone()),
            settings,
            open_pits: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Settings this backend was built with.
    #[must_use]
    pub fn settings(&self) -> &EsSettings {
        &self.settings
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.settings.url.trim_end_matches('/'), path);
        let request = self.client.request(method, url);
        match &self.settings.username {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request,
        }
    }

    fn index<'t>(&'t self, target: Option<&'t str>) -> BackendResult<&'t str> {
        let index = target.unwrap_or(&self.settings.index);
        validate_target(index)?;
        Ok(index)
    }

    fn keep_alive(&self) -> String {
        format!("{}s", self.settings.pit_keep_alive_secs)
    }

    async fn open_pit(&self, index: &str) -> BackendResult<String> {
        let path = format!("{index}/_pit?keep_alive={}", self.keep_alive());
        let answer = http::send(ENGINE, self.request(Method::POST, &path)).await?;
        let pit: PitResponse = answer.json()?;
        tracing::debug!(index, "opened point in time");
        self.open_pits.lock().unwrap().insert(pit.id.clone());
        Ok(pit.id)
    }

    /// Run one PIT search; `body` carries everything but the PIT itself.
    async fn search(
        &self,
        index: &str,
        handle: Option<&str>,
        mut body: Document,
    ) -> BackendResult<Page> {
        let pit = match handle {
            Some(pit) => pit.to_string(),
            None => self.open_pit(index).await?,
        };
        body.insert(
            "pit".into(),
            json!({ "id": pit, "keep_alive": self.keep_alive() }),
        );
        body.insert("track_total_hits".into(), Value::Bool(false));

        let answer = http::send(
            ENGINE,
            self.request(Method::POST, "_search").json(&Value::Object(body)),
        )
        .await?;
        let response: SearchResponse = answer.json()?;
        Ok(response.into_page(pit))
    }

    async fn probe(&self) -> Probe {
        if self.closed.load(Ordering::SeqCst) {
            return Probe::Unreachable("backend closed".to_string());
        }
        if let Err(probe) = http::probe(ENGINE, self.request(Method::GET, "")).await {
            return probe;
        }
        let body = match http::probe(ENGINE, self.request(Method::GET, "_cluster/health")).await
        {
            Ok(body) => body,
            Err(probe) => return probe,
        };
        match serde_json::from_str::<ClusterHealth>(&body) {
            Ok(health) => cluster_probe(&health.status, self.settings.allow_yellow),
            Err(e) => Probe::Degraded(format!("unexpected cluster health: {e}")),
        }
    }

    fn read_native<'a>(
        &'a self,
        native: &'a NativeQuery,
        target: Option<&'a str>,
        chunk_size: usize,
    ) -> BoxStream<'a, BackendResult<Record>> {
        let prepared = EsTranslator::native_template(native)
            .and_then(|(template, size)| Ok((native_sort(&template)?, template, size)));
        let (sort, template, size) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return failed(e),
        };
        let search = NativeSearch {
            backend: self,
            template,
            sort,
        };
        let query = StructuredQuery {
            limit: size,
            ..Default::default()
        };
        paged_stream(search, query, target, chunk_size)
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl PageSource for EsBackend {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let index = self.index(request.target)?;
        let handle = snapshot_handle(&request)?;

        let mut body = Document::new();
        body.insert("size".into(), json!(request.size));
        body.insert(
            "query".into(),
            self.translator.query_clause(&request.query.filters)?,
        );
        body.insert(
            "sort".into(),
            Value::Array(self.translator.sort_clause(request.sort)),
        );
        if let Some(projection) = &request.query.projection {
            body.insert("_source".into(), source_clause(projection));
        }
        if let Some(after) = request.after {
            body.insert(
                "search_after".into(),
                Value::Array(after.sort_values.clone()),
            );
        }

        self.search(index, handle, body).await
    }
}

/// A native template paged like a structured query.
struct NativeSearch<'a> {
    backend: &'a EsBackend,
    template: Document,
    sort: Vec<Value>,
}

#[async_trait]
impl PageSource for NativeSearch<'_> {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let index = self.backend.index(request.target)?;
        let handle = snapshot_handle(&request)?;

        let mut body = self.template.clone();
        body.insert("size".into(), json!(request.size));
        body.insert("sort".into(), Value::Array(self.sort.clone()));
        if let Some(after) = request.after {
            body.insert(
                "search_after".into(),
                Value::Array(after.sort_values.clone()),
            );
        }

        self.backend.search(index, handle, body).await
    }
}

#[async_trait]
impl ChunkWriter for EsBackend {
    fn engine_name(&self) -> &'static str {
        ENGINE
    }

    fn supports(&self, operation: Operation) -> bool {
        operation != Operation::Append
    }

    async fn write_chunk(
        &self,
        target: Option<&str>,
        chunk: Vec<ValidatedRecord>,
        operation: Operation,
    ) -> BackendResult<ChunkReport> {
        let index = self.index(target)?;
        let body = bulk_body(index, &chunk, operation)?;

        let path = if self.settings.refresh {
            "_bulk?refresh=wait_for"
        } else {
            "_bulk"
        };
        let request = self
            .request(Method::POST, path)
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let answer: Answer = http::send(ENGINE, request).await?;
        let response = answer.into_success()?;
        reconcile_bulk_response(&chunk, &response)
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for EsBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn status(&self) -> BackendStatus {
        // Yellow is already folded into the probe.
        evaluate(ENGINE, self.probe().await, false)
    }

    fn list<'a>(
        &'a self,
        target: Option<&'a str>,
        with_details: bool,
        new: bool,
    ) -> BoxStream<'a, BackendResult<ListEntry>> {
        if new {
            tracing::warn!(engine = ENGINE, "`new` has no meaning for indices; ignored");
        }
        let listing = async move {
            let pattern = match target {
                Some(pattern) => pattern,
                None => "*",
            };
            let answer = http::send(ENGINE, self.request(Method::GET, pattern)).await?;
            let names = index_names(&answer.into_success()?)?;
            Ok::<_, BackendError>(names.into_iter().map(move |(name, info)| {
                Ok::<_, BackendError>(if with_details {
                    ListEntry::Details(details(&name, [("index", info)]))
                } else {
                    ListEntry::Name(name)
                })
            }))
        };
        stream::once(listing)
            .map(|listed| match listed {
                Ok(entries) => stream::iter(entries).boxed(),
                Err(e) => failed(e),
            })
            .flatten()
            .boxed()
    }

    #[tracing::instrument(skip(self, query))]
    fn read<'a>(
        &'a self,
        query: &'a Query,
        target: Option<&'a str>,
        chunk_size: Option<usize>,
    ) -> BoxStream<'a, BackendResult<Record>> {
        let chunk_size = read_chunk_size(chunk_size);
        match query {
            Query::Structured(structured) => {
                if let Err(e) = structured.validate() {
                    return failed(e);
                }
                paged_stream(self, structured, target, chunk_size)
            }
            Query::Native(native) => self.read_native(native, target, chunk_size),
        }
    }

    async fn write(
        &self,
        data: BoxStream<'_, WriteInput>,
        options: &WriteOptions,
    ) -> BackendResult<usize> {
        write_all(self, data, options).await
    }

    async fn query_statements(
        &self,
        query: &StructuredQuery,
        target: Option<&str>,
    ) -> BackendResult<StatementQueryResult> {
        query.validate()?;
        let chunk = query.limit.unwrap_or_else(|| read_chunk_size(None));
        query_page(self, query, target, chunk).await
    }

    async fn close(&self) -> BackendResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pits: Vec<String> = self.open_pits.lock().unwrap().drain().collect();
        for pit in pits {
            let request = self
                .request(Method::DELETE, "_pit")
                .json(&json!({ "id": pit }));
            // Expired PITs are already gone on the engine side.
            if let Err(e) = http::send(ENGINE, request).await {
                tracing::warn!(engine = ENGINE, error = %e, "failed to release point in time");
            }
        }
        Ok(())
    }
}
