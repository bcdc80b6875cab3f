//! `ClickHouseBackend` - Columnar Event Table over the HTTP Interface
//!
//! `TigerStyle`: Stateless HTTP, typed parameters, explicit duplicate checks.
//!
//! Every statement is one `POST` with the SQL in the body and parameters
//! as `param_<name>` URL pairs. Results come back as `JSONEachRow`.
//!
//! The engine has no unique constraint, so both writes look up the chunk's
//! ids first. `Create` refuses ids already stored or repeated in the chunk.
//! `Index` replaces: stored rows of the chunk's ids are deleted (a
//! synchronous mutation) and only the last occurrence of each id is
//! inserted, so an event id never has two rows. Updates and deletes are
//! not supported.

pub mod translate;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind};
use lrs_core::eval::sort_tuple;
use lrs_core::pagination::{paged_stream, query_page, Page, PageRequest, PageSource};
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendError, BackendResult, BackendStatus, Document, ListEntry, Operation, Query,
    Record, StatementQueryResult, StructuredQuery, ValidatedRecord, WriteInput, WriteOptions,
};

use self::translate::{
    delete_existing, format_datetime, insert_statement, qualified_table, quote_identifier,
    select_existing, ChQuery, NativeCh,
};
use super::http;
use super::{failed, read_chunk_size};
use crate::config::ClickHouseSettings;

const ENGINE: &str = "clickhouse";

#[derive(Debug, Deserialize)]
struct EventRow {
    event_id: String,
    event: String,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    event_id: String,
}

/// Parse a `JSONEachRow` body.
fn each_row<T: DeserializeOwned>(body: &str) -> BackendResult<Vec<T>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| BackendError::engine(format!("unexpected clickhouse row: {e}")))
        })
        .collect()
}

fn event_document(row: EventRow) -> BackendResult<(String, Document)> {
    let document: Document = serde_json::from_str(&row.event).map_err(|e| {
        BackendError::engine(format!("event {} is not a JSON object: {e}", row.event_id))
    })?;
    Ok((row.event_id, document))
}

/// One `JSONEachRow` line for an insert.
fn insert_row(event_id: &str, record: &ValidatedRecord) -> BackendResult<String> {
    let timestamp = record.timestamp.ok_or_else(|| {
        BackendError::bad_format(format!("record {} has no timestamp", record.id))
    })?;
    let row = json!({
        "event_id": event_id,
        "emission_time": format_datetime(&timestamp),
        "event": serde_json::to_string(&record.document)?,
    });
    Ok(row.to_string())
}

/// Rows one chunk turns into.
#[derive(Debug, Default)]
struct InsertPlan {
    /// `JSONEachRow` lines to insert
    rows: Vec<String>,
    /// Stored ids to delete before inserting
    replaced: Vec<String>,
    /// Records the chunk accounts as written
    applied: usize,
    rejected: Vec<Rejection>,
}

/// Plan a chunk of `(event id, record)` pairs against the ids already stored.
fn plan_insert(
    operation: Operation,
    candidates: Vec<(String, ValidatedRecord)>,
    existing: &HashSet<String>,
) -> BackendResult<InsertPlan> {
    let mut plan = InsertPlan::default();
    if operation == Operation::Index {
        // Last write wins within the chunk.
        let mut seen = HashSet::new();
        let mut latest: Vec<&(String, ValidatedRecord)> = candidates
            .iter()
            .rev()
            .filter(|(id, _)| seen.insert(id.as_str()))
            .collect();
        latest.reverse();
        for (id, record) in latest {
            plan.rows.push(insert_row(id, record)?);
        }
        plan.replaced = existing.iter().cloned().collect();
        plan.replaced.sort();
        plan.applied = candidates.len();
        return Ok(plan);
    }

    let mut seen = HashSet::new();
    for (id, record) in candidates {
        if existing.contains(&id) || !seen.insert(id.clone()) {
            plan.rejected.push(Rejection::new(
                record.id,
                RejectionKind::Duplicate,
                "event already exists",
            ));
            continue;
        }
        plan.rows.push(insert_row(&id, &record)?);
        plan.applied += 1;
    }
    Ok(plan)
}

// =============================================================================
// ClickHouseBackend
// =============================================================================

/// ClickHouse engine.
#[derive(Debug)]
pub struct ClickHouseBackend {
    client: reqwest::Client,
    settings: ClickHouseSettings,
    closed: AtomicBool,
}

impl ClickHouseBackend {
    /// Create a backend; no request is sent until the first operation.
    ///
    /// # Errors
    /// Returns `Parameter` for invalid database or table names, `Engine` if
    /// the HTTP client cannot be built.
    pub fn new(settings: ClickHouseSettings) -> BackendResult<Self> {
        qualified_table(&settings.database, &settings.table)?;
        let client = http::client(ENGINE, settings.request_timeout_secs)?;
        Ok(Self {
            client,
            settings,
            closed: AtomicBool::new(false),
        })
    }

    fn request(&self) -> RequestBuilder {
        let request = self.client.post(&self.settings.url).query(&[
            ("database", self.settings.database.as_str()),
            ("date_time_input_format", "best_effort"),
        ]);
        match &self.settings.username {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request,
        }
    }

    fn table(&self, target: Option<&str>) -> BackendResult<String> {
        qualified_table(
            &self.settings.database,
            target.unwrap_or(&self.settings.table),
        )
    }

    async fn execute(&self, query: &ChQuery) -> BackendResult<String> {
        let request = self
            .request()
            .query(&query.url_params())
            .body(query.sql.clone());
        http::send(ENGINE, request).await?.into_success()
    }

    async fn fetch(&self, query: &ChQuery) -> BackendResult<Vec<(String, Document)>> {
        let body = self.execute(query).await?;
        each_row::<EventRow>(&body)?
            .into_iter()
            .map(event_document)
            .collect()
    }

    async fn existing_ids(&self, table: &str, ids: &[String]) -> BackendResult<HashSet<String>> {
        let body = self.execute(&select_existing(table, ids)).await?;
        Ok(each_row::<IdRow>(&body)?
            .into_iter()
            .map(|row| row.event_id)
            .collect())
    }

    async fn probe(&self) -> Probe {
        if self.closed.load(Ordering::SeqCst) {
            return Probe::Unreachable("backend closed".to_string());
        }
        let ping = format!("{}/ping", self.settings.url.trim_end_matches('/'));
        if let Err(probe) = http::probe(ENGINE, self.client.get(ping)).await {
            return probe;
        }
        let select = ChQuery {
            sql: "SELECT 1".to_string(),
            params: Vec::new(),
        };
        match self.execute(&select).await {
            Ok(_) => Probe::Healthy,
            Err(e) => Probe::Unreachable(e.to_string()),
        }
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl PageSource for ClickHouseBackend {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let table = self.table(request.target)?;
        let query = translate::select_page(
            &table,
            request.query,
            request.sort,
            request.after,
            request.size,
        )?;
        let records = self
            .fetch(&query)
            .await?
            .into_iter()
            .map(|(id, document)| {
                let sort_values = sort_tuple(&id, &document, request.sort);
                let document = match &request.query.projection {
                    Some(projection) => projection.apply(document),
                    None => document,
                };
                Record::new(id, document).with_sort_values(sort_values)
            })
            .collect();
        Ok(Page {
            records,
            handle: None,
        })
    }
}

/// A native query paged by offset; the offset travels in the handle.
struct NativeRead<'a> {
    backend: &'a ClickHouseBackend,
    native: NativeCh,
}

#[async_trait]
impl PageSource for NativeRead<'_> {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let table = self.backend.table(request.target)?;
        let offset = match request.handle() {
            Some(handle) => handle.parse::<usize>().map_err(|_| {
                BackendError::parameter(format!("invalid clickhouse page handle `{handle}`"))
            })?,
            None => 0,
        };
        let query = self.native.select_page(&table, offset, request.size);
        let records: Vec<Record> = self
            .backend
            .fetch(&query)
            .await?
            .into_iter()
            .map(|(id, document)| Record::new(id, document))
            .collect();
        Ok(Page {
            handle: Some((offset + records.len()).to_string()),
            records,
        })
    }
}

#[async_trait]
impl ChunkWriter for ClickHouseBackend {
    fn engine_name(&self) -> &'static str {
        ENGINE
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Index)
    }

    async fn write_chunk(
        &self,
        target: Option<&str>,
        chunk: Vec<ValidatedRecord>,
        operation: Operation,
    ) -> BackendResult<ChunkReport> {
        let table = self.table(target)?;
        let mut report = ChunkReport::default();

        let mut candidates = Vec::with_capacity(chunk.len());
        for record in chunk {
            match Uuid::parse_str(&record.id) {
                Ok(id) => candidates.push((id.hyphenated().to_string(), record)),
                Err(e) => report.push_rejected(Rejection::new(
                    record.id,
                    RejectionKind::Other,
                    format!("event id must be a UUID: {e}"),
                )),
            }
        }

        let existing = if candidates.is_empty() {
            HashSet::new()
        } else {
            let ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
            self.existing_ids(&table, &ids).await?
        };

        let plan = plan_insert(operation, candidates, &existing)?;
        for rejection in plan.rejected {
            report.push_rejected(rejection);
        }
        if !plan.replaced.is_empty() {
            let query = delete_existing(&table, &plan.replaced);
            let request = self
                .request()
                .query(&[("mutations_sync", "2")])
                .query(&query.url_params())
                .body(query.sql);
            http::send(ENGINE, request).await?.into_success()?;
            tracing::debug!(replaced = plan.replaced.len(), "deleted rows before re-index");
        }
        if !plan.rows.is_empty() {
            let request = self
                .request()
                .query(&[("query", insert_statement(&table))])
                .body(plan.rows.join("\n"));
            http::send(ENGINE, request).await?.into_success()?;
            report.applied += plan.applied;
        }
        Ok(report)
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for ClickHouseBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn status(&self) -> BackendStatus {
        evaluate(ENGINE, self.probe().await, false)
    }

    /// Tables of `target` (a database; the configured one when `None`).
    fn list<'a>(
        &'a self,
        target: Option<&'a str>,
        with_details: bool,
        new: bool,
    ) -> BoxStream<'a, BackendResult<ListEntry>> {
        if new {
            tracing::warn!(engine = ENGINE, "`new` has no meaning for tables; ignored");
        }
        let listing = async move {
            let database = quote_identifier(target.unwrap_or(&self.settings.database))?;
            let query = ChQuery {
                sql: format!("SHOW TABLES FROM {database} FORMAT JSONEachRow"),
                params: Vec::new(),
            };
            let body = self.execute(&query).await?;
            each_row::<Document>(&body)?
                .into_iter()
                .map(|row| {
                    if with_details {
                        return Ok(ListEntry::Details(row));
                    }
                    row.get("name")
                        .and_then(Value::as_str)
                        .map(|name| ListEntry::Name(name.to_string()))
                        .ok_or_else(|| BackendError::engine("table row without a name"))
                })
                .collect::<BackendResult<Vec<ListEntry>>>()
        };
        stream::once(listing)
            .map(|listed| match listed {
                Ok(entries) => stream::iter(entries.into_iter().map(Ok::<_, BackendError>)).boxed(),
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
            Query::Native(native) => {
                let native = match NativeCh::parse(native) {
                    Ok(native) => native,
                    Err(e) => return failed(e),
                };
                let query = StructuredQuery {
                    limit: native.limit,
                    ..Default::default()
                };
                let source = NativeRead {
                    backend: self,
                    native,
                };
                paged_stream(source, query, target, chunk_size)
            }
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
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "8f9c7b2e-63a1-4d4e-9a53-5b1f1c0d2e3f";

    fn record(id: &str) -> ValidatedRecord {
        let mut document = Document::new();
        document.insert("id".into(), json!(id));
        document.insert("timestamp".into(), json!("2024-01-01T10:00:00.5Z"));
        ValidatedRecord::validate(document, Operation::Create).unwrap()
    }

    #[test]
    fn test_each_row_skips_blank_lines() {
        let body = format!("{{\"event_id\":\"{ID}\",\"event\":\"{{\\\"id\\\":1}}\"}}\n\n");
        let rows: Vec<EventRow> = each_row(&body).unwrap();
        assert_eq!(rows.len(), 1);
        let (id, document) = event_document(rows.into_iter().next().unwrap()).unwrap();
        assert_eq!(id, ID);
        assert_eq!(document["id"], json!(1));

        assert!(each_row::<IdRow>("not json").is_err());
    }

    #[test]
    fn test_insert_row() {
        let row: Value = serde_json::from_str(&insert_row(ID, &record(ID)).unwrap()).unwrap();
        assert_eq!(row["event_id"], ID);
        assert_eq!(row["emission_time"], "2024-01-01 10:00:00.500000");
        let event: Document = serde_json::from_str(row["event"].as_str().unwrap()).unwrap();
        assert_eq!(event["id"], json!(ID));
    }

    #[test]
    fn test_index_plan_replaces_and_keeps_last() {
        let other = "0b7f5a8e-1c2d-4e3f-8a9b-0c1d2e3f4a5b";
        let mut second = record(ID);
        second.document.insert("n".into(), json!(2));
        let candidates = vec![
            (ID.to_string(), record(ID)),
            (other.to_string(), record(other)),
            (ID.to_string(), second),
        ];
        let existing: HashSet<String> = [ID.to_string()].into_iter().collect();

        let plan = plan_insert(Operation::Index, candidates, &existing).unwrap();
        assert_eq!(plan.applied, 3);
        assert_eq!(plan.replaced, vec![ID.to_string()]);
        assert_eq!(plan.rows.len(), 2);
        let last: Value = serde_json::from_str(&plan.rows[1]).unwrap();
        assert_eq!(last["event_id"], ID);
        assert!(last["event"].as_str().unwrap().contains("\"n\":2"));
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_create_plan_rejects_stored_and_repeated() {
        let other = "0b7f5a8e-1c2d-4e3f-8a9b-0c1d2e3f4a5b";
        let candidates = vec![
            (ID.to_string(), record(ID)),
            (other.to_string(), record(other)),
            (other.to_string(), record(other)),
        ];
        let existing: HashSet<String> = [ID.to_string()].into_iter().collect();

        let plan = plan_insert(Operation::Create, candidates, &existing).unwrap();
        assert_eq!(plan.applied, 1);
        assert_eq!(plan.rows.len(), 1);
        assert!(plan.replaced.is_empty());
        assert_eq!(plan.rejected.len(), 2);
        assert!(plan
            .rejected
            .iter()
            .all(|r| r.kind == RejectionKind::Duplicate));
    }

    #[test]
    fn test_new_rejects_bad_table() {
        let settings = ClickHouseSettings::default().with_table("events; DROP");
        assert!(ClickHouseBackend::new(settings).unwrap_err().is_parameter());
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let backend = ClickHouseBackend::new(ClickHouseSettings::default()).unwrap();
        assert!(backend.supports(Operation::Create));
        assert!(backend.supports(Operation::Index));
        assert!(!backend.supports(Operation::Delete));

        let options = WriteOptions::default().with_operation(Operation::Update);
        let err = backend
            .write(stream::empty().boxed(), &options)
            .await
            .unwrap_err();
        assert!(err.is_parameter());
    }

    #[tokio::test]
    async fn test_non_uuid_ids_rejected_without_request() {
        let settings = ClickHouseSettings::default().with_url("http://127.0.0.1:9");
        let backend = ClickHouseBackend::new(settings).unwrap();
        let report = backend
            .write_chunk(None, vec![record("not-a-uuid")], Operation::Index)
            .await
            .unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.rejected[0].kind, RejectionKind::Other);
    }

    #[tokio::test]
    async fn test_unreachable_is_away() {
        let settings = ClickHouseSettings::default().with_url("http://127.0.0.1:9");
        let backend = ClickHouseBackend::new(settings).unwrap();
        assert_eq!(backend.status().await, BackendStatus::Away);
    }

    /// Skip test if no ClickHouse is available.
    macro_rules! require_clickhouse {
        () => {
            match std::env::var("TEST_CLICKHOUSE_URL") {
                Ok(url) => url,
                Err(_) => {
                    eprintln!("Skipping test: TEST_CLICKHOUSE_URL not set");
                    return;
                }
            }
        };
    }

    #[tokio::test]
    async fn test_clickhouse_index_twice_keeps_one_row() {
        let url = require_clickhouse!();
        let table = format!("lrs_test_{}", Uuid::new_v4().simple());
        let settings = ClickHouseSettings::default()
            .with_url(url)
            .with_database("default")
            .with_table(table.clone());
        let backend = ClickHouseBackend::new(settings).unwrap();
        let qualified = backend.table(None).unwrap();
        backend
            .execute(&ChQuery {
                sql: format!(
                    "CREATE TABLE {qualified} (event_id UUID, emission_time DateTime64(6), \
                     event String) ENGINE = MergeTree ORDER BY (emission_time, event_id)"
                ),
                params: Vec::new(),
            })
            .await
            .unwrap();

        let other = "0b7f5a8e-1c2d-4e3f-8a9b-0c1d2e3f4a5b";
        let index = WriteOptions::default().with_operation(Operation::Index);
        for _ in 0..2 {
            let inputs = vec![
                WriteInput::Document(record(ID).document),
                WriteInput::Document(record(other).document),
            ];
            let written = backend
                .write(stream::iter(inputs).boxed(), &index)
                .await
                .unwrap();
            assert_eq!(written, 2);
        }

        let query = StructuredQuery {
            sort: vec![lrs_core::SortKey::new("timestamp", lrs_core::Direction::Asc)],
            limit: Some(1),
            ..Default::default()
        };
        let mut ids = Vec::new();
        let mut page = backend.query_statements(&query, None).await.unwrap();
        loop {
            ids.extend(page.records.iter().map(|r| r.id.clone()));
            match page.next_cursor {
                Some(cursor) => {
                    page = backend
                        .query_statements(&query.after(cursor), None)
                        .await
                        .unwrap();
                }
                None => break,
            }
        }
        ids.sort();
        assert_eq!(ids, vec![other.to_string(), ID.to_string()]);

        backend
            .execute(&ChQuery {
                sql: format!("DROP TABLE {qualified}"),
                params: Vec::new(),
            })
            .await
            .unwrap();
    }
}
