//! `PostgresBackend` - Document Table Storage
//!
//! `TigerStyle`: Connection pooling, explicit schema, bulk writes via `UNNEST`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PostgresBackend                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pool: sqlx::PgPool (connection pooling)                     │
//! │  Table per target: doc_id, statement_id, emission_time, doc  │
//! │  Reads: keyset pages from translate::select_page             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind};
use lrs_core::eval::sort_tuple;
use lrs_core::pagination::{paged_stream, query_page, Page, PageRequest, PageSource};
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendError, BackendResult, BackendStatus, Document, ListEntry, Operation, Query,
    Record, StatementQueryResult, StructuredQuery, ValidatedRecord, WriteInput, WriteOptions,
};

use super::translate::{self, create_table, quote_table, write_statement, NativeSql, SqlParam, SqlQuery};
use crate::config::PostgresSettings;
use crate::constants::POSTGRES_DOC_ID_COLUMN;
use crate::storage::{details, failed, read_chunk_size};

const ENGINE: &str = "postgres";

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

// =============================================================================
// Helpers
// =============================================================================

fn sql_error(err: &sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => BackendError::connection(format!("{ENGINE}: {err}")),
        other => BackendError::engine(other.to_string()),
    }
}

fn bind_all(sql: &SqlQuery) -> PgQuery<'_> {
    sql.params
        .iter()
        .fold(sqlx::query(&sql.sql), |query, param| match param {
            SqlParam::Text(text) => query.bind(text.clone()),
            SqlParam::Json(value) => query.bind(value.clone()),
            SqlParam::TextArray(items) => query.bind(items.clone()),
            SqlParam::JsonArray(items) => query.bind(items.clone()),
            SqlParam::Timestamp(ts) => query.bind(*ts),
            SqlParam::Int(n) => query.bind(*n),
        })
}

fn row_to_document(row: &PgRow) -> BackendResult<(String, Document)> {
    let id: String = row
        .try_get(POSTGRES_DOC_ID_COLUMN)
        .map_err(|e| BackendError::engine(e.to_string()))?;
    let document: Value = row
        .try_get("document")
        .map_err(|e| BackendError::engine(e.to_string()))?;
    match document {
        Value::Object(document) => Ok((id, document)),
        other => Err(BackendError::engine(format!(
            "stored document {id} is not an object: {other}"
        ))),
    }
}

/// The last occurrence of each physical id, in chunk order.
fn latest_per_id(chunk: &[ValidatedRecord]) -> Vec<&ValidatedRecord> {
    let mut seen = HashSet::new();
    let mut latest: Vec<&ValidatedRecord> = chunk
        .iter()
        .rev()
        .filter(|record| seen.insert(record.physical_id()))
        .collect();
    latest.reverse();
    latest
}

/// Parallel column arrays for `UNNEST`.
#[derive(Default)]
struct Rows {
    doc_ids: Vec<String>,
    statement_ids: Vec<String>,
    emission_times: Vec<DateTime<Utc>>,
    documents: Vec<Value>,
}

impl Rows {
    fn from_records<'r>(records: impl IntoIterator<Item = &'r ValidatedRecord>) -> BackendResult<Self> {
        let mut rows = Self::default();
        for record in records {
            let timestamp = record.timestamp.ok_or_else(|| {
                BackendError::bad_format(format!("record {} has no timestamp", record.id))
            })?;
            rows.doc_ids.push(record.physical_id());
            rows.statement_ids.push(record.id.clone());
            rows.emission_times.push(timestamp);
            rows.documents.push(Value::Object(record.document.clone()));
        }
        Ok(rows)
    }

    fn bind(self, statement: &str) -> PgQuery<'_> {
        sqlx::query(statement)
            .bind(self.doc_ids)
            .bind(self.statement_ids)
            .bind(self.emission_times)
            .bind(self.documents)
    }
}

// =============================================================================
// PostgresBackend
// =============================================================================

/// PostgreSQL storage backend.
///
/// `TigerStyle`: Connection pooling, explicit schema, proper error handling.
#[derive(Debug)]
pub struct PostgresBackend {
    pool: PgPool,
    settings: PostgresSettings,
    /// Tables already created by this instance
    created: Mutex<HashSet<String>>,
}

impl PostgresBackend {
    /// Connect with a new pool.
    ///
    /// # Errors
    /// Returns `Parameter` for a non-postgres URL or invalid table name,
    /// `Engine` if the connection or schema creation fails.
    ///
    /// # Example
    /// ```ignore
    /// let settings = PostgresSettings::default().with_url("postgres://localhost/lrs");
    /// let backend = PostgresBackend::connect(settings).await?;
    /// ```
    pub async fn connect(settings: PostgresSettings) -> BackendResult<Self> {
        if !(settings.url.starts_with("postgres://") || settings.url.starts_with("postgresql://")) {
            return Err(BackendError::parameter(format!(
                "connection string must be a postgres URL, got `{}`",
                settings.url
            )));
        }
        quote_table(&settings.table)?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await
            .map_err(|e| BackendError::connection(format!("{ENGINE}: failed to connect: {e}")))?;
        Self::from_pool(pool, settings).await
    }

    /// Create from an existing pool.
    ///
    /// # Errors
    /// Returns `Engine` if the default table cannot be created.
    pub async fn from_pool(pool: PgPool, settings: PostgresSettings) -> BackendResult<Self> {
        let backend = Self {
            pool,
            settings,
            created: Mutex::new(HashSet::new()),
        };
        let table = backend.settings.table.clone();
        backend.ensure_table(&table).await?;
        Ok(backend)
    }

    async fn ensure_table(&self, table: &str) -> BackendResult<()> {
        if !self.settings.create_tables || self.created.lock().unwrap().contains(table) {
            return Ok(());
        }
        sqlx::query(&create_table(table)?)
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;
        self.created.lock().unwrap().insert(table.to_string());
        tracing::debug!(table, "statements table ready");
        Ok(())
    }

    fn table<'t>(&'t self, target: Option<&'t str>) -> BackendResult<&'t str> {
        let table = target.unwrap_or(&self.settings.table);
        quote_table(table)?;
        Ok(table)
    }

    async fn fetch(&self, sql: &SqlQuery) -> BackendResult<Vec<(String, Document)>> {
        let rows = bind_all(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;
        rows.iter().map(row_to_document).collect()
    }

    async fn returned_ids(&self, query: PgQuery<'_>) -> BackendResult<Vec<String>> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map_err(|e| BackendError::engine(e.to_string()))
            })
            .collect()
    }

    async fn probe(&self) -> Probe {
        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            return Probe::Unreachable(e.to_string());
        }
        match sqlx::query_scalar::<_, bool>("SELECT pg_is_in_recovery()")
            .fetch_one(&self.pool)
            .await
        {
            Ok(false) => Probe::Healthy,
            Ok(true) => Probe::Degraded("server is in recovery and read-only".to_string()),
            Err(e) => Probe::Degraded(e.to_string()),
        }
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl PageSource for PostgresBackend {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let table = self.table(request.target)?;
        let sql = translate::select_page(
            table,
            request.query,
            request.sort,
            request.after,
            request.size,
        )?;
        let records = self
            .fetch(&sql)
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
    backend: &'a PostgresBackend,
    native: NativeSql,
}

#[async_trait]
impl PageSource for NativeRead<'_> {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let table = self.backend.table(request.target)?;
        let offset = match request.handle() {
            Some(handle) => handle.parse::<usize>().map_err(|_| {
                BackendError::parameter(format!("invalid postgres page handle `{handle}`"))
            })?,
            None => 0,
        };
        let sql = self.native.select_page(table, offset, request.size)?;
        let records: Vec<Record> = self
            .backend
            .fetch(&sql)
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
impl ChunkWriter for PostgresBackend {
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
        let table = self.table(target)?;
        self.ensure_table(table).await?;
        let statement = write_statement(table, operation)?;

        let touched: Vec<String> = match operation {
            Operation::Delete => {
                let doc_ids: Vec<String> = chunk.iter().map(ValidatedRecord::physical_id).collect();
                self.returned_ids(sqlx::query(&statement).bind(doc_ids))
                    .await?
            }
            Operation::Create => {
                let rows = Rows::from_records(&chunk)?;
                self.returned_ids(rows.bind(&statement)).await?
            }
            // One row may be touched once per statement; the last write wins.
            _ => {
                let rows = Rows::from_records(latest_per_id(&chunk))?;
                self.returned_ids(rows.bind(&statement)).await?
            }
        };

        let mut report = ChunkReport::default();
        match operation {
            Operation::Index => {
                report.applied = chunk.len();
            }
            Operation::Update => {
                let touched: HashSet<String> = touched.into_iter().collect();
                for record in chunk {
                    if touched.contains(&record.physical_id()) {
                        report.push_applied();
                    } else {
                        report.push_rejected(Rejection::new(
                            record.id,
                            RejectionKind::Missing,
                            "document not found",
                        ));
                    }
                }
            }
            _ => {
                // Each returned id is claimed by the first record carrying it.
                let mut touched: HashSet<String> = touched.into_iter().collect();
                let (kind, reason) = if operation == Operation::Create {
                    (RejectionKind::Duplicate, "document already exists")
                } else {
                    (RejectionKind::Missing, "document not found")
                };
                for record in chunk {
                    if touched.remove(&record.physical_id()) {
                        report.push_applied();
                    } else {
                        report.push_rejected(Rejection::new(record.id, kind, reason));
                    }
                }
            }
        }
        Ok(report)
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn status(&self) -> BackendStatus {
        evaluate(ENGINE, self.probe().await, false)
    }

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
            let pattern = format!(
                "{}%",
                target
                    .unwrap_or_default()
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_")
            );
            let rows = sqlx::query(
                "SELECT table_name::text AS name, table_schema::text AS schema \
                 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name LIKE $1 \
                 ORDER BY table_name",
            )
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error(&e))?;

            rows.iter()
                .map(|row| {
                    let name: String = row
                        .try_get("name")
                        .map_err(|e| BackendError::engine(e.to_string()))?;
                    let schema: String = row
                        .try_get("schema")
                        .map_err(|e| BackendError::engine(e.to_string()))?;
                    Ok(if with_details {
                        ListEntry::Details(details(&name, [("schema", Value::String(schema))]))
                    } else {
                        ListEntry::Name(name)
                    })
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
                let native = match NativeSql::parse(native) {
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
        self.pool.close().await;
        Ok(())
    }
}

// =============================================================================
// Tests (require running Postgres)
// =============================================================================
