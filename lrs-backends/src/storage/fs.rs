//! `FsBackend` - JSON-Lines Files
//!
//! `TigerStyle`: One file per target, whole-file rewrites behind a lock.
//!
//! A target is a path relative to the root; every line is one statement.
//! Record ids are the physical ids of the statements' logical ids, so the
//! tie-breaker is stable across rewrites. Writes rewrite the file through a
//! temporary file and a rename. A read loads its file once, on the first
//! page, and pages through that snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind};
use lrs_core::pagination::{paged_stream, query_page, CandidateLoader, Snapshot};
use lrs_core::record::physical_id;
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendError, BackendResult, BackendStatus, Document, History, HistoryAction,
    ListEntry, Operation, Query, Record, StatementQueryResult, StructuredQuery, ValidatedRecord,
    WriteInput, WriteOptions,
};

use super::{details, failed, local_query, read_chunk_size, validate_target};
use crate::config::FsSettings;

const ENGINE: &str = "fs";

fn io_error(path: &Path, err: &std::io::Error) -> BackendError {
    BackendError::engine(format!("{}: {err}", path.display()))
}

/// Identifier of the statement on line `line` (zero-based).
fn line_id(document: &Document, line: usize) -> String {
    match document.get("id") {
        Some(Value::String(id)) if !id.is_empty() => physical_id(id),
        _ => format!("line-{line:010}"),
    }
}

/// Parse a JSON-lines body into `(id, document)` pairs, in file order.
fn parse_lines(name: &str, body: &str) -> BackendResult<Vec<(String, Document)>> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            let document: Document = serde_json::from_str(line).map_err(|e| {
                BackendError::bad_format(format!("{name}:{}: {e}", number + 1))
            })?;
            Ok((line_id(&document, number), document))
        })
        .collect()
}

fn render_lines<'d>(documents: impl IntoIterator<Item = &'d Document>) -> BackendResult<String> {
    let mut body = String::new();
    for document in documents {
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

/// Apply `chunk` to the ordered `documents` of one file.
fn apply_chunk(
    documents: &mut Vec<(String, Document)>,
    chunk: Vec<ValidatedRecord>,
    operation: Operation,
) -> ChunkReport {
    let mut positions: HashMap<String, usize> = documents
        .iter()
        .enumerate()
        .map(|(position, (id, _))| (id.clone(), position))
        .collect();
    let mut removed = vec![false; documents.len()];
    let mut report = ChunkReport::default();

    for record in chunk {
        let key = record.physical_id();
        let existing = positions
            .get(&key)
            .copied()
            .filter(|&position| !removed[position]);
        match (operation, existing) {
            (Operation::Create, Some(_)) => report.push_rejected(Rejection::new(
                record.id,
                RejectionKind::Duplicate,
                "document already exists",
            )),
            (Operation::Update | Operation::Delete, None) => {
                report.push_rejected(Rejection::new(
                    record.id,
                    RejectionKind::Missing,
                    "document not found",
                ));
            }
            (Operation::Delete, Some(position)) => {
                removed[position] = true;
                report.push_applied();
            }
            (_, Some(position)) => {
                documents[position].1 = record.document;
                report.push_applied();
            }
            (_, None) => {
                positions.insert(key.clone(), documents.len());
                documents.push((key, record.document));
                removed.push(false);
                report.push_applied();
            }
        }
    }

    let mut position = 0;
    documents.retain(|_| {
        let keep = !removed[position];
        position += 1;
        keep
    });
    report
}

// =============================================================================
// FsBackend
// =============================================================================

/// JSON-lines files under a root directory.
#[derive(Debug)]
pub struct FsBackend {
    settings: FsSettings,
    history: History,
    /// Serialises rewrites
    write_lock: Mutex<()>,
}

impl FsBackend {
    /// Create a backend over `settings.root`; the directory is created on
    /// first write.
    ///
    /// # Errors
    /// Returns `Parameter` if the default target is not a valid name.
    pub fn new(settings: FsSettings) -> BackendResult<Self> {
        validate_target(&settings.default_target)?;
        Ok(Self {
            settings,
            history: History::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Targets read and written so far.
    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    fn target<'t>(&'t self, target: Option<&'t str>) -> BackendResult<&'t str> {
        let target = target.unwrap_or(&self.settings.default_target);
        validate_target(target)?;
        Ok(target)
    }

    fn path(&self, target: &str) -> PathBuf {
        self.settings.root.join(target)
    }

    /// Documents of `target`; a missing file is empty.
    async fn load(&self, target: &str) -> BackendResult<Vec<(String, Document)>> {
        let path = self.path(target);
        match fs::read_to_string(&path).await {
            Ok(body) => parse_lines(target, &body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    async fn replace(&self, path: &Path, body: &str) -> BackendResult<()> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, body)
            .await
            .map_err(|e| io_error(&staging, &e))?;
        fs::rename(&staging, path)
            .await
            .map_err(|e| io_error(path, &e))
    }

    /// Every file under the root as `(target, size, modified)`, sorted.
    async fn scan(&self) -> BackendResult<Vec<(String, u64, Option<DateTime<Utc>>)>> {
        let root = &self.settings.root;
        let mut found = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, &e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, &e))? {
                let path = entry.path();
                let metadata = entry.metadata().await.map_err(|e| io_error(&path, &e))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.ends_with(".tmp") {
                    continue;
                }
                let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                found.push((name, metadata.len(), modified));
            }
        }
        found.sort();
        Ok(found)
    }

    async fn probe(&self) -> Probe {
        match fs::metadata(&self.settings.root).await {
            Ok(metadata) if !metadata.is_dir() => {
                Probe::Unreachable(format!("{} is not a directory", self.settings.root.display()))
            }
            Ok(metadata) if metadata.permissions().readonly() => {
                Probe::Degraded(format!("{} is read-only", self.settings.root.display()))
            }
            Ok(_) => Probe::Healthy,
            Err(e) => Probe::Unreachable(io_error(&self.settings.root, &e).to_string()),
        }
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl CandidateLoader for FsBackend {
    async fn load_candidates(
        &self,
        target: Option<&str>,
    ) -> BackendResult<Vec<(String, Document)>> {
        let target = self.target(target)?;
        let candidates = self.load(target).await?;
        self.history.record(ENGINE, HistoryAction::Read, target);
        Ok(candidates)
    }
}

#[async_trait]
impl ChunkWriter for FsBackend {
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
        let target = self.target(target)?;
        let path = self.path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }

        let _guard = self.write_lock.lock().await;

        let mut documents = self.load(target).await?;
        let report = apply_chunk(&mut documents, chunk, operation);
        if report.applied > 0 {
            let body = render_lines(documents.iter().map(|(_, document)| document))?;
            self.replace(&path, &body).await?;
        }
        Ok(report)
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for FsBackend {
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
        let listing = async move {
            let files = self.scan().await?;
            Ok::<_, BackendError>(
                files
                    .into_iter()
                    .filter(move |(name, _, _)| target.map_or(true, |prefix| name.starts_with(prefix)))
                    .filter(move |(name, _, _)| !new || !self.history.was_read(ENGINE, name))
                    .map(move |(name, size, modified)| {
                        Ok::<_, BackendError>(if with_details {
                            let modified = modified
                                .map_or(Value::Null, |ts| Value::String(ts.to_rfc3339()));
                            ListEntry::Details(details(
                                &name,
                                [("size", Value::from(size)), ("modified", modified)],
                            ))
                        } else {
                            ListEntry::Name(name)
                        })
                    }),
            )
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
        let structured = match local_query(ENGINE, query) {
            Ok(structured) => structured,
            Err(e) => return failed(e),
        };
        let target = match self.target(target) {
            Ok(target) => target,
            Err(e) => return failed(e),
        };
        paged_stream(
            Snapshot::new(self),
            structured,
            Some(target),
            read_chunk_size(chunk_size),
        )
    }

    async fn write(
        &self,
        data: BoxStream<'_, WriteInput>,
        options: &WriteOptions,
    ) -> BackendResult<usize> {
        let target = self.target(options.target.as_deref())?.to_string();
        let applied = write_all(self, data, options).await?;
        self.history.record(ENGINE, HistoryAction::Write, &target);
        Ok(applied)
    }

    async fn query_statements(
        &self,
        query: &StructuredQuery,
        target: Option<&str>,
    ) -> BackendResult<StatementQueryResult> {
        query.validate()?;
        let target = self.target(target)?;
        query_page(&Snapshot::new(self), query, Some(target), read_chunk_size(None)).await
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
