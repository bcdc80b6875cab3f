//! Bulk Writer - Chunked Writes With Partial-Failure Accounting
//!
//! `TigerStyle`: Every applied record is counted, even on abort.
//!
//! # Pipeline
//!
//! ```text
//! WriteInput stream ─► decode ─► validate ─► chunk ─► ChunkWriter (≤ concurrency in flight)
//!                         │          │                       │
//!                         └── BadFormat ──┘          ChunkReport { applied, rejected }
//! ```
//!
//! Adapters implement [`ChunkWriter`] with their engine's native batch
//! primitive; [`write_all`] owns validation, chunking, dispatch and the
//! final tally.

use async_trait::async_trait;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    BACKEND_WRITE_CHUNK_SIZE_DEFAULT, BACKEND_WRITE_CHUNK_SIZE_MAX,
    BACKEND_WRITE_CONCURRENCY_DEFAULT, BACKEND_WRITE_CONCURRENCY_MAX,
};
use crate::error::{BackendError, BackendResult};
use crate::record::{Operation, ValidatedRecord, WriteInput};

// =============================================================================
// Options and reports
// =============================================================================

/// Options of one write call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Engine target; adapter default when absent
    pub target: Option<String>,
    /// Records per chunk; adapter default when absent
    pub chunk_size: Option<usize>,
    /// Write intent for every record
    pub operation: Operation,
    /// Skip failing records instead of aborting
    pub ignore_errors: bool,
    /// Chunks in flight at once
    pub concurrency: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            target: None,
            chunk_size: None,
            operation: Operation::default(),
            ignore_errors: false,
            concurrency: BACKEND_WRITE_CONCURRENCY_DEFAULT,
        }
    }
}

impl WriteOptions {
    /// Set the target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Set the operation.
    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    /// Skip failing records.
    #[must_use]
    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    /// Set the number of chunks in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Why the engine refused one record of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// Identifier already exists (create)
    Duplicate,
    /// Identifier does not exist (update, delete)
    Missing,
    /// Any other per-record refusal
    Other,
}

/// One record the engine refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Logical id of the record
    pub id: String,
    /// Classification
    pub kind: RejectionKind,
    /// Cause as reported by the engine
    pub reason: String,
}

impl Rejection {
    /// Create a rejection.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    /// Records the engine applied
    pub applied: usize,
    /// Records the engine refused
    pub rejected: Vec<Rejection>,
}

impl ChunkReport {
    /// Every record applied.
    #[must_use]
    pub fn applied(applied: usize) -> Self {
        Self {
            applied,
            rejected: Vec::new(),
        }
    }

    /// Record a success.
    pub fn push_applied(&mut self) {
        self.applied += 1;
    }

    /// Record a refusal.
    pub fn push_rejected(&mut self, rejection: Rejection) {
        self.rejected.push(rejection);
    }
}

/// An engine's native batch primitive.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    /// Engine name used in logs and errors.
    fn engine_name(&self) -> &'static str;

    /// True if this engine implements `operation`.
    fn supports(&self, operation: Operation) -> bool;

    /// Records per chunk when the caller sets none.
    fn default_chunk_size(&self) -> usize {
        BACKEND_WRITE_CHUNK_SIZE_DEFAULT
    }

    /// Apply one chunk.
    ///
    /// Per-record refusals go into the report; an `Err` means the engine
    /// failed in a way no single record explains and aborts the write.
    async fn write_chunk(
        &self,
        target: Option<&str>,
        chunk: Vec<ValidatedRecord>,
        operation: Operation,
    ) -> BackendResult<ChunkReport>;
}

// =============================================================================
// Chunker
// =============================================================================

struct Chunker<'a> {
    input: BoxStream<'a, WriteInput>,
    operation: Operation,
    chunk_size: usize,
    ignore_errors: bool,
    skipped: usize,
}

impl Chunker<'_> {
    /// Next full (or final partial) chunk of validated records.
    ///
    /// Without `ignore_errors`, the first invalid record yields its error;
    /// records gathered for the pending chunk are discarded.
    async fn next_chunk(&mut self) -> Option<BackendResult<Vec<ValidatedRecord>>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            let Some(item) = self.input.next().await else {
                break;
            };
            match validate(item, self.operation) {
                Ok(record) => chunk.push(record),
                Err((err, content)) => {
                    tracing::warn!(
                        operation = %self.operation,
                        record = %content,
                        error = %err,
                        "invalid record"
                    );
                    if !self.ignore_errors {
                        return Some(Err(err));
                    }
                    self.skipped += 1;
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

fn validate(
    item: WriteInput,
    operation: Operation,
) -> Result<ValidatedRecord, (BackendError, String)> {
    let raw_content = match &item {
        WriteInput::Raw(raw) => Some(String::from_utf8_lossy(raw).into_owned()),
        WriteInput::Document(_) => None,
    };
    let document = item
        .decode()
        .map_err(|e| (e, raw_content.unwrap_or_default()))?;
    match ValidatedRecord::check(&document, operation) {
        Ok((id, timestamp)) => Ok(ValidatedRecord {
            id,
            timestamp,
            document,
        }),
        Err(e) => Err((e, Value::Object(document).to_string())),
    }
}

// =============================================================================
// write_all
// =============================================================================

/// Validate, chunk and dispatch `input` through `writer`.
///
/// Returns the number of records applied. `Append` and operations the
/// engine does not support fail with `Parameter` before any input is read.
/// An empty input returns 0 without calling the engine.
///
/// # Errors
/// On abort, returns [`BackendError::Write`] carrying every record applied
/// so far, including chunks that were in flight when the failure occurred.
pub async fn write_all<W>(
    writer: &W,
    input: BoxStream<'_, WriteInput>,
    options: &WriteOptions,
) -> BackendResult<usize>
where
    W: ChunkWriter + ?Sized,
{
    let operation = options.operation;
    let engine = writer.engine_name();
    if operation == Operation::Append || !writer.supports(operation) {
        return Err(BackendError::parameter(format!(
            "{engine} does not support the {operation} operation"
        )));
    }

    let chunk_size = options
        .chunk_size
        .filter(|&c| c > 0)
        .unwrap_or_else(|| writer.default_chunk_size())
        .min(BACKEND_WRITE_CHUNK_SIZE_MAX);
    let concurrency = options
        .concurrency
        .clamp(1, BACKEND_WRITE_CONCURRENCY_MAX);
    let target = options.target.as_deref();

    let mut chunker = Chunker {
        input,
        operation,
        chunk_size,
        ignore_errors: options.ignore_errors,
        skipped: 0,
    };

    let mut in_flight = FuturesUnordered::new();
    let mut applied = 0usize;
    let mut dispatched = 0usize;
    let mut failure: Option<BackendError> = None;
    let mut exhausted = false;

    loop {
        while failure.is_none() && !exhausted && in_flight.len() < concurrency {
            match chunker.next_chunk().await {
                Some(Ok(chunk)) => {
                    dispatched += 1;
                    in_flight.push(writer.write_chunk(target, chunk, operation));
                }
                Some(Err(err)) => failure = Some(err),
                None => exhausted = true,
            }
        }

        let Some(result) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(report) => {
                applied += report.applied;
                let ignore = options.ignore_errors;
                if let Some(err) = reconcile(engine, operation, report, ignore, &mut chunker.skipped)
                {
                    failure.get_or_insert(err);
                }
            }
            Err(err) => {
                tracing::error!(engine, %operation, error = %err, "chunk write failed");
                failure.get_or_insert(err);
            }
        }
    }

    if let Some(err) = failure {
        return Err(BackendError::aborted_write(applied, err));
    }

    if dispatched == 0 {
        tracing::info!(engine, %operation, skipped = chunker.skipped, "no records to write");
    } else {
        tracing::debug!(engine, %operation, applied, skipped = chunker.skipped, "write finished");
    }
    Ok(applied)
}

/// Turn per-record refusals into a fatal error unless they are ignored.
fn reconcile(
    engine: &str,
    operation: Operation,
    report: ChunkReport,
    ignore_errors: bool,
    skipped: &mut usize,
) -> Option<BackendError> {
    if report.rejected.is_empty() {
        return None;
    }
    for rejection in &report.rejected {
        tracing::warn!(
            engine,
            %operation,
            id = %rejection.id,
            kind = ?rejection.kind,
            reason = %rejection.reason,
            "record rejected"
        );
    }
    if ignore_errors {
        *skipped += report.rejected.len();
        return None;
    }

    let first = &report.rejected[0];
    Some(BackendError::engine(format!(
        "{engine} rejected {} of {} records in chunk ({operation}); first: {}: {}",
        report.rejected.len(),
        report.applied + report.rejected.len(),
        first.id,
        first.reason
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Accepts every record except ids listed as duplicates; `fail_on`
    /// makes the chunk containing that id fail at engine level.
    #[derive(Default)]
    struct FakeWriter {
        existing: Mutex<HashSet<String>>,
        fail_on: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkWriter for FakeWriter {
        fn engine_name(&self) -> &'static str {
            "fake"
        }

        fn supports(&self, operation: Operation) -> bool {
            operation != Operation::Update
        }

        async fn write_chunk(
            &self,
            _target: Option<&str>,
            chunk: Vec<ValidatedRecord>,
            operation: Operation,
        ) -> BackendResult<ChunkReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(bad) = &self.fail_on {
                if chunk.iter().any(|r| &r.id == bad) {
                    return Err(BackendError::engine("cluster_block_exception"));
                }
            }
            let mut existing = self.existing.lock().unwrap();
            let mut report = ChunkReport::default();
            for record in chunk {
                let inserted = existing.insert(record.id.clone());
                if operation == Operation::Create && !inserted {
                    report.push_rejected(Rejection::new(
                        record.id,
                        RejectionKind::Duplicate,
                        "version_conflict_engine_exception",
                    ));
                } else {
                    report.push_applied();
                }
            }
            Ok(report)
        }
    }

    fn statements(ids: &[&str]) -> Vec<WriteInput> {
        ids.iter()
            .map(|id| {
                let value = json!({"id": id, "timestamp": "2024-01-01T00:00:00Z"});
                match value {
                    Value::Object(doc) => WriteInput::Document(doc),
                    _ => unreachable!(),
                }
            })
            .collect()
    }

    fn input(items: Vec<WriteInput>) -> BoxStream<'static, WriteInput> {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_write_counts_every_record() {
        let writer = FakeWriter::default();
        let options = WriteOptions::default().with_chunk_size(2);
        let count = write_all(&writer, input(statements(&["a", "b", "c", "d", "e"])), &options)
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_input_never_calls_engine() {
        let writer = FakeWriter::default();
        let count = write_all(&writer, input(vec![]), &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_append_and_unsupported_rejected_up_front() {
        let writer = FakeWriter::default();
        for ignore_errors in [false, true] {
            let options = WriteOptions::default()
                .with_operation(Operation::Append)
                .with_ignore_errors(ignore_errors);
            let err = write_all(&writer, input(statements(&["a"])), &options)
                .await
                .unwrap_err();
            assert!(err.is_parameter());
        }

        let options = WriteOptions::default().with_operation(Operation::Update);
        let err = write_all(&writer, input(vec![]), &options).await.unwrap_err();
        assert!(err.is_parameter());
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ignore_errors_skips_invalid_records() {
        let writer = FakeWriter::default();
        let mut items = statements(&["a", "b"]);
        items.push(WriteInput::from("{broken"));
        items.push(WriteInput::from(r#"{"id": "no-timestamp"}"#));
        items.extend(statements(&["c"]));

        let options = WriteOptions::default().with_ignore_errors(true);
        let count = write_all(&writer, input(items), &options).await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_invalid_record_aborts_with_prior_count() {
        let writer = FakeWriter::default();
        let mut items = statements(&["a", "b", "c"]);
        items.push(WriteInput::from(r#"{"id": "x", "timestamp": "not a date"}"#));
        items.extend(statements(&["d"]));

        let options = WriteOptions::default().with_chunk_size(2);
        let err = write_all(&writer, input(items), &options).await.unwrap_err();
        // chunk [a, b] was applied; [c] was pending and is discarded
        assert_eq!(err.applied(), 2);
        assert_eq!(err.kind(), crate::error::ErrorKind::BadFormat);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected_then_ignored() {
        let writer = FakeWriter::default();
        let options = WriteOptions::default();
        assert_eq!(
            write_all(&writer, input(statements(&["a"])), &options)
                .await
                .unwrap(),
            1
        );

        let err = write_all(&writer, input(statements(&["a"])), &options)
            .await
            .unwrap_err();
        assert_eq!(err.applied(), 0);
        assert!(err.to_string().contains("version_conflict_engine_exception"));

        let ignoring = WriteOptions::default().with_ignore_errors(true);
        let count = write_all(&writer, input(statements(&["a"])), &ignoring)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_partial_chunk_counts_successes() {
        let writer = FakeWriter::default();
        writer.existing.lock().unwrap().insert("b".into());

        let options = WriteOptions::default().with_chunk_size(10);
        let err = write_all(&writer, input(statements(&["a", "b", "c"])), &options)
            .await
            .unwrap_err();
        assert_eq!(err.applied(), 2);
        assert!(err.to_string().contains("rejected 1 of 3"));
    }

    #[tokio::test]
    async fn test_engine_failure_aborts_even_when_ignoring() {
        let writer = FakeWriter {
            fail_on: Some("c".into()),
            ..FakeWriter::default()
        };
        let options = WriteOptions::default()
            .with_chunk_size(2)
            .with_ignore_errors(true);
        let err = write_all(&writer, input(statements(&["a", "b", "c", "d"])), &options)
            .await
            .unwrap_err();
        assert_eq!(err.applied(), 2);
        assert!(err.to_string().contains("cluster_block_exception"));
    }

    #[tokio::test]
    async fn test_tally_independent_of_concurrency() {
        let ids: Vec<String> = (0..37).map(|i| format!("s{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        for concurrency in [1, 2, 4, 16] {
            let writer = FakeWriter::default();
            for dup in ["s3", "s20", "s36"] {
                writer.existing.lock().unwrap().insert(dup.into());
            }
            let options = WriteOptions::default()
                .with_chunk_size(5)
                .with_concurrency(concurrency)
                .with_ignore_errors(true);
            let count = write_all(&writer, input(statements(&id_refs)), &options)
                .await
                .unwrap();
            assert_eq!(count, 34, "concurrency {concurrency}");
        }
    }
}
