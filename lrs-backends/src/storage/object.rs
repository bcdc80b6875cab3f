//! `ObjectStoreBackend` - One Object per Statement
//!
//! `TigerStyle`: Keys derive from physical ids, conflicts come from the store.
//!
//! A target is a key prefix. Statements live at
//! `<prefix>/<physical id>.json`, so the object name is the record id and
//! the tie-breaker. Each read (and each `query_statements` call) lists the
//! prefix and fetches the objects once, on its first page; later pages are
//! cut from that snapshot by cursor position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use serde_json::Value;

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind};
use lrs_core::pagination::{paged_stream, query_page, CandidateLoader, Snapshot};
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendError, BackendResult, BackendStatus, Document, History, HistoryAction,
    ListEntry, Operation, Query, Record, StatementQueryResult, StructuredQuery, ValidatedRecord,
    WriteInput, WriteOptions,
};

use super::{details, failed, local_query, read_chunk_size, validate_target};
use crate::config::ObjectStoreSettings;
use crate::constants::{OBJECT_STORE_EXTENSION, OBJECT_STORE_FETCH_CONCURRENCY_MAX};

const ENGINE: &str = "object_store";

fn store_error(err: &object_store::Error) -> BackendError {
    BackendError::engine(format!("object store: {err}"))
}

/// Record id of an object, `None` for keys this backend did not write.
fn object_id(meta: &ObjectMeta) -> Option<&str> {
    meta.location
        .filename()?
        .strip_suffix(OBJECT_STORE_EXTENSION)?
        .strip_suffix('.')
}

// =============================================================================
// ObjectStoreBackend
// =============================================================================

/// Statements as JSON objects in any `object_store` implementation.
#[derive(Debug)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    history: History,
    closed: AtomicBool,
}

impl ObjectStoreBackend {
    /// Wrap `store`, using `prefix` when no target is given.
    ///
    /// # Errors
    /// Returns `Parameter` if `prefix` is not a valid target.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> BackendResult<Self> {
        let prefix = prefix.into();
        validate_target(&prefix)?;
        Ok(Self {
            store,
            prefix,
            history: History::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// In-memory store, or a local directory when `settings.root` is set.
    ///
    /// # Errors
    /// Returns `Engine` if the directory cannot be created or opened.
    pub fn from_settings(settings: &ObjectStoreSettings) -> BackendResult<Self> {
        let store: Arc<dyn ObjectStore> = match &settings.root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    BackendError::engine(format!("{}: {e}", root.display()))
                })?;
                let local = LocalFileSystem::new_with_prefix(root).map_err(|e| store_error(&e))?;
                Arc::new(local)
            }
            None => Arc::new(InMemory::new()),
        };
        Self::new(store, settings.prefix.clone())
    }

    /// Targets read and written so far.
    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    fn target<'t>(&'t self, target: Option<&'t str>) -> BackendResult<&'t str> {
        let target = target.unwrap_or(&self.prefix);
        validate_target(target)?;
        Ok(target)
    }

    fn key(target: &str, id: &str) -> Path {
        Path::from(format!("{target}/{id}.{OBJECT_STORE_EXTENSION}"))
    }

    /// Every statement object under `target`, ordered by key.
    async fn objects(&self, target: &str) -> BackendResult<Vec<ObjectMeta>> {
        let prefix = Path::from(target);
        let mut objects: Vec<ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .map_err(|e| store_error(&e))
            .try_filter(|meta| futures::future::ready(object_id(meta).is_some()))
            .try_collect()
            .await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }

    async fn load(&self, meta: &ObjectMeta) -> BackendResult<Document> {
        let body = self
            .store
            .get(&meta.location)
            .await
            .map_err(|e| store_error(&e))?
            .bytes()
            .await
            .map_err(|e| store_error(&e))?;
        serde_json::from_slice(&body)
            .map_err(|e| BackendError::bad_format(format!("{}: {e}", meta.location)))
    }

    async fn exists(&self, key: &Path) -> BackendResult<bool> {
        match self.store.head(key).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_error(&e)),
        }
    }

    /// Apply one record, returning the rejection if the store refused it.
    async fn apply(
        &self,
        target: &str,
        record: ValidatedRecord,
        operation: Operation,
    ) -> BackendResult<Option<Rejection>> {
        let key = Self::key(target, &record.physical_id());
        if matches!(operation, Operation::Update | Operation::Delete) && !self.exists(&key).await? {
            return Ok(Some(Rejection::new(
                record.id,
                RejectionKind::Missing,
                "document not found",
            )));
        }
        match operation {
            Operation::Create => {
                let payload = PutPayload::from(serde_json::to_vec(&record.document)?);
                let options = PutOptions {
                    mode: PutMode::Create,
                    ..Default::default()
                };
                match self.store.put_opts(&key, payload, options).await {
                    Ok(_) => Ok(None),
                    Err(object_store::Error::AlreadyExists { .. }) => Ok(Some(Rejection::new(
                        record.id,
                        RejectionKind::Duplicate,
                        "document already exists",
                    ))),
                    Err(e) => Err(store_error(&e)),
                }
            }
            Operation::Delete => {
                self.store.delete(&key).await.map_err(|e| store_error(&e))?;
                Ok(None)
            }
            Operation::Index | Operation::Update => {
                let payload = PutPayload::from(serde_json::to_vec(&record.document)?);
                self.store
                    .put(&key, payload)
                    .await
                    .map_err(|e| store_error(&e))?;
                Ok(None)
            }
            Operation::Append => Err(BackendError::parameter(format!(
                "{ENGINE} does not support {}",
                operation.as_str()
            ))),
        }
    }

    async fn probe(&self) -> Probe {
        if self.closed.load(Ordering::SeqCst) {
            return Probe::Unreachable("backend closed".to_string());
        }
        match self.store.list_with_delimiter(None).await {
            Ok(_) => Probe::Healthy,
            Err(e) => Probe::Unreachable(e.to_string()),
        }
    }

    /// Top-level prefixes with their object counts and sizes.
    async fn prefixes(&self) -> BackendResult<Vec<(String, usize, usize)>> {
        let listing = self
            .store
            .list_with_delimiter(None)
            .await
            .map_err(|e| store_error(&e))?;
        let mut found = Vec::with_capacity(listing.common_prefixes.len());
        for prefix in listing.common_prefixes {
            let name = prefix.to_string();
            let objects = self.objects(&name).await?;
            let bytes = objects.iter().map(|meta| meta.size).sum();
            found.push((name, objects.len(), bytes));
        }
        found.sort();
        Ok(found)
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl CandidateLoader for ObjectStoreBackend {
    async fn load_candidates(
        &self,
        target: Option<&str>,
    ) -> BackendResult<Vec<(String, Document)>> {
        let target = self.target(target)?;
        let objects = self.objects(target).await?;
        self.history.record(ENGINE, HistoryAction::Read, target);

        stream::iter(objects)
            .map(|meta| async move {
                let document = self.load(&meta).await?;
                let id = object_id(&meta).unwrap_or_default().to_string();
                Ok::<_, BackendError>((id, document))
            })
            .buffered(OBJECT_STORE_FETCH_CONCURRENCY_MAX)
            .try_collect()
            .await
    }
}

#[async_trait]
impl ChunkWriter for ObjectStoreBackend {
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
        let mut report = ChunkReport::default();
        for record in chunk {
            match self.apply(target, record, operation).await? {
                Some(rejection) => report.push_rejected(rejection),
                None => report.push_applied(),
            }
        }
        Ok(report)
    }
}

// =============================================================================
// Backend
// =============================================================================

#[async_trait]
impl Backend for ObjectStoreBackend {
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
            let prefixes = self.prefixes().await?;
            Ok::<_, BackendError>(
                prefixes
                    .into_iter()
                    .filter(move |(name, _, _)| target.map_or(true, |wanted| name.starts_with(wanted)))
                    .filter(move |(name, _, _)| !new || !self.history.was_read(ENGINE, name))
                    .map(move |(name, count, bytes)| {
                        Ok::<_, BackendError>(if with_details {
                            ListEntry::Details(details(
                                &name,
                                [("count", Value::from(count)), ("bytes", Value::from(bytes))],
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
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrs_core::{physical_id, Direction};
    use serde_json::json;

    fn backend() -> ObjectStoreBackend {
        ObjectStoreBackend::from_settings(&ObjectStoreSettings::default()).unwrap()
    }

    fn statement(id: &str, timestamp: &str) -> WriteInput {
        match json!({"id": id, "timestamp": timestamp}) {
            Value::Object(map) => WriteInput::Document(map),
            _ => unreachable!(),
        }
    }

    async fn write(
        backend: &ObjectStoreBackend,
        inputs: Vec<WriteInput>,
        options: &WriteOptions,
    ) -> BackendResult<usize> {
        backend.write(stream::iter(inputs).boxed(), options).await
    }

    #[tokio::test]
    async fn test_objects_are_keyed_by_physical_id() {
        let backend = backend();
        write(&backend, vec![statement("a", "2024-01-01T00:00:00Z")], &WriteOptions::default())
            .await
            .unwrap();

        let key = ObjectStoreBackend::key("statements", &physical_id("a"));
        assert!(backend.exists(&key).await.unwrap());
        assert_eq!(
            key.to_string(),
            format!("statements/{}.json", physical_id("a"))
        );
    }

    #[tokio::test]
    async fn test_create_conflict_is_duplicate() {
        let backend = backend();
        write(&backend, vec![statement("a", "2024-01-01T00:00:00Z")], &WriteOptions::default())
            .await
            .unwrap();

        let inputs = vec![statement("a", "2024-01-01T00:00:00Z"), statement("b", "2024-01-01T00:00:00Z")];
        let err = write(&backend, inputs, &WriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.applied(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_require_existing_objects() {
        let backend = backend();
        write(&backend, vec![statement("a", "2024-01-01T00:00:00Z")], &WriteOptions::default())
            .await
            .unwrap();
        let lenient = |operation| {
            WriteOptions::default()
                .with_operation(operation)
                .with_ignore_errors(true)
        };

        let update = vec![statement("a", "2024-03-01T00:00:00Z"), statement("zz", "2024-03-01T00:00:00Z")];
        assert_eq!(write(&backend, update, &lenient(Operation::Update)).await.unwrap(), 1);

        let delete = vec![statement("a", "2024-03-01T00:00:00Z"), statement("zz", "2024-03-01T00:00:00Z")];
        assert_eq!(write(&backend, delete, &lenient(Operation::Delete)).await.unwrap(), 1);

        let records: Vec<Record> = backend
            .read(&Query::default(), None, None)
            .try_collect()
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_read_sorted_across_pages() {
        let backend = backend();
        let inputs = vec![
            statement("a", "2024-01-01T00:00:03Z"),
            statement("b", "2024-01-01T00:00:01Z"),
            statement("c", "2024-01-01T00:00:02Z"),
        ];
        write(&backend, inputs, &WriteOptions::default()).await.unwrap();

        let query = Query::builder()
            .sort("timestamp", Direction::Desc)
            .build()
            .unwrap();
        let records: Vec<Record> = backend
            .read(&query, None, Some(2))
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = records.iter().filter_map(Record::logical_id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_list_prefixes_with_details() {
        let backend = backend();
        for target in ["2023", "2024"] {
            let options = WriteOptions::default().with_target(target);
            write(&backend, vec![statement(target, "2024-01-01T00:00:00Z")], &options)
                .await
                .unwrap();
        }

        let names: Vec<ListEntry> = backend
            .list(Some("2024"), false, false)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec![ListEntry::Name("2024".into())]);

        let _: Vec<Record> = backend
            .read(&Query::default(), Some("2023"), None)
            .try_collect()
            .await
            .unwrap();
        let fresh: Vec<ListEntry> = backend.list(None, true, true).try_collect().await.unwrap();
        assert_eq!(fresh.len(), 1);
        let ListEntry::Details(details) = &fresh[0] else {
            panic!("expected details");
        };
        assert_eq!(details.get("name"), Some(&json!("2024")));
        assert_eq!(details.get("count"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_append_is_rejected() {
        let backend = backend();
        let options = WriteOptions::default().with_operation(Operation::Append);
        let err = write(&backend, vec![statement("a", "2024-01-01T00:00:00Z")], &options)
            .await
            .unwrap_err();
        assert!(err.is_parameter());
    }

    #[tokio::test]
    async fn test_local_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ObjectStoreSettings::default().with_root(dir.path().join("store"));
        let backend = ObjectStoreBackend::from_settings(&settings).unwrap();
        write(&backend, vec![statement("a", "2024-01-01T00:00:00Z")], &WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(backend.status().await, BackendStatus::Ok);
        let path = dir
            .path()
            .join("store/statements")
            .join(format!("{}.json", physical_id("a")));
        assert!(path.exists());

        backend.close().await.unwrap();
        assert_eq!(backend.status().await, BackendStatus::Away);
    }

    /// Names of the spans events were emitted in.
    #[derive(Clone, Default)]
    struct EventSpans(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S> tracing_subscriber::Layer<S> for EventSpans
    where
        S: tracing::Subscriber + for<'l> tracing_subscriber::registry::LookupSpan<'l>,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let name = ctx
                .event_span(event)
                .map_or_else(String::new, |span| span.name().to_string());
            self.0.lock().unwrap().push(name);
        }
    }

    #[tokio::test]
    async fn test_read_lists_once_and_marks_on_consumption() {
        use tracing_subscriber::layer::SubscriberExt;

        let backend = backend();
        let inputs = (0..5)
            .map(|n| statement(&format!("s{n}"), "2024-01-01T00:00:00Z"))
            .collect();
        write(&backend, inputs, &WriteOptions::default()).await.unwrap();

        let spans = EventSpans::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

        let query = Query::default();
        let mut records = backend.read(&query, None, Some(2));
        assert!(!backend.history().was_read(ENGINE, "statements"));
        assert!(spans.0.lock().unwrap().is_empty());

        assert!(records.try_next().await.unwrap().is_some());
        assert!(backend.history().was_read(ENGINE, "statements"));
        assert!(spans.0.lock().unwrap().iter().any(|name| name == "read"));

        // Later pages come from the snapshot taken on the first page.
        for n in 0..5 {
            let key = ObjectStoreBackend::key("statements", &physical_id(&format!("s{n}")));
            backend.store.delete(&key).await.unwrap();
        }
        let rest: Vec<Record> = records.try_collect().await.unwrap();
        assert_eq!(rest.len(), 4);
    }
}
