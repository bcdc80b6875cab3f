//! `SimBackend` - In-Memory Engine for Testing
//!
//! `TigerStyle`: Deterministic testing with fault injection.
//!
//! # Simulation-First
//!
//! Every contract test runs here first. Faults are injected per
//! operation name: `status`, `list`, `read`, `write_chunk`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use lrs_core::bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind};
use lrs_core::dst::{FaultConfig, FaultInjector, FaultType, SimConfig};
use lrs_core::eval::select_page;
use lrs_core::pagination::{paged_stream, query_page, Page, PageRequest, PageSource};
use lrs_core::status::{evaluate, Probe};
use lrs_core::{
    Backend, BackendResult, BackendStatus, Document, History, HistoryAction, ListEntry,
    Operation, Query, Record, StatementQueryResult, StructuredQuery, ValidatedRecord,
    WriteInput, WriteOptions,
};

use super::{details, failed, local_query, read_chunk_size};
use crate::config::SimSettings;

const ENGINE: &str = "sim";

type Targets = HashMap<String, BTreeMap<String, Document>>;

// =============================================================================
// SimBackend
// =============================================================================

/// In-memory engine for testing.
///
/// `TigerStyle`:
/// - Deterministic via `DeterministicRng`
/// - Fault injection via `FaultInjector`
/// - Thread-safe with `RwLock`
///
/// Documents are keyed by their physical id, which is also the record id
/// and the tie-breaker.
#[derive(Debug, Clone)]
pub struct SimBackend {
    /// Documents per target, ordered by physical id
    targets: Arc<RwLock<Targets>>,
    /// Fault injector for simulating failures
    fault_injector: Arc<FaultInjector>,
    settings: SimSettings,
    history: History,
    closed: Arc<AtomicBool>,
}

impl SimBackend {
    /// Create a new `SimBackend`.
    #[must_use]
    pub fn new(settings: SimSettings) -> Self {
        let config = settings
            .seed
            .map_or_else(SimConfig::from_env_or_random, SimConfig::with_seed);
        let mut rng = config.rng();
        let fault_rng = rng.fork();

        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
            fault_injector: Arc::new(FaultInjector::new(fault_rng)),
            settings,
            history: History::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shorthand for a seeded backend with default settings.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::new(SimSettings::default().with_seed(seed))
    }

    /// Add fault configuration.
    ///
    /// `FaultInjector::register` needs `&mut`, so faults are added before
    /// the backend is shared.
    ///
    /// # Panics
    /// Panics if the backend was already cloned.
    #[must_use]
    pub fn with_faults(mut self, config: FaultConfig) -> Self {
        Arc::get_mut(&mut self.fault_injector)
            .expect("cannot add faults after backend is shared")
            .register(config);
        self
    }

    /// Get fault injector for inspection.
    #[must_use]
    pub fn fault_injector(&self) -> &Arc<FaultInjector> {
        &self.fault_injector
    }

    /// Targets read and written so far.
    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Number of documents in `target` (default target when `None`).
    #[must_use]
    pub fn record_count(&self, target: Option<&str>) -> usize {
        let target = self.target(target);
        self.targets
            .read()
            .unwrap()
            .get(target)
            .map_or(0, BTreeMap::len)
    }

    fn target<'t>(&'t self, target: Option<&'t str>) -> &'t str {
        target.unwrap_or(&self.settings.default_target)
    }

    /// Check if a fault should be injected for an operation.
    fn maybe_inject_fault(&self, operation: &str) -> BackendResult<()> {
        match self.fault_injector.should_inject(operation) {
            Some(fault) => Err(fault.to_error(operation)),
            None => Ok(()),
        }
    }

    fn probe(&self) -> Probe {
        if self.closed.load(Ordering::SeqCst) {
            return Probe::Unreachable("backend closed".to_string());
        }
        match self.fault_injector.should_inject("status") {
            None => Probe::Healthy,
            Some(fault) if fault.is_connectivity() => Probe::Unreachable(fault.as_str().into()),
            Some(fault) => Probe::Degraded(fault.as_str().into()),
        }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimSettings::default())
    }
}

// =============================================================================
// Pagination and bulk primitives
// =============================================================================

#[async_trait]
impl PageSource for SimBackend {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        self.maybe_inject_fault("read")?;

        let target = self.target(request.target);
        if request.after.is_none() {
            self.history.record(ENGINE, HistoryAction::Read, target);
        }
        let candidates: Vec<(String, Document)> = self
            .targets
            .read()
            .unwrap()
            .get(target)
            .map(|docs| docs.iter().map(|(id, d)| (id.clone(), d.clone())).collect())
            .unwrap_or_default();

        let records = select_page(
            candidates,
            request.query,
            request.sort,
            request.after,
            request.size,
        )?;
        Ok(Page {
            records,
            handle: None,
        })
    }
}

#[async_trait]
impl ChunkWriter for SimBackend {
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
        // A partial chunk applies the first half and refuses the rest.
        let accepted = match self.fault_injector.should_inject("write_chunk") {
            Some(FaultType::PartialChunk) => chunk.len() / 2,
            Some(fault) => return Err(fault.to_error("write_chunk")),
            None => chunk.len(),
        };

        let target = self.target(target).to_string();
        let mut targets = self.targets.write().unwrap();
        let docs = targets.entry(target).or_default();
        let mut report = ChunkReport::default();

        for (position, record) in chunk.into_iter().enumerate() {
            if position >= accepted {
                report.push_rejected(Rejection::new(
                    record.id,
                    RejectionKind::Other,
                    "simulated partial chunk",
                ));
                continue;
            }
            let key = record.physical_id();
            let exists = docs.contains_key(&key);
            match operation {
                Operation::Create if exists => report.push_rejected(Rejection::new(
                    record.id,
                    RejectionKind::Duplicate,
                    "document already exists",
                )),
                Operation::Update | Operation::Delete if !exists => {
                    report.push_rejected(Rejection::new(
                        record.id,
                        RejectionKind::Missing,
                        "document not found",
                    ));
                }
                Operation::Delete => {
                    docs.remove(&key);
                    report.push_applied();
                }
                _ => {
                    docs.insert(key, record.document);
                    report.push_applied();
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
impl Backend for SimBackend {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn status(&self) -> BackendStatus {
        evaluate(ENGINE, self.probe(), self.settings.allow_degraded)
    }

    fn list<'a>(
        &'a self,
        target: Option<&'a str>,
        with_details: bool,
        new: bool,
    ) -> BoxStream<'a, BackendResult<ListEntry>> {
        if let Err(e) = self.maybe_inject_fault("list") {
            return failed(e);
        }

        let mut names: Vec<(String, usize)> = self
            .targets
            .read()
            .unwrap()
            .iter()
            .filter(|(name, _)| target.map_or(true, |prefix| name.starts_with(prefix)))
            .filter(|(name, _)| !new || !self.history.was_read(ENGINE, name))
            .map(|(name, docs)| (name.clone(), docs.len()))
            .collect();
        names.sort();

        let entries = names.into_iter().map(move |(name, count)| {
            Ok(if with_details {
                ListEntry::Details(details(&name, [("count", Value::from(count))]))
            } else {
                ListEntry::Name(name)
            })
        });
        stream::iter(entries).boxed()
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
        let target = self.target(target);
        paged_stream(self, structured, Some(target), read_chunk_size(chunk_size))
    }

    async fn write(
        &self,
        data: BoxStream<'_, WriteInput>,
        options: &WriteOptions,
    ) -> BackendResult<usize> {
        let applied = write_all(self, data, options).await?;
        let target = self.target(options.target.as_deref());
        self.history.record(ENGINE, HistoryAction::Write, target);
        Ok(applied)
    }

    async fn query_statements(
        &self,
        query: &StructuredQuery,
        target: Option<&str>,
    ) -> BackendResult<StatementQueryResult> {
        query.validate()?;
        let target = self.target(target);
        query_page(self, query, Some(target), read_chunk_size(None)).await
    }

    async fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
