//! Pagination - Keyset Cursor Engine
//!
//! `TigerStyle`: One cursor semantic over every native paging primitive.
//!
//! # Algorithm
//!
//! 1. The effective sort is the caller's keys plus a trailing tie-breaker on
//!    the record identifier, in the primary key's direction.
//! 2. Each page remembers the sort tuple of its last record and any engine
//!    handle (point in time, snapshot) in a [`Cursor`].
//! 3. The next page asks the engine for records strictly past that tuple.
//! 4. A page carries a `next_cursor` iff it returned exactly `limit` records.
//!
//! Adapters implement [`PageSource::fetch_page`]; [`paged_stream`] and
//! [`query_page`] drive it for both `read` and `query_statements`. Engines
//! that can only load a whole target implement [`CandidateLoader`] and page
//! through a [`Snapshot`], which loads once per walk.

use std::borrow::Cow;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::constants::{QUERY_LIMIT_COUNT_DEFAULT, QUERY_LIMIT_COUNT_MAX};
use crate::cursor::Cursor;
use crate::error::{BackendError, BackendResult};
use crate::query::{Direction, SortKey, StructuredQuery};
use crate::eval::{page_after, sorted_matches};
use crate::record::{Document, Record};

/// Effective sort order: caller keys, then the tie-breaker.
///
/// The caller's list is never reordered. The tie-breaker takes the primary
/// key's direction (ascending without caller keys) and is not duplicated
/// when already present.
#[must_use]
pub fn effective_sort(sort: &[SortKey]) -> Vec<SortKey> {
    let mut effective = sort.to_vec();
    if !effective.iter().any(SortKey::is_tie_breaker) {
        let direction = sort.first().map_or(Direction::Asc, |key| key.direction);
        effective.push(SortKey::tie_breaker(direction));
    }
    effective
}

// =============================================================================
// Page source
// =============================================================================

/// One underlying fetch.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    /// The structured query (filters, projection)
    pub query: &'a StructuredQuery,
    /// Effective sort, tie-breaker included
    pub sort: &'a [SortKey],
    /// Resume strictly after this position
    pub after: Option<&'a Cursor>,
    /// Maximum records to return
    pub size: usize,
    /// Engine target (index, table, directory...)
    pub target: Option<&'a str>,
}

impl PageRequest<'_> {
    /// Engine handle carried by the resume position.
    #[must_use]
    pub fn handle(&self) -> Option<&str> {
        self.after.and_then(|c| c.handle.as_deref())
    }
}

/// Records returned by one fetch, with the engine handle to resume from.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in effective-sort order
    pub records: Vec<Record>,
    /// Engine execution-context handle, if any
    pub handle: Option<String>,
}

/// An engine that can fetch one keyset page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch up to `request.size` records strictly after `request.after`.
    ///
    /// Every returned record must carry its effective sort tuple.
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for &T {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        (**self).fetch_page(request).await
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// An engine that loads every candidate of a target at once.
#[async_trait]
pub trait CandidateLoader: Send + Sync {
    /// Every stored `(id, document)` of `target`, in any order.
    async fn load_candidates(&self, target: Option<&str>) -> BackendResult<Vec<(String, Document)>>;
}

/// A [`PageSource`] over a target loaded on the first page.
///
/// Matching records are filtered and ordered once; later pages are cut
/// from memory by cursor position. One snapshot serves one walk.
pub struct Snapshot<'a, L: ?Sized> {
    loader: &'a L,
    records: tokio::sync::OnceCell<Vec<Record>>,
}

impl<'a, L: CandidateLoader + ?Sized> Snapshot<'a, L> {
    /// Snapshot of whatever `loader` returns when first paged.
    #[must_use]
    pub fn new(loader: &'a L) -> Self {
        Self {
            loader,
            records: tokio::sync::OnceCell::new(),
        }
    }
}

#[async_trait]
impl<L: CandidateLoader + ?Sized> PageSource for Snapshot<'_, L> {
    async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
        let records = self
            .records
            .get_or_try_init(|| async {
                let candidates = self.loader.load_candidates(request.target).await?;
                tracing::debug!(candidates = candidates.len(), "snapshot loaded");
                sorted_matches(candidates, &request.query.filters, request.sort)
            })
            .await?;
        Ok(Page {
            records: page_after(records, request.query, request.sort, request.after, request.size),
            handle: None,
        })
    }
}

// =============================================================================
// Walker
// =============================================================================

/// Drives a [`PageSource`] chunk by chunk until a limit or a short page.
struct PageWalker<'a, S: PageSource> {
    source: S,
    query: Cow<'a, StructuredQuery>,
    sort: Vec<SortKey>,
    target: Option<&'a str>,
    chunk_size: usize,
    remaining: Option<usize>,
    cursor: Option<Cursor>,
    done: bool,
}

impl<'a, S: PageSource> PageWalker<'a, S> {
    fn new(
        source: S,
        query: Cow<'a, StructuredQuery>,
        target: Option<&'a str>,
        chunk_size: usize,
        limit: Option<usize>,
    ) -> Self {
        Self {
            source,
            sort: effective_sort(&query.sort),
            cursor: query.cursor.clone(),
            query,
            target,
            chunk_size: chunk_size.max(1),
            remaining: limit,
            done: limit == Some(0),
        }
    }

    async fn next_chunk(&mut self) -> BackendResult<Option<Vec<Record>>> {
        if self.done {
            return Ok(None);
        }
        let size = match self.remaining {
            Some(remaining) => remaining.min(self.chunk_size),
            None => self.chunk_size,
        };

        let page = self
            .source
            .fetch_page(PageRequest {
                query: &self.query,
                sort: &self.sort,
                after: self.cursor.as_ref(),
                size,
                target: self.target,
            })
            .await?;

        let Page {
            mut records,
            handle,
        } = page;
        records.truncate(size);

        if let Some(last) = records.last() {
            self.cursor = Some(Cursor::new(last.sort_values.clone()).with_handle(handle));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= records.len();
            if *remaining == 0 {
                self.done = true;
            }
        }
        if records.len() < size {
            self.done = true;
        }

        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(records))
        }
    }
}

/// Lazily stream every matching record, fetching `chunk_size` at a time.
///
/// The stream suspends between fetched chunks, never between records of
/// one chunk. Fetches run in the span current when the stream was built. It stops after `query.limit` records when a limit is set.
/// Adapters that rewrite a native query pass it owned, and may pass an
/// owned source wrapping the rewritten request.
pub fn paged_stream<'a, S>(
    source: S,
    query: impl Into<Cow<'a, StructuredQuery>>,
    target: Option<&'a str>,
    chunk_size: usize,
) -> BoxStream<'a, BackendResult<Record>>
where
    S: PageSource + 'a,
{
    let query = query.into();
    let limit = query.limit;
    let walker = PageWalker::new(source, query, target, chunk_size, limit);
    // Pages are fetched while the caller polls, under the span of the read.
    let span = tracing::Span::current();
    stream::try_unfold(walker, move |mut walker| {
        async move {
            let chunk = walker.next_chunk().await?;
            Ok::<_, BackendError>(
                chunk.map(|records| (stream::iter(records.into_iter().map(Ok)), walker)),
            )
        }
        .instrument(span.clone())
    })
    .try_flatten()
    .boxed()
}

// =============================================================================
// Statement query result
// =============================================================================

/// One page of a statements query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatementQueryResult {
    /// Records of this page, in effective-sort order
    pub records: Vec<Record>,
    /// Continuation, absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// Fetch one page of `query.limit` records (engine default when unset).
///
/// # Errors
/// Propagates errors from the page source.
pub async fn query_page<S>(
    source: &S,
    query: &StructuredQuery,
    target: Option<&str>,
    chunk_size: usize,
) -> BackendResult<StatementQueryResult>
where
    S: PageSource + ?Sized,
{
    let limit = query
        .limit
        .filter(|&l| l > 0)
        .unwrap_or(QUERY_LIMIT_COUNT_DEFAULT)
        .min(QUERY_LIMIT_COUNT_MAX);

    let mut walker = PageWalker::new(source, Cow::Borrowed(query), target, chunk_size, Some(limit));
    let mut records = Vec::with_capacity(limit.min(chunk_size));
    while let Some(chunk) = walker.next_chunk().await? {
        records.extend(chunk);
    }

    let next_cursor = if records.len() == limit {
        walker.cursor
    } else {
        None
    };

    Ok(StatementQueryResult {
        records,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::select_page;
    use crate::record::Document;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecSource {
        docs: Vec<(String, Document)>,
        fetches: AtomicUsize,
        loads: AtomicUsize,
    }

    impl VecSource {
        fn new(rows: &[(&str, i64)]) -> Self {
            let docs = rows
                .iter()
                .map(|(id, score)| {
                    let mut doc = Document::new();
                    doc.insert("score".into(), json!(score));
                    ((*id).to_string(), doc)
                })
                .collect();
            Self {
                docs,
                fetches: AtomicUsize::new(0),
                loads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for VecSource {
        async fn fetch_page(&self, request: PageRequest<'_>) -> BackendResult<Page> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let records = select_page(
                self.docs.clone(),
                request.query,
                request.sort,
                request.after,
                request.size,
            )?;
            Ok(Page {
                records,
                handle: Some("snapshot-1".into()),
            })
        }
    }

    #[async_trait]
    impl CandidateLoader for VecSource {
        async fn load_candidates(
            &self,
            _target: Option<&str>,
        ) -> BackendResult<Vec<(String, Document)>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.docs.clone())
        }
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_effective_sort_appends_tie_breaker() {
        let sort = vec![
            SortKey::new("timestamp", Direction::Desc),
            SortKey::new("verb.id", Direction::Asc),
        ];
        let effective = effective_sort(&sort);
        assert_eq!(&effective[..2], &sort[..]);
        assert_eq!(effective[2], SortKey::tie_breaker(Direction::Desc));

        assert_eq!(effective_sort(&[]), vec![SortKey::tie_breaker(Direction::Asc)]);
        assert_eq!(effective_sort(&effective), effective);
    }

    #[tokio::test]
    async fn test_stream_fetches_in_chunks() {
        let source = VecSource::new(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        let query = StructuredQuery::default();

        let records: Vec<Record> = paged_stream(&source, &query, None, 2)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(ids(&records), vec!["a", "b", "c", "d", "e"]);
        // 2 + 2 + 1 (short page ends the walk)
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_snapshot_loads_once_per_walk() {
        let source = VecSource::new(&[("a", 1), ("b", 5), ("c", 3), ("d", 5), ("e", 2)]);
        let query = StructuredQuery {
            sort: vec![SortKey::new("score", Direction::Desc)],
            ..Default::default()
        };

        let records: Vec<Record> = paged_stream(Snapshot::new(&source), &query, None, 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids(&records), vec!["d", "b", "c", "e", "a"]);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        let limited = StructuredQuery {
            limit: Some(2),
            ..query
        };
        let first = query_page(&Snapshot::new(&source), &limited, None, 1)
            .await
            .unwrap();
        assert_eq!(ids(&first.records), vec!["d", "b"]);
        let cursor = first.next_cursor.expect("full page has a cursor");
        let second = query_page(&Snapshot::new(&source), &limited.after(cursor), None, 1)
            .await
            .unwrap();
        assert_eq!(ids(&second.records), vec!["c", "e"]);
        assert_eq!(source.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stream_respects_limit() {
        let source = VecSource::new(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        let query = StructuredQuery {
            limit: Some(3),
            ..Default::default()
        };

        let records: Vec<Record> = paged_stream(&source, &query, None, 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids(&records), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_query_page_cursor_presence() {
        let source = VecSource::new(&[("a", 3), ("b", 2), ("c", 1)]);
        let query = StructuredQuery {
            sort: vec![SortKey::new("score", Direction::Desc)],
            limit: Some(2),
            ..Default::default()
        };

        let first = query_page(&source, &query, None, 500).await.unwrap();
        assert_eq!(ids(&first.records), vec!["a", "b"]);
        let cursor = first.next_cursor.clone().expect("full page has a cursor");
        assert_eq!(cursor.handle.as_deref(), Some("snapshot-1"));

        let second = query_page(&source, &query.after(cursor), None, 500)
            .await
            .unwrap();
        assert_eq!(ids(&second.records), vec!["c"]);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_cursor_survives_string_round_trip() {
        let source = VecSource::new(&[("a", 1), ("b", 1), ("c", 1)]);
        let query = StructuredQuery {
            limit: Some(1),
            sort: vec![SortKey::new("score", Direction::Asc)],
            ..Default::default()
        };

        let mut seen = Vec::new();
        let mut current = query.clone();
        loop {
            let page = query_page(&source, &current, None, 10).await.unwrap();
            seen.extend(page.records.iter().map(|r| r.id.clone()));
            let Some(cursor) = page.next_cursor else {
                break;
            };
            let (tuple, handle) = cursor.to_parts();
            let parsed = Cursor::from_parts(&tuple, handle.as_deref()).unwrap();
            current = query.after(parsed);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
