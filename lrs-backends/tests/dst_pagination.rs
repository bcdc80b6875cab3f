//! DST: Keyset Pagination Properties
//!
//! Multi-seed property loops over the in-memory engines. Each seed builds a
//! data set with many duplicated timestamps, then walks it page by page
//! through `query_statements` cursors and compares the result with a single
//! unpaged read and with an order computed independently.
//!
//! Reproduce a failure with `DST_SEED=<seed> cargo test --test dst_pagination`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};

use lrs_backends::{FsBackend, FsSettings, ObjectStoreBackend, ObjectStoreSettings, SimBackend};
use lrs_core::{
    physical_id, property_seeds, Backend, Cursor, DeterministicRng, Direction, Query, Record,
    SortKey, StructuredQuery, WriteInput, WriteOptions,
};

fn statement(id: &str, timestamp: DateTime<Utc>) -> WriteInput {
    match json!({"id": id, "timestamp": timestamp.to_rfc3339()}) {
        Value::Object(map) => WriteInput::Document(map),
        _ => unreachable!(),
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn by_timestamp(direction: Direction, limit: usize) -> StructuredQuery {
    StructuredQuery {
        sort: vec![SortKey::new("timestamp", direction)],
        limit: Some(limit),
        ..Default::default()
    }
}

/// Follow cursors until the engine stops returning one.
async fn walk(backend: &dyn Backend, first: &StructuredQuery) -> Vec<Record> {
    let mut records = Vec::new();
    let mut query = first.clone();
    loop {
        let page = backend.query_statements(&query, None).await.unwrap();
        assert!(page.records.len() <= first.limit.unwrap_or(usize::MAX));
        records.extend(page.records);
        match page.next_cursor {
            Some(cursor) => {
                // Cursors cross the API boundary as strings.
                let (tuple, handle) = cursor.to_parts();
                query = first.after(Cursor::from_parts(&tuple, handle.as_deref()).unwrap());
            }
            None => return records,
        }
    }
}

fn logical_ids(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(Record::logical_id)
        .map(str::to_string)
        .collect()
}

/// Seed `backend` with `count` statements over a handful of distinct
/// timestamps; returns the expected order for `direction`.
async fn seed(
    backend: &dyn Backend,
    rng: &mut DeterministicRng,
    count: usize,
    direction: Direction,
) -> Vec<String> {
    let mut expected: Vec<(DateTime<Utc>, String, String)> = Vec::with_capacity(count);
    let mut inputs = Vec::with_capacity(count);
    for n in 0..count {
        let id = format!("stmt-{n}-{}", rng.next_hex_id(4));
        let timestamp = rng.next_timestamp(base_time(), 5);
        expected.push((timestamp, physical_id(&id), id.clone()));
        inputs.push(statement(&id, timestamp));
    }
    rng.shuffle(&mut inputs);

    let options = WriteOptions::default().with_chunk_size(rng.next_usize(1, 7));
    let written = backend
        .write(stream::iter(inputs).boxed(), &options)
        .await
        .unwrap();
    assert_eq!(written, count);

    expected.sort();
    if direction == Direction::Desc {
        expected.reverse();
    }
    expected.into_iter().map(|(_, _, id)| id).collect()
}

async fn check_paging_matches_unpaged(backend: &dyn Backend, seed_value: u64) {
    let mut rng = DeterministicRng::new(seed_value);
    let count = rng.next_usize(0, 40);
    let direction = if rng.next_bool(0.5) {
        Direction::Asc
    } else {
        Direction::Desc
    };
    let expected = seed(backend, &mut rng, count, direction).await;
    let page_size = rng.next_usize(1, 9);

    let paged = logical_ids(&walk(backend, &by_timestamp(direction, page_size)).await);
    let unpaged_query = Query::Structured(StructuredQuery {
        sort: vec![SortKey::new("timestamp", direction)],
        ..Default::default()
    });
    let unpaged: Vec<Record> = backend
        .read(&unpaged_query, None, Some(page_size))
        .try_collect()
        .await
        .unwrap();

    let unique: HashSet<&String> = paged.iter().collect();
    assert_eq!(unique.len(), paged.len(), "seed {seed_value}: duplicate across pages");
    assert_eq!(paged, expected, "seed {seed_value}: paged order");
    assert_eq!(logical_ids(&unpaged), expected, "seed {seed_value}: streamed order");
}

#[tokio::test]
async fn test_dst_paging_matches_unpaged_sim() {
    for seed_value in property_seeds(0) {
        let backend = SimBackend::with_seed(seed_value);
        check_paging_matches_unpaged(&backend, seed_value).await;
    }
}

#[tokio::test]
async fn test_dst_paging_matches_unpaged_object_store() {
    for seed_value in property_seeds(8) {
        let backend = ObjectStoreBackend::from_settings(&ObjectStoreSettings::default()).unwrap();
        check_paging_matches_unpaged(&backend, seed_value).await;
    }
}

#[tokio::test]
async fn test_dst_paging_matches_unpaged_fs() {
    for seed_value in property_seeds(8) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(FsSettings::default().with_root(dir.path())).unwrap();
        check_paging_matches_unpaged(&backend, seed_value).await;
    }
}

#[tokio::test]
async fn test_tie_breaker_with_page_size_one() {
    let backend = SimBackend::with_seed(7);
    let same = base_time();
    let inputs = vec![
        statement("A", same),
        statement("B", same),
        statement("C", same),
    ];
    backend
        .write(stream::iter(inputs).boxed(), &WriteOptions::default())
        .await
        .unwrap();

    for direction in [Direction::Asc, Direction::Desc] {
        let records = walk(&backend, &by_timestamp(direction, 1)).await;
        let mut ids = logical_ids(&records);
        assert_eq!(ids.len(), 3, "{direction:?}: {ids:?}");
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }
}

#[tokio::test]
async fn test_descending_pages_of_two() {
    let backend: Arc<dyn Backend> = Arc::new(SimBackend::with_seed(3));
    let now = base_time();
    let inputs = vec![
        statement("t-2h", now - Duration::hours(2)),
        statement("t-0h", now),
        statement("t-1h", now - Duration::hours(1)),
    ];
    backend
        .write(stream::iter(inputs).boxed(), &WriteOptions::default())
        .await
        .unwrap();

    let first_query = by_timestamp(Direction::Desc, 2);
    let first = backend.query_statements(&first_query, None).await.unwrap();
    assert_eq!(logical_ids(&first.records), vec!["t-0h", "t-1h"]);

    let cursor = first.next_cursor.expect("a full page carries a cursor");
    let second = backend
        .query_statements(&first_query.after(cursor), None)
        .await
        .unwrap();
    assert_eq!(logical_ids(&second.records), vec!["t-2h"]);
    assert!(second.next_cursor.is_none());
}

#[tokio::test]
async fn test_resuming_from_last_record_of_stream() {
    let backend = SimBackend::with_seed(11);
    let inputs: Vec<WriteInput> = (0..6)
        .map(|n| statement(&format!("s{n}"), base_time() + Duration::seconds(n / 2)))
        .collect();
    backend
        .write(stream::iter(inputs).boxed(), &WriteOptions::default())
        .await
        .unwrap();

    let query = by_timestamp(Direction::Asc, 3);
    let first = backend.query_statements(&query, None).await.unwrap();
    let last = first.records.last().unwrap();
    let resumed = backend
        .query_statements(&query.after(Cursor::new(last.sort_values.clone())), None)
        .await
        .unwrap();

    let mut all = logical_ids(&first.records);
    all.extend(logical_ids(&resumed.records));
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), 6);
}
