//! Local Evaluation - Queries Over In-Memory Documents
//!
//! `TigerStyle`: Exact semantics, no engine in the loop.
//!
//! Engines without a query language of their own (filesystem, object
//! store, simulation) load candidate documents and evaluate the neutral
//! query here. The same ordering rules back keyset comparisons.

use std::cmp::Ordering;

use serde_json::Value;

use crate::constants::{QUERY_TIE_BREAKER_FIELD, RECORD_TIMESTAMP_FIELD, TIME_US_PER_SEC};
use crate::cursor::Cursor;
use crate::error::{BackendError, BackendResult};
use crate::query::{Comparison, Direction, Filter, SortKey, StructuredQuery};
use crate::record::{field_value, parse_timestamp, Document, Record};

// =============================================================================
// Value ordering
// =============================================================================

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
///
/// Values of different types order by type (null, bool, number, string,
/// array, object); numbers compare numerically.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Ordering {
    if let (Some(l), Some(r)) = (x.as_i64(), y.as_i64()) {
        return l.cmp(&r);
    }
    if let (Some(l), Some(r)) = (x.as_u64(), y.as_u64()) {
        return l.cmp(&r);
    }
    let l = x.as_f64().unwrap_or(f64::NAN);
    let r = y.as_f64().unwrap_or(f64::NAN);
    l.total_cmp(&r)
}

/// Compare two sort tuples under per-key directions.
#[must_use]
pub fn compare_tuples(a: &[Value], b: &[Value], sort: &[SortKey]) -> Ordering {
    for ((l, r), key) in a.iter().zip(b).zip(sort) {
        let ord = compare_values(l, r);
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// True when `tuple` sorts strictly after `cursor` under `sort`.
#[must_use]
pub fn is_after(tuple: &[Value], cursor: &[Value], sort: &[SortKey]) -> bool {
    compare_tuples(tuple, cursor, sort) == Ordering::Greater
}

// =============================================================================
// Sort values
// =============================================================================

/// Comparable value of `field` in a document.
///
/// `timestamp` is normalised to epoch microseconds so offsets compare
/// chronologically; missing fields yield `null`.
#[must_use]
pub fn sort_value(document: &Document, field: &str) -> Value {
    match field_value(document, field) {
        Some(Value::String(raw)) if field == RECORD_TIMESTAMP_FIELD => {
            match parse_timestamp(raw) {
                Some(ts) => Value::from(
                    ts.timestamp() * TIME_US_PER_SEC + i64::from(ts.timestamp_subsec_micros()),
                ),
                None => Value::String(raw.clone()),
            }
        }
        Some(value) => value.clone(),
        None => Value::Null,
    }
}

/// Effective sort tuple of a stored document.
#[must_use]
pub fn sort_tuple(id: &str, document: &Document, sort: &[SortKey]) -> Vec<Value> {
    sort.iter()
        .map(|key| {
            if key.field == QUERY_TIE_BREAKER_FIELD {
                Value::String(id.to_string())
            } else {
                sort_value(document, &key.field)
            }
        })
        .collect()
}

// =============================================================================
// Filters
// =============================================================================

/// Evaluate one filter against a document.
///
/// # Errors
/// Returns `Parameter` when a `timestamp` comparison value is not RFC 3339.
pub fn matches_filter(document: &Document, filter: &Filter) -> BackendResult<bool> {
    let field = filter.field.as_str();
    let actual = field_value(document, field);

    if field == RECORD_TIMESTAMP_FIELD && !matches!(filter.op, Comparison::Contains(_)) {
        return matches_timestamp(actual, &filter.op);
    }

    Ok(match (&filter.op, actual) {
        (Comparison::Ne(_), None) => true,
        (_, None) => false,
        (Comparison::Eq(expected), Some(v)) => values_equal(v, expected),
        (Comparison::Ne(expected), Some(v)) => !values_equal(v, expected),
        (Comparison::In(options), Some(v)) => options.iter().any(|o| values_equal(v, o)),
        (Comparison::Contains(needle), Some(Value::String(s))) => s.contains(needle.as_str()),
        (Comparison::Contains(_), Some(_)) => false,
        (op, Some(v)) => range_holds(v, op),
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal
}

fn range_holds(actual: &Value, op: &Comparison) -> bool {
    let expected = match op {
        Comparison::Gt(e) | Comparison::Gte(e) | Comparison::Lt(e) | Comparison::Lte(e) => e,
        _ => return false,
    };
    // Ranges only compare like with like.
    let comparable = matches!(
        (actual, expected),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    );
    comparable && ordering_satisfies(compare_values(actual, expected), op)
}

fn ordering_satisfies(ord: Ordering, op: &Comparison) -> bool {
    match op {
        Comparison::Eq(_) => ord == Ordering::Equal,
        Comparison::Gt(_) => ord == Ordering::Greater,
        Comparison::Gte(_) => ord != Ordering::Less,
        Comparison::Lt(_) => ord == Ordering::Less,
        Comparison::Lte(_) => ord != Ordering::Greater,
        _ => false,
    }
}

fn matches_timestamp(actual: Option<&Value>, op: &Comparison) -> BackendResult<bool> {
    let parse_expected = |value: &Value| {
        value.as_str().and_then(parse_timestamp).ok_or_else(|| {
            BackendError::parameter(format!("`timestamp` filter value {value} is not RFC 3339"))
        })
    };
    let actual = actual.and_then(Value::as_str).and_then(parse_timestamp);

    Ok(match op {
        Comparison::In(options) => {
            let options = options
                .iter()
                .map(parse_expected)
                .collect::<BackendResult<Vec<_>>>()?;
            actual.is_some_and(|a| options.contains(&a))
        }
        Comparison::Ne(expected) => {
            let expected = parse_expected(expected)?;
            actual.map_or(true, |a| a != expected)
        }
        Comparison::Eq(e)
        | Comparison::Gt(e)
        | Comparison::Gte(e)
        | Comparison::Lt(e)
        | Comparison::Lte(e) => {
            let expected = parse_expected(e)?;
            let Some(actual) = actual else {
                return Ok(false);
            };
            ordering_satisfies(actual.cmp(&expected), op)
        }
        Comparison::Contains(_) => false,
    })
}

/// Evaluate all filters (conjunction).
///
/// # Errors
/// Propagates [`matches_filter`] errors.
pub fn matches_all(document: &Document, filters: &[Filter]) -> BackendResult<bool> {
    for filter in filters {
        if !matches_filter(document, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Page selection
// =============================================================================

/// Matching candidates as records in `sort` order, each carrying its tuple.
///
/// `sort` must already carry the tie-breaker. No projection is applied.
///
/// # Errors
/// Propagates filter evaluation errors.
pub fn sorted_matches<I>(
    candidates: I,
    filters: &[Filter],
    sort: &[SortKey],
) -> BackendResult<Vec<Record>>
where
    I: IntoIterator<Item = (String, Document)>,
{
    let mut selected = Vec::new();
    for (id, document) in candidates {
        if matches_all(&document, filters)? {
            let tuple = sort_tuple(&id, &document, sort);
            selected.push(Record::new(id, document).with_sort_values(tuple));
        }
    }
    selected.sort_by(|a, b| compare_tuples(&a.sort_values, &b.sort_values, sort));
    Ok(selected)
}

/// Up to `size` records of `sorted` strictly after `after`, projected.
///
/// `sorted` must be the output of [`sorted_matches`] for the same `sort`.
#[must_use]
pub fn page_after(
    sorted: &[Record],
    query: &StructuredQuery,
    sort: &[SortKey],
    after: Option<&Cursor>,
    size: usize,
) -> Vec<Record> {
    let start = after.map_or(0, |cursor| {
        sorted.partition_point(|record| !is_after(&record.sort_values, &cursor.sort_values, sort))
    });
    sorted[start..]
        .iter()
        .take(size)
        .cloned()
        .map(|mut record| {
            if let Some(projection) = &query.projection {
                record.document = projection.apply(std::mem::take(&mut record.document));
            }
            record
        })
        .collect()
}

/// Select one page of records from candidate `(id, document)` pairs.
///
/// Applies the filters, orders by `sort` (which must already carry the
/// tie-breaker), keeps records strictly after `after`, takes `size` and
/// applies the projection last.
///
/// # Errors
/// Propagates filter evaluation errors.
pub fn select_page<I>(
    candidates: I,
    query: &StructuredQuery,
    sort: &[SortKey],
    after: Option<&Cursor>,
    size: usize,
) -> BackendResult<Vec<Record>>
where
    I: IntoIterator<Item = (String, Document)>,
{
    let sorted = sorted_matches(candidates, &query.filters, sort)?;
    Ok(page_after(&sorted, query, sort, after, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    #[test]
    fn test_compare_values_cross_type() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Less);
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!(-3), &json!(2.5)), Ordering::Less);
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }

    #[test]
    fn test_compare_tuples_mixed_directions() {
        let sort = vec![
            SortKey::new("a", Direction::Desc),
            SortKey::new("b", Direction::Asc),
        ];
        let x = vec![json!(2), json!("a")];
        let y = vec![json!(2), json!("b")];
        let z = vec![json!(1), json!("a")];
        assert_eq!(compare_tuples(&x, &y, &sort), Ordering::Less);
        assert_eq!(compare_tuples(&x, &z, &sort), Ordering::Less);
        assert!(is_after(&z, &y, &sort));
        assert!(!is_after(&x, &x, &sort));
    }

    #[test]
    fn test_timestamp_sort_value_is_chronological() {
        let early = doc(json!({"timestamp": "2024-01-01T10:00:00+02:00"}));
        let late = doc(json!({"timestamp": "2024-01-01T09:00:00Z"}));
        let a = sort_value(&early, "timestamp");
        let b = sort_value(&late, "timestamp");
        // lexicographically "10:00+02:00" > "09:00Z", chronologically earlier
        assert_eq!(compare_values(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_filters_are_exact() {
        let document = doc(json!({
            "id": "s1",
            "timestamp": "2024-01-01T00:00:00Z",
            "score": 5,
            "verb": {"id": "completed"}
        }));

        let check = |field: &str, op: Comparison| {
            matches_filter(&document, &Filter::new(field, op)).unwrap()
        };

        assert!(check("verb.id", Comparison::Eq(json!("completed"))));
        assert!(!check("verb.id", Comparison::Eq(json!("complete"))));
        assert!(check("verb.id", Comparison::Contains("plet".into())));
        assert!(check("score", Comparison::Gte(json!(5))));
        assert!(!check("score", Comparison::Gt(json!("4"))));
        assert!(check("score", Comparison::In(vec![json!(1), json!(5)])));
        assert!(check("missing", Comparison::Ne(json!("x"))));
        assert!(!check("missing", Comparison::Eq(json!(null))));
        assert!(!check("timestamp", Comparison::Gt(json!("2023-12-31T23:00:00-02:00"))));
        assert!(check("timestamp", Comparison::Lte(json!("2024-01-01T00:00:00+00:00"))));
    }

    #[test]
    fn test_timestamp_filter_rejects_garbage() {
        let document = doc(json!({"timestamp": "2024-01-01T00:00:00Z"}));
        let filter = Filter::new("timestamp", Comparison::Gt(json!("soon")));
        let err = matches_filter(&document, &filter).unwrap_err();
        assert!(err.is_parameter());
    }

    #[test]
    fn test_select_page_keyset() {
        let sort = vec![
            SortKey::new("timestamp", Direction::Asc),
            SortKey::tie_breaker(Direction::Asc),
        ];
        let candidates = vec![
            ("c".to_string(), doc(json!({"timestamp": "2024-01-01T00:00:00Z"}))),
            ("a".to_string(), doc(json!({"timestamp": "2024-01-01T00:00:00Z"}))),
            ("b".to_string(), doc(json!({"timestamp": "2024-01-01T00:00:00Z"}))),
        ];
        let query = StructuredQuery::default();

        let first = select_page(candidates.clone(), &query, &sort, None, 2).unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let cursor = Cursor::new(first[1].sort_values.clone());
        let second = select_page(candidates, &query, &sort, Some(&cursor), 2).unwrap();
        let ids: Vec<_> = second.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn test_page_after_resumes_between_records() {
        let sort = vec![
            SortKey::new("n", Direction::Desc),
            SortKey::tie_breaker(Direction::Desc),
        ];
        let candidates = (0..5).map(|n| (format!("s{n}"), doc(json!({"n": n * 2, "x": n}))));
        let sorted = sorted_matches(candidates, &[], &sort).unwrap();
        let query = StructuredQuery {
            projection: Some(crate::query::Projection::Include(vec!["n".into()])),
            ..Default::default()
        };

        // Position of a record that is no longer there: n = 5.
        let cursor = Cursor::new(vec![json!(5), json!("gone")]);
        let page = page_after(&sorted, &query, &sort, Some(&cursor), 2);
        let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert!(page[0].document.get("x").is_none());
        assert_eq!(sorted[0].document["x"], json!(4));

        let past_end = Cursor::new(sorted[4].sort_values.clone());
        assert!(page_after(&sorted, &query, &sort, Some(&past_end), 2).is_empty());
    }
}
