//! Elasticsearch Query Translator
//!
//! `TigerStyle`: Pure functions from the neutral query to the Query DSL.
//!
//! | Neutral                   | Query DSL                                   |
//! |---------------------------|---------------------------------------------|
//! | `eq` string               | `term` on `<field>.keyword`                 |
//! | `eq` number / bool        | `term` on `<field>`                         |
//! | `eq` / `ne` null          | `exists` (negated for `eq`)                 |
//! | `ne`                      | `must_not` of the `eq` clause               |
//! | `gt` `gte` `lt` `lte`     | `range`                                     |
//! | `contains`                | `wildcard` with escaped value               |
//! | `in`                      | `terms`                                     |
//! | field `id`                | `_id` (`eq`, `ne`, `in` only)               |
//! | tie-breaker `_id`         | `_shard_doc` under a point in time          |
//!
//! Date fields are queried on the field itself, never on `.keyword`.

use serde_json::{json, Value};

use lrs_core::constants::RECORD_ID_FIELD;
use lrs_core::{
    BackendError, BackendResult, Comparison, Direction, Document, Filter, NativeQuery,
    Projection, SortKey,
};

use crate::constants::{ES_KEYWORD_SUFFIX, ES_TIE_BREAKER_FIELD};

/// Keys a native query object may carry.
pub const NATIVE_KEYS_ALLOWED: &[&str] = &["query", "sort", "_source", "size"];

/// Translator bound to one index layout.
#[derive(Debug, Clone, Default)]
pub struct EsTranslator {
    date_fields: Vec<String>,
}

/// Clauses of a `bool` query.
#[derive(Debug, Default, PartialEq)]
struct BoolClauses {
    filter: Vec<Value>,
    must_not: Vec<Value>,
}

impl EsTranslator {
    /// Create a translator; `date_fields` are queried without `.keyword`.
    #[must_use]
    pub fn new(date_fields: Vec<String>) -> Self {
        Self { date_fields }
    }

    fn is_date(&self, field: &str) -> bool {
        self.date_fields.iter().any(|f| f == field)
    }

    /// Engine field for exact matches on `value`.
    fn exact_field(&self, field: &str, value: &Value) -> BackendResult<String> {
        if field == RECORD_ID_FIELD {
            return Ok("_id".to_string());
        }
        match value {
            Value::String(_) if self.is_date(field) => Ok(field.to_string()),
            Value::String(_) => Ok(format!("{field}{ES_KEYWORD_SUFFIX}")),
            Value::Number(_) | Value::Bool(_) => Ok(field.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => Err(BackendError::parameter(
                format!("es cannot compare `{field}` with {value}"),
            )),
        }
    }

    fn term(&self, field: &str, value: &Value) -> BackendResult<Value> {
        let engine_field = self.exact_field(field, value)?;
        Ok(json!({ "term": { engine_field: value } }))
    }

    fn add_filter(&self, clauses: &mut BoolClauses, filter: &Filter) -> BackendResult<()> {
        let field = filter.field.as_str();
        // `_id` only answers term and terms queries.
        if field == RECORD_ID_FIELD
            && !matches!(
                filter.op,
                Comparison::Eq(_) | Comparison::Ne(_) | Comparison::In(_)
            )
        {
            return Err(BackendError::parameter(format!(
                "es cannot apply `{}` to `{field}`",
                filter.op.name()
            )));
        }
        match &filter.op {
            Comparison::Eq(Value::Null) => clauses
                .must_not
                .push(json!({ "exists": { "field": field } })),
            Comparison::Ne(Value::Null) => {
                clauses.filter.push(json!({ "exists": { "field": field } }));
            }
            Comparison::Eq(value) => clauses.filter.push(self.term(field, value)?),
            Comparison::Ne(value) => clauses.must_not.push(self.term(field, value)?),
            Comparison::Gt(value)
            | Comparison::Gte(value)
            | Comparison::Lt(value)
            | Comparison::Lte(value) => {
                if !matches!(value, Value::String(_) | Value::Number(_)) {
                    return Err(BackendError::parameter(format!(
                        "es range on `{field}` needs a string or number, got {value}"
                    )));
                }
                let engine_field = self.exact_field(field, value)?;
                clauses
                    .filter
                    .push(json!({ "range": { engine_field: { filter.op.name(): value } } }));
            }
            Comparison::Contains(needle) => {
                let engine_field = self.exact_field(field, &Value::String(String::new()))?;
                let pattern = format!("*{}*", escape_wildcard(needle));
                clauses
                    .filter
                    .push(json!({ "wildcard": { engine_field: { "value": pattern } } }));
            }
            Comparison::In(values) => {
                let first = values.first().ok_or_else(|| {
                    BackendError::parameter(format!("`in` filter on `{field}` is empty"))
                })?;
                let engine_field = self.exact_field(field, first)?;
                for value in values {
                    if self.exact_field(field, value)? != engine_field {
                        return Err(BackendError::parameter(format!(
                            "es `in` filter on `{field}` mixes value types"
                        )));
                    }
                }
                clauses
                    .filter
                    .push(json!({ "terms": { engine_field: values } }));
            }
        }
        Ok(())
    }

    /// `query` clause for a conjunction of filters.
    ///
    /// # Errors
    /// Returns `Parameter` for comparisons the index cannot express exactly.
    pub fn query_clause(&self, filters: &[Filter]) -> BackendResult<Value> {
        if filters.is_empty() {
            return Ok(json!({ "match_all": {} }));
        }
        let mut clauses = BoolClauses::default();
        for filter in filters {
            self.add_filter(&mut clauses, filter)?;
        }
        let mut bool_query = serde_json::Map::new();
        if !clauses.filter.is_empty() {
            bool_query.insert("filter".into(), Value::Array(clauses.filter));
        }
        if !clauses.must_not.is_empty() {
            bool_query.insert("must_not".into(), Value::Array(clauses.must_not));
        }
        Ok(json!({ "bool": bool_query }))
    }

    /// `sort` clause for an effective sort.
    #[must_use]
    pub fn sort_clause(&self, sort: &[SortKey]) -> Vec<Value> {
        sort.iter()
            .map(|key| {
                let field = if key.is_tie_breaker() {
                    ES_TIE_BREAKER_FIELD.to_string()
                } else if self.is_date(&key.field) {
                    key.field.clone()
                } else {
                    format!("{}{ES_KEYWORD_SUFFIX}", key.field)
                };
                json!({ field: { "order": key.direction.as_str() } })
            })
            .collect()
    }

    /// Native query object or string as a search body template.
    ///
    /// Returns the template and the `size` it requests, if any.
    ///
    /// # Errors
    /// Returns `Parameter` for keys outside [`NATIVE_KEYS_ALLOWED`] or a
    /// `size` that is not a non-negative integer.
    pub fn native_template(native: &NativeQuery) -> BackendResult<(Document, Option<usize>)> {
        match native {
            NativeQuery::Text(text) => {
                let mut body = Document::new();
                body.insert(
                    "query".into(),
                    json!({ "query_string": { "query": text } }),
                );
                Ok((body, None))
            }
            NativeQuery::Object(object) => {
                if let Some(key) = object
                    .keys()
                    .find(|key| !NATIVE_KEYS_ALLOWED.contains(&key.as_str()))
                {
                    return Err(BackendError::parameter(format!(
                        "es native query key `{key}` is not allowed"
                    )));
                }
                let mut body = object.clone();
                let size = match body.remove("size") {
                    None => None,
                    Some(size) => Some(
                        size.as_u64()
                            .and_then(|s| usize::try_from(s).ok())
                            .ok_or_else(|| {
                                BackendError::parameter(format!("es `size` {size} is invalid"))
                            })?,
                    ),
                };
                Ok((body, size))
            }
        }
    }
}

/// `_source` clause for a projection.
#[must_use]
pub fn source_clause(projection: &Projection) -> Value {
    match projection {
        Projection::Include(fields) => json!({ "includes": fields }),
        Projection::Exclude(fields) => json!({ "excludes": fields }),
    }
}

/// Sort clause of a native template with the tie-breaker appended.
///
/// # Errors
/// Returns `Parameter` if the template's `sort` is not a string or list.
pub fn native_sort(template: &Document) -> BackendResult<Vec<Value>> {
    let mut sort = match template.get("sort") {
        None => Vec::new(),
        Some(Value::Array(keys)) => keys.clone(),
        Some(key @ (Value::String(_) | Value::Object(_))) => vec![key.clone()],
        Some(other) => {
            return Err(BackendError::parameter(format!(
                "es native `sort` must be a string, object or list, got {other}"
            )))
        }
    };
    let has_tie_breaker = sort.iter().any(|key| match key {
        Value::String(name) => name == ES_TIE_BREAKER_FIELD,
        Value::Object(map) => map.contains_key(ES_TIE_BREAKER_FIELD),
        _ => false,
    });
    if !has_tie_breaker {
        let direction = sort
            .first()
            .and_then(Value::as_object)
            .and_then(|map| map.values().next())
            .and_then(|options| options.get("order"))
            .and_then(Value::as_str)
            .filter(|order| *order == Direction::Desc.as_str())
            .map_or(Direction::Asc, |_| Direction::Desc);
        sort.push(json!({ ES_TIE_BREAKER_FIELD: { "order": direction.as_str() } }));
    }
    Ok(sort)
}

fn escape_wildcard(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrs_core::pagination::effective_sort;

    fn translator() -> EsTranslator {
        EsTranslator::new(vec!["timestamp".to_string()])
    }

    #[test]
    fn test_empty_filters_match_all() {
        assert_eq!(
            translator().query_clause(&[]).unwrap(),
            json!({ "match_all": {} })
        );
    }

    #[test]
    fn test_statement_filters() {
        let filters = vec![
            Filter::new("id", Comparison::Eq(json!("abc"))),
            Filter::new("verb.id", Comparison::Eq(json!("completed"))),
            Filter::new("timestamp", Comparison::Gt(json!("2024-01-01T00:00:00Z"))),
            Filter::new("result.score.raw", Comparison::Lte(json!(10))),
            Filter::new("actor.mbox", Comparison::Ne(json!("mailto:x@example.com"))),
        ];
        let query = translator().query_clause(&filters).unwrap();
        assert_eq!(
            query,
            json!({ "bool": {
                "filter": [
                    { "term": { "_id": "abc" } },
                    { "term": { "verb.id.keyword": "completed" } },
                    { "range": { "timestamp": { "gt": "2024-01-01T00:00:00Z" } } },
                    { "range": { "result.score.raw": { "lte": 10 } } }
                ],
                "must_not": [
                    { "term": { "actor.mbox.keyword": "mailto:x@example.com" } }
                ]
            }})
        );
    }

    #[test]
    fn test_null_comparisons_use_exists() {
        let query = translator()
            .query_clause(&[
                Filter::new("context", Comparison::Eq(Value::Null)),
                Filter::new("result", Comparison::Ne(Value::Null)),
            ])
            .unwrap();
        assert_eq!(
            query,
            json!({ "bool": {
                "filter": [{ "exists": { "field": "result" } }],
                "must_not": [{ "exists": { "field": "context" } }]
            }})
        );
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let query = translator()
            .query_clause(&[Filter::new("object.id", Comparison::Contains("a*b?".into()))])
            .unwrap();
        assert_eq!(
            query["bool"]["filter"][0],
            json!({ "wildcard": { "object.id.keyword": { "value": "*a\\*b\\?*" } } })
        );
    }

    #[test]
    fn test_in_on_ids_and_mixed_types() {
        let t = translator();
        let query = t
            .query_clause(&[Filter::new("id", Comparison::In(vec![json!("a"), json!("b")]))])
            .unwrap();
        assert_eq!(query["bool"]["filter"][0], json!({ "terms": { "_id": ["a", "b"] } }));

        let err = t
            .query_clause(&[Filter::new("x", Comparison::In(vec![json!("a"), json!(1)]))])
            .unwrap_err();
        assert!(err.is_parameter());
    }

    #[test]
    fn test_id_rejects_range_and_contains() {
        let t = translator();
        for op in [
            Comparison::Gt(json!("a")),
            Comparison::Lte(json!("z")),
            Comparison::Contains("ab".into()),
        ] {
            let err = t.query_clause(&[Filter::new("id", op)]).unwrap_err();
            assert!(err.is_parameter());
        }
        let query = t
            .query_clause(&[Filter::new("id", Comparison::Ne(json!("a")))])
            .unwrap();
        assert_eq!(query["bool"]["must_not"][0], json!({ "term": { "_id": "a" } }));
    }

    #[test]
    fn test_untranslatable_values_are_parameter_errors() {
        let t = translator();
        let err = t
            .query_clause(&[Filter::new("x", Comparison::Eq(json!({"a": 1})))])
            .unwrap_err();
        assert!(err.is_parameter());
        let err = t
            .query_clause(&[Filter::new("x", Comparison::Gt(json!(true)))])
            .unwrap_err();
        assert!(err.is_parameter());
    }

    #[test]
    fn test_sort_uses_shard_doc_tie_breaker() {
        let sort = effective_sort(&[SortKey::new("timestamp", Direction::Desc)]);
        assert_eq!(
            translator().sort_clause(&sort),
            vec![
                json!({ "timestamp": { "order": "desc" } }),
                json!({ "_shard_doc": { "order": "desc" } }),
            ]
        );
    }

    #[test]
    fn test_native_templates() {
        let (body, size) =
            EsTranslator::native_template(&NativeQuery::Text("verb.id:completed".into())).unwrap();
        assert_eq!(body["query"]["query_string"]["query"], "verb.id:completed");
        assert!(size.is_none());

        let mut object = Document::new();
        object.insert("query".into(), json!({ "match_all": {} }));
        object.insert("size".into(), json!(5));
        let (body, size) = EsTranslator::native_template(&NativeQuery::Object(object)).unwrap();
        assert_eq!(size, Some(5));
        assert!(!body.contains_key("size"));

        let mut bad = Document::new();
        bad.insert("aggs".into(), json!({}));
        let err = EsTranslator::native_template(&NativeQuery::Object(bad)).unwrap_err();
        assert!(err.is_parameter());
    }

    #[test]
    fn test_native_sort_appends_tie_breaker() {
        let mut template = Document::new();
        template.insert("sort".into(), json!([{ "timestamp": { "order": "desc" } }]));
        let sort = native_sort(&template).unwrap();
        assert_eq!(sort[1], json!({ "_shard_doc": { "order": "desc" } }));

        template.insert("sort".into(), json!("_shard_doc"));
        assert_eq!(native_sort(&template).unwrap(), vec![json!("_shard_doc")]);
    }

    #[test]
    fn test_source_clause() {
        assert_eq!(
            source_clause(&Projection::Include(vec!["id".into()])),
            json!({ "includes": ["id"] })
        );
    }
}
