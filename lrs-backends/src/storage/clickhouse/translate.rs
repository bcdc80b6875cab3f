//! ClickHouse Query Translator
//!
//! `TigerStyle`: Pure functions, typed `{name:Type}` parameters only.
//!
//! Events live in one table:
//!
//! ```sql
//! CREATE TABLE xapi_events_all (
//!     event_id UUID,                      -- logical id, the tie-breaker
//!     emission_time DateTime64(6, 'UTC'),
//!     event String                        -- the statement as JSON text
//! ) ENGINE = MergeTree ORDER BY (emission_time, event_id);
//! ```
//!
//! `timestamp` maps to `emission_time`; `id` and `_id` map to `event_id`;
//! other fields are JSON paths into `event`. Equality compares the raw JSON
//! text, so a missing field never equals anything and always differs.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use lrs_core::constants::{QUERY_TIE_BREAKER_FIELD, RECORD_ID_FIELD, RECORD_TIMESTAMP_FIELD};
use lrs_core::record::parse_timestamp;
use lrs_core::{
    BackendError, BackendResult, Comparison, Cursor, Direction, Filter, NativeQuery, SortKey,
    StructuredQuery,
};

use crate::constants::{
    CLICKHOUSE_EMISSION_TIME_COLUMN, CLICKHOUSE_EVENT_COLUMN, CLICKHOUSE_EVENT_ID_COLUMN,
};

/// Keys a native query object may carry.
pub const NATIVE_KEYS_ALLOWED: &[&str] = &["where", "parameters", "sort", "limit"];

/// A statement with its named parameters, sent as `param_<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChQuery {
    /// Statement with `{name:Type}` placeholders
    pub sql: String,
    /// Parameter names and their text values
    pub params: Vec<(String, String)>,
}

impl ChQuery {
    fn bind(&mut self, kind: &str, value: String) -> String {
        let name = format!("p{}", self.params.len() + 1);
        let placeholder = format!("{{{name}:{kind}}}");
        self.params.push((name, value));
        placeholder
    }

    /// Parameters as URL query pairs.
    #[must_use]
    pub fn url_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(name, value)| (format!("param_{name}"), value.clone()))
            .collect()
    }
}

/// Backtick-quoted identifier after checking it is plain.
///
/// # Errors
/// Returns `Parameter` for anything but `[A-Za-z_][A-Za-z0-9_]*`.
pub fn quote_identifier(name: &str) -> BackendResult<String> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || !rest_ok {
        return Err(BackendError::parameter(format!(
            "invalid clickhouse identifier `{name}`"
        )));
    }
    Ok(format!("`{name}`"))
}

/// `database`.`table`
///
/// # Errors
/// Returns `Parameter` if either part is not a plain identifier.
pub fn qualified_table(database: &str, table: &str) -> BackendResult<String> {
    Ok(format!(
        "{}.{}",
        quote_identifier(database)?,
        quote_identifier(table)?
    ))
}

/// `DateTime64(6)` text form of an instant.
#[must_use]
pub fn format_datetime(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Array literal for an `Array(String)` parameter.
fn string_array(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| format!("'{}'", item.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(","))
}

/// Compact JSON text, as stored in `event`.
fn raw_json(value: &Value) -> String {
    value.to_string()
}

// =============================================================================
// Columns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column<'f> {
    EmissionTime,
    EventId,
    Json(&'f str),
}

impl<'f> Column<'f> {
    fn of(field: &'f str) -> Self {
        match field {
            RECORD_TIMESTAMP_FIELD => Self::EmissionTime,
            RECORD_ID_FIELD | QUERY_TIE_BREAKER_FIELD => Self::EventId,
            other => Self::Json(other),
        }
    }

    /// `event, {p1:String}, {p2:String}` for a JSON path.
    fn json_args(sql: &mut ChQuery, path: &str) -> String {
        let mut args = vec![CLICKHOUSE_EVENT_COLUMN.to_string()];
        for segment in path.split('.') {
            args.push(sql.bind("String", segment.to_string()));
        }
        args.join(", ")
    }
}

fn timestamp_value(value: &Value) -> BackendResult<String> {
    let parsed = match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_micros),
        _ => None,
    };
    parsed
        .map(|ts| format_datetime(&ts))
        .ok_or_else(|| BackendError::parameter(format!("invalid timestamp value {value}")))
}

fn uuid_value(value: &Value) -> Option<String> {
    value
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(|id| id.hyphenated().to_string())
}

fn range_op(op: &Comparison) -> &'static str {
    match op {
        Comparison::Gt(_) => ">",
        Comparison::Gte(_) => ">=",
        Comparison::Lt(_) => "<",
        _ => "<=",
    }
}

// =============================================================================
// Filters
// =============================================================================

fn filter_clause(sql: &mut ChQuery, filter: &Filter) -> BackendResult<String> {
    match Column::of(&filter.field) {
        Column::EmissionTime => emission_time_clause(sql, &filter.op),
        Column::EventId => event_id_clause(sql, &filter.op),
        Column::Json(path) => json_clause(sql, path, &filter.op),
    }
}

fn emission_time_clause(sql: &mut ChQuery, op: &Comparison) -> BackendResult<String> {
    let column = CLICKHOUSE_EMISSION_TIME_COLUMN;
    Ok(match op {
        Comparison::Eq(Value::Null) => "0".to_string(),
        Comparison::Ne(Value::Null) => "1".to_string(),
        Comparison::Eq(value) => {
            format!("{column} = {}", sql.bind("DateTime64(6)", timestamp_value(value)?))
        }
        Comparison::Ne(value) => {
            format!("{column} != {}", sql.bind("DateTime64(6)", timestamp_value(value)?))
        }
        Comparison::Gt(value)
        | Comparison::Gte(value)
        | Comparison::Lt(value)
        | Comparison::Lte(value) => format!(
            "{column} {} {}",
            range_op(op),
            sql.bind("DateTime64(6)", timestamp_value(value)?)
        ),
        Comparison::Contains(_) => {
            return Err(BackendError::parameter(
                "clickhouse cannot apply `contains` to `timestamp`",
            ))
        }
        Comparison::In(values) if values.is_empty() => "0".to_string(),
        Comparison::In(values) => {
            let alternatives = values
                .iter()
                .map(|value| {
                    Ok(format!(
                        "{column} = {}",
                        sql.bind("DateTime64(6)", timestamp_value(value)?)
                    ))
                })
                .collect::<BackendResult<Vec<String>>>()?;
            format!("({})", alternatives.join(" OR "))
        }
    })
}

/// Values that are not UUIDs can never match `event_id`.
fn event_id_clause(sql: &mut ChQuery, op: &Comparison) -> BackendResult<String> {
    let column = CLICKHOUSE_EVENT_ID_COLUMN;
    Ok(match op {
        Comparison::Eq(value) => match uuid_value(value) {
            Some(id) => format!("{column} = {}", sql.bind("UUID", id)),
            None => "0".to_string(),
        },
        Comparison::Ne(value) => match uuid_value(value) {
            Some(id) => format!("{column} != {}", sql.bind("UUID", id)),
            None => "1".to_string(),
        },
        Comparison::Gt(value)
        | Comparison::Gte(value)
        | Comparison::Lt(value)
        | Comparison::Lte(value) => {
            let id = uuid_value(value).ok_or_else(|| {
                BackendError::parameter(format!("clickhouse ids are UUIDs, got {value}"))
            })?;
            format!("{column} {} {}", range_op(op), sql.bind("UUID", id))
        }
        Comparison::Contains(needle) => format!(
            "position(toString({column}), {}) > 0",
            sql.bind("String", needle.clone())
        ),
        Comparison::In(values) => {
            let ids: Vec<String> = values.iter().filter_map(uuid_value).collect();
            if ids.is_empty() {
                "0".to_string()
            } else {
                format!("{column} IN {}", sql.bind("Array(UUID)", string_array(&ids)))
            }
        }
    })
}

fn json_clause(sql: &mut ChQuery, path: &str, op: &Comparison) -> BackendResult<String> {
    Ok(match op {
        Comparison::Eq(value) => {
            let args = Column::json_args(sql, path);
            format!("JSONExtractRaw({args}) = {}", sql.bind("String", raw_json(value)))
        }
        Comparison::Ne(value) => {
            let args = Column::json_args(sql, path);
            format!("JSONExtractRaw({args}) != {}", sql.bind("String", raw_json(value)))
        }
        Comparison::Gt(value)
        | Comparison::Gte(value)
        | Comparison::Lt(value)
        | Comparison::Lte(value) => {
            let args = Column::json_args(sql, path);
            let op = range_op(op);
            match value {
                Value::String(s) => format!(
                    "(JSONType({args}) = 'String' AND JSONExtractString({args}) {op} {})",
                    sql.bind("String", s.clone())
                ),
                Value::Number(n) => format!(
                    "(JSONType({args}) IN ('Int64', 'UInt64', 'Double') \
                     AND JSONExtractFloat({args}) {op} {})",
                    sql.bind("Float64", n.to_string())
                ),
                other => {
                    return Err(BackendError::parameter(format!(
                        "clickhouse range comparison needs a string or number, got {other}"
                    )))
                }
            }
        }
        Comparison::Contains(needle) => {
            let args = Column::json_args(sql, path);
            format!(
                "(JSONType({args}) = 'String' AND position(JSONExtractString({args}), {}) > 0)",
                sql.bind("String", needle.clone())
            )
        }
        Comparison::In(values) if values.is_empty() => "0".to_string(),
        Comparison::In(values) => {
            let args = Column::json_args(sql, path);
            let raw: Vec<String> = values.iter().map(raw_json).collect();
            format!(
                "JSONExtractRaw({args}) IN {}",
                sql.bind("Array(String)", string_array(&raw))
            )
        }
    })
}

// =============================================================================
// Sort and keyset
// =============================================================================

fn sort_column(key: &SortKey) -> BackendResult<&'static str> {
    match Column::of(&key.field) {
        Column::EmissionTime => Ok(CLICKHOUSE_EMISSION_TIME_COLUMN),
        Column::EventId => Ok(CLICKHOUSE_EVENT_ID_COLUMN),
        Column::Json(field) => Err(BackendError::parameter(format!(
            "clickhouse can only sort on `timestamp` and `id`, got `{field}`"
        ))),
    }
}

fn keyset_clause(sql: &mut ChQuery, sort: &[SortKey], cursor: &Cursor) -> BackendResult<String> {
    if cursor.sort_values.len() != sort.len() {
        return Err(BackendError::parameter(format!(
            "cursor has {} sort values for {} sort keys",
            cursor.sort_values.len(),
            sort.len()
        )));
    }

    let mut bound = Vec::with_capacity(sort.len());
    for (key, value) in sort.iter().zip(&cursor.sort_values) {
        let column = sort_column(key)?;
        let placeholder = if column == CLICKHOUSE_EMISSION_TIME_COLUMN {
            sql.bind("DateTime64(6)", timestamp_value(value)?)
        } else {
            let id = uuid_value(value).ok_or_else(|| {
                BackendError::parameter(format!("clickhouse cursor id is not a UUID: {value}"))
            })?;
            sql.bind("UUID", id)
        };
        bound.push((column, placeholder, key.direction));
    }

    let alternatives: Vec<String> = (0..bound.len())
        .map(|position| {
            let mut terms: Vec<String> = bound[..position]
                .iter()
                .map(|(column, placeholder, _)| format!("{column} = {placeholder}"))
                .collect();
            let (column, placeholder, direction) = &bound[position];
            let op = match direction {
                Direction::Asc => ">",
                Direction::Desc => "<",
            };
            terms.push(format!("{column} {op} {placeholder}"));
            format!("({})", terms.join(" AND "))
        })
        .collect();
    Ok(format!("({})", alternatives.join(" OR ")))
}

// =============================================================================
// Statements
// =============================================================================

/// Columns every read selects.
fn select_list() -> String {
    format!(
        "SELECT toString({CLICKHOUSE_EVENT_ID_COLUMN}) AS {CLICKHOUSE_EVENT_ID_COLUMN}, \
         {CLICKHOUSE_EVENT_COLUMN}"
    )
}

/// One keyset page of a structured query against `table` (already qualified).
///
/// # Errors
/// Returns `Parameter` for unsortable fields or uncomparable values.
pub fn select_page(
    table: &str,
    query: &StructuredQuery,
    sort: &[SortKey],
    after: Option<&Cursor>,
    size: usize,
) -> BackendResult<ChQuery> {
    let mut sql = ChQuery::default();
    let order = sort
        .iter()
        .map(|key| Ok(format!("{} {}", sort_column(key)?, key.direction.as_str().to_uppercase())))
        .collect::<BackendResult<Vec<String>>>()?;

    let mut conditions = query
        .filters
        .iter()
        .map(|filter| filter_clause(&mut sql, filter))
        .collect::<BackendResult<Vec<String>>>()?;
    if let Some(cursor) = after {
        conditions.push(keyset_clause(&mut sql, sort, cursor)?);
    }

    let mut text = format!("{} FROM {table}", select_list());
    if !conditions.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&conditions.join(" AND "));
    }
    if !order.is_empty() {
        text.push_str(" ORDER BY ");
        text.push_str(&order.join(", "));
    }
    text.push_str(&format!(" LIMIT {size} FORMAT JSONEachRow"));
    sql.sql = text;
    Ok(sql)
}

/// A native query: a `WHERE` condition, or an object with `where` (string
/// or list), `parameters`, `sort` and `limit`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeCh {
    /// Conditions joined with `AND`, verbatim
    pub conditions: Vec<String>,
    /// Caller parameters, sent as `param_<name>`
    pub parameters: Vec<(String, String)>,
    /// Ordering, verbatim; `event_id` is always appended
    pub sort: Option<String>,
    /// Total records to return
    pub limit: Option<usize>,
}

impl NativeCh {
    /// Parse a native query.
    ///
    /// # Errors
    /// Returns `Parameter` for unknown keys, mistyped values or parameter
    /// names that are not plain identifiers.
    pub fn parse(native: &NativeQuery) -> BackendResult<Self> {
        let object = match native {
            NativeQuery::Text(condition) => {
                return Ok(Self {
                    conditions: vec![condition.clone()],
                    ..Default::default()
                })
            }
            NativeQuery::Object(object) => object,
        };
        if let Some(key) = object
            .keys()
            .find(|key| !NATIVE_KEYS_ALLOWED.contains(&key.as_str()))
        {
            return Err(BackendError::parameter(format!(
                "clickhouse native query key `{key}` is not allowed"
            )));
        }

        let conditions = match object.get("where") {
            None => Vec::new(),
            Some(Value::String(condition)) => vec![condition.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(String::from).ok_or_else(|| {
                        BackendError::parameter(format!(
                            "clickhouse native `where` items must be strings, got {item}"
                        ))
                    })
                })
                .collect::<BackendResult<Vec<String>>>()?,
            Some(other) => {
                return Err(BackendError::parameter(format!(
                    "clickhouse native `where` must be a string or list, got {other}"
                )))
            }
        };
        let parameters = match object.get("parameters") {
            None => Vec::new(),
            Some(Value::Object(parameters)) => parameters
                .iter()
                .map(|(name, value)| {
                    quote_identifier(name)?;
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Ok((name.clone(), text))
                })
                .collect::<BackendResult<Vec<(String, String)>>>()?,
            Some(other) => {
                return Err(BackendError::parameter(format!(
                    "clickhouse native `parameters` must be an object, got {other}"
                )))
            }
        };
        let sort = match object.get("sort") {
            None => None,
            Some(Value::String(sort)) => Some(sort.clone()),
            Some(other) => {
                return Err(BackendError::parameter(format!(
                    "clickhouse native `sort` must be a string, got {other}"
                )))
            }
        };
        let limit = match object.get("limit") {
            None => None,
            Some(limit) => Some(
                limit
                    .as_u64()
                    .and_then(|l| usize::try_from(l).ok())
                    .ok_or_else(|| {
                        BackendError::parameter(format!(
                            "clickhouse native `limit` {limit} is invalid"
                        ))
                    })?,
            ),
        };
        Ok(Self {
            conditions,
            parameters,
            sort,
            limit,
        })
    }

    /// One offset page of this query against `table` (already qualified).
    #[must_use]
    pub fn select_page(&self, table: &str, offset: usize, size: usize) -> ChQuery {
        let mut text = format!("{} FROM {table}", select_list());
        if !self.conditions.is_empty() {
            let conditions: Vec<String> =
                self.conditions.iter().map(|c| format!("({c})")).collect();
            text.push_str(" WHERE ");
            text.push_str(&conditions.join(" AND "));
        }
        match &self.sort {
            Some(sort) => text.push_str(&format!(" ORDER BY {sort}, {CLICKHOUSE_EVENT_ID_COLUMN}")),
            None => text.push_str(&format!(" ORDER BY {CLICKHOUSE_EVENT_ID_COLUMN}")),
        }
        text.push_str(&format!(" LIMIT {size} OFFSET {offset} FORMAT JSONEachRow"));
        ChQuery {
            sql: text,
            params: self.parameters.clone(),
        }
    }
}

/// Event ids of `ids` already stored in `table` (already qualified).
#[must_use]
pub fn select_existing(table: &str, ids: &[String]) -> ChQuery {
    let mut sql = ChQuery::default();
    let placeholder = sql.bind("Array(UUID)", string_array(ids));
    sql.sql = format!(
        "SELECT toString({CLICKHOUSE_EVENT_ID_COLUMN}) AS {CLICKHOUSE_EVENT_ID_COLUMN} \
         FROM {table} WHERE {CLICKHOUSE_EVENT_ID_COLUMN} IN {placeholder} FORMAT JSONEachRow"
    );
    sql
}

/// Mutation removing the rows of `ids` from `table` (already qualified).
#[must_use]
pub fn delete_existing(table: &str, ids: &[String]) -> ChQuery {
    let mut sql = ChQuery::default();
    let placeholder = sql.bind("Array(UUID)", string_array(ids));
    sql.sql = format!("ALTER TABLE {table} DELETE WHERE {CLICKHOUSE_EVENT_ID_COLUMN} IN {placeholder}");
    sql
}

/// `INSERT` statement; rows follow in the request body.
#[must_use]
pub fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} ({CLICKHOUSE_EVENT_ID_COLUMN}, {CLICKHOUSE_EMISSION_TIME_COLUMN}, \
         {CLICKHOUSE_EVENT_COLUMN}) FORMAT JSONEachRow"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID: &str = "8f9c7b2e-63a1-4d4e-9a53-5b1f1c0d2e3f";

    fn structured(filters: Vec<Filter>) -> StructuredQuery {
        StructuredQuery {
            filters,
            ..Default::default()
        }
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(qualified_table("xapi", "events").unwrap(), "`xapi`.`events`");
        assert!(quote_identifier("a`b").unwrap_err().is_parameter());
        assert!(qualified_table("xapi", "x; DROP").is_err());
    }

    #[test]
    fn test_json_equality_compares_raw_text() {
        let query = structured(vec![Filter::new("verb.id", Comparison::Eq(json!("http://x")))]);
        let sql = select_page("`xapi`.`t`", &query, &[], None, 10).unwrap();
        assert_eq!(
            sql.sql,
            "SELECT toString(event_id) AS event_id, event FROM `xapi`.`t` \
             WHERE JSONExtractRaw(event, {p1:String}, {p2:String}) = {p3:String} \
             LIMIT 10 FORMAT JSONEachRow"
        );
        assert_eq!(
            sql.url_params(),
            vec![
                ("param_p1".to_string(), "verb".to_string()),
                ("param_p2".to_string(), "id".to_string()),
                ("param_p3".to_string(), "\"http://x\"".to_string()),
            ]
        );
    }

    #[test]
    fn test_timestamp_and_id_filters() {
        let query = structured(vec![
            Filter::new("timestamp", Comparison::Gt(json!("2024-01-01T00:00:00Z"))),
            Filter::new("id", Comparison::In(vec![json!(ID), json!("not-a-uuid")])),
            Filter::new("id", Comparison::Eq(json!("not-a-uuid"))),
        ]);
        let sql = select_page("t", &query, &[], None, 5).unwrap();
        assert!(sql.sql.contains("emission_time > {p1:DateTime64(6)}"));
        assert!(sql.sql.contains("event_id IN {p2:Array(UUID)}"));
        assert!(sql.sql.contains(" AND 0 "));
        assert_eq!(sql.params[0].1, "2024-01-01 00:00:00.000000");
        assert_eq!(sql.params[1].1, format!("['{ID}']"));
    }

    #[test]
    fn test_only_timestamp_and_id_sort() {
        let sort = vec![
            SortKey::new("timestamp", Direction::Desc),
            SortKey::tie_breaker(Direction::Desc),
        ];
        let sql = select_page("t", &StructuredQuery::default(), &sort, None, 2).unwrap();
        assert!(sql.sql.ends_with("ORDER BY emission_time DESC, event_id DESC LIMIT 2 FORMAT JSONEachRow"));

        let bad = vec![SortKey::new("verb.id", Direction::Asc)];
        let err = select_page("t", &StructuredQuery::default(), &bad, None, 2).unwrap_err();
        assert!(err.is_parameter());
    }

    #[test]
    fn test_keyset_uses_typed_params() {
        let sort = vec![
            SortKey::new("timestamp", Direction::Asc),
            SortKey::tie_breaker(Direction::Asc),
        ];
        let cursor = Cursor::new(vec![json!(1_704_067_200_000_000_i64), json!(ID)]);
        let sql = select_page("t", &StructuredQuery::default(), &sort, Some(&cursor), 2).unwrap();
        assert!(sql.sql.contains(
            "((emission_time > {p1:DateTime64(6)}) OR \
             (emission_time = {p1:DateTime64(6)} AND event_id > {p2:UUID}))"
        ));
        assert_eq!(sql.params[0].1, "2024-01-01 00:00:00.000000");

        let bad = Cursor::new(vec![json!(1), json!("nope")]);
        assert!(select_page("t", &StructuredQuery::default(), &sort, Some(&bad), 2).is_err());
    }

    #[test]
    fn test_range_and_contains_on_json() {
        let query = structured(vec![
            Filter::new("result.score.raw", Comparison::Gte(json!(50))),
            Filter::new("object.id", Comparison::Contains("course".into())),
        ]);
        let sql = select_page("t", &query, &[], None, 1).unwrap();
        assert!(sql.sql.contains("JSONExtractFloat("));
        assert!(sql.sql.contains("position(JSONExtractString("));

        let bad = structured(vec![Filter::new("x", Comparison::Lt(json!([1])))]);
        assert!(select_page("t", &bad, &[], None, 1).unwrap_err().is_parameter());
    }

    #[test]
    fn test_delete_existing_binds_ids() {
        let sql = delete_existing("`xapi`.`t`", &[ID.to_string()]);
        assert_eq!(
            sql.sql,
            "ALTER TABLE `xapi`.`t` DELETE WHERE event_id IN {p1:Array(UUID)}"
        );
        assert_eq!(sql.params[0].1, format!("['{ID}']"));
    }

    #[test]
    fn test_string_array_escapes_quotes() {
        assert_eq!(
            string_array(&["a'b".to_string(), "c\\d".to_string()]),
            r"['a\'b','c\\d']"
        );
    }

    #[test]
    fn test_native_parse_and_page() {
        let mut object = lrs_core::Document::new();
        object.insert("where".into(), json!(["event_id = {id:UUID}", "1 = 1"]));
        object.insert("parameters".into(), json!({ "id": ID }));
        object.insert("sort".into(), json!("emission_time DESC"));
        object.insert("limit".into(), json!(3));
        let native = NativeCh::parse(&NativeQuery::Object(object)).unwrap();
        assert_eq!(native.limit, Some(3));

        let sql = native.select_page("t", 4, 2);
        assert_eq!(
            sql.sql,
            "SELECT toString(event_id) AS event_id, event FROM t \
             WHERE (event_id = {id:UUID}) AND (1 = 1) \
             ORDER BY emission_time DESC, event_id LIMIT 2 OFFSET 4 FORMAT JSONEachRow"
        );
        assert_eq!(sql.url_params(), vec![("param_id".to_string(), ID.to_string())]);

        let mut bad = lrs_core::Document::new();
        bad.insert("select".into(), json!("*"));
        assert!(NativeCh::parse(&NativeQuery::Object(bad)).unwrap_err().is_parameter());
    }

    #[test]
    fn test_write_statements() {
        let existing = select_existing("t", &[ID.to_string()]);
        assert!(existing.sql.contains("event_id IN {p1:Array(UUID)}"));
        assert_eq!(
            insert_statement("`xapi`.`t`"),
            "INSERT INTO `xapi`.`t` (event_id, emission_time, event) FORMAT JSONEachRow"
        );
    }
}
