//! PostgreSQL Query Translator
//!
//! `TigerStyle`: Pure functions, every value bound as a parameter.
//!
//! Statements live in one table per target:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS statements (
//!     doc_id TEXT PRIMARY KEY,          -- physical id, the tie-breaker
//!     statement_id TEXT NOT NULL,       -- logical `id`
//!     emission_time TIMESTAMPTZ NOT NULL,
//!     document JSONB NOT NULL
//! );
//! ```
//!
//! `timestamp`, `id` and `_id` map to typed columns; every other field is
//! a JSON path into `document`, with missing paths read as JSON `null`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use lrs_core::constants::{QUERY_TIE_BREAKER_FIELD, RECORD_ID_FIELD, RECORD_TIMESTAMP_FIELD};
use lrs_core::record::parse_timestamp;
use lrs_core::{
    BackendError, BackendResult, Comparison, Cursor, Direction, Filter, NativeQuery, Operation,
    SortKey, StructuredQuery,
};

use crate::constants::POSTGRES_DOC_ID_COLUMN;

/// Longest identifier PostgreSQL keeps without truncation.
pub const POSTGRES_IDENTIFIER_BYTES_MAX: usize = 63;

/// Keys a native query object may carry.
pub const NATIVE_KEYS_ALLOWED: &[&str] = &["where", "order_by", "limit"];

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// `text`
    Text(String),
    /// `jsonb`
    Json(Value),
    /// `text[]`
    TextArray(Vec<String>),
    /// `jsonb[]`
    JsonArray(Vec<Value>),
    /// `timestamptz`
    Timestamp(DateTime<Utc>),
    /// `bigint`
    Int(i64),
}

/// SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlQuery {
    /// Statement with `$n` placeholders
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<SqlParam>,
}

impl SqlQuery {
    /// Bind `param` and return its placeholder.
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

/// Quoted table name, after checking it is a plain identifier.
///
/// # Errors
/// Returns `Parameter` for anything but `[A-Za-z_][A-Za-z0-9_]*`.
pub fn quote_table(name: &str) -> BackendResult<String> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || !rest_ok || name.len() > POSTGRES_IDENTIFIER_BYTES_MAX {
        return Err(BackendError::parameter(format!(
            "invalid postgres table name `{name}`"
        )));
    }
    Ok(format!("\"{name}\""))
}

// =============================================================================
// Columns
// =============================================================================

/// Where a neutral field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column<'f> {
    Timestamp,
    StatementId,
    DocId,
    Json(&'f str),
}

impl<'f> Column<'f> {
    fn of(field: &'f str) -> Self {
        match field {
            RECORD_TIMESTAMP_FIELD => Self::Timestamp,
            RECORD_ID_FIELD => Self::StatementId,
            QUERY_TIE_BREAKER_FIELD => Self::DocId,
            other => Self::Json(other),
        }
    }

    /// SQL expression; JSON paths bind their segments.
    fn expr(self, sql: &mut SqlQuery) -> String {
        match self {
            Self::Timestamp => "emission_time".to_string(),
            Self::StatementId => "statement_id".to_string(),
            Self::DocId => POSTGRES_DOC_ID_COLUMN.to_string(),
            Self::Json(path) => {
                let segments = path.split('.').map(String::from).collect();
                let path = sql.bind(SqlParam::TextArray(segments));
                format!("COALESCE(document #> {path}::text[], 'null'::jsonb)")
            }
        }
    }

    /// Parameter for comparing this column with `value`.
    fn param(self, value: &Value) -> BackendResult<SqlParam> {
        match self {
            Self::Timestamp => timestamp_param(value),
            Self::StatementId | Self::DocId => match value {
                Value::String(s) => Ok(SqlParam::Text(s.clone())),
                other => Err(BackendError::parameter(format!(
                    "postgres cannot compare an identifier with {other}"
                ))),
            },
            Self::Json(_) => Ok(SqlParam::Json(value.clone())),
        }
    }

    fn placeholder(self, sql: &mut SqlQuery, value: &Value) -> BackendResult<String> {
        let param = self.param(value)?;
        let placeholder = sql.bind(param);
        Ok(match self {
            Self::Json(_) => format!("{placeholder}::jsonb"),
            _ => placeholder,
        })
    }
}

/// `timestamp` values are RFC 3339 strings, or epoch microseconds as
/// produced by sort tuples.
fn timestamp_param(value: &Value) -> BackendResult<SqlParam> {
    let parsed = match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_micros),
        _ => None,
    };
    parsed
        .map(SqlParam::Timestamp)
        .ok_or_else(|| BackendError::parameter(format!("invalid timestamp value {value}")))
}

fn json_type(value: &Value) -> BackendResult<&'static str> {
    match value {
        Value::String(_) => Ok("string"),
        Value::Number(_) => Ok("number"),
        other => Err(BackendError::parameter(format!(
            "postgres range comparison needs a string or number, got {other}"
        ))),
    }
}

// =============================================================================
// Filters
// =============================================================================

fn filter_clause(sql: &mut SqlQuery, filter: &Filter) -> BackendResult<String> {
    let column = Column::of(&filter.field);
    let clause = match &filter.op {
        // Typed columns are never null.
        Comparison::Eq(Value::Null) if !matches!(column, Column::Json(_)) => "FALSE".to_string(),
        Comparison::Ne(Value::Null) if !matches!(column, Column::Json(_)) => "TRUE".to_string(),
        Comparison::Eq(value) => {
            let expr = column.expr(sql);
            format!("{expr} = {}", column.placeholder(sql, value)?)
        }
        Comparison::Ne(value) => {
            let expr = column.expr(sql);
            format!("{expr} <> {}", column.placeholder(sql, value)?)
        }
        Comparison::Gt(value)
        | Comparison::Gte(value)
        | Comparison::Lt(value)
        | Comparison::Lte(value) => {
            let op = match &filter.op {
                Comparison::Gt(_) => ">",
                Comparison::Gte(_) => ">=",
                Comparison::Lt(_) => "<",
                _ => "<=",
            };
            let expr = column.expr(sql);
            match column {
                Column::Json(_) => {
                    let kind = json_type(value)?;
                    let placeholder = column.placeholder(sql, value)?;
                    format!("(jsonb_typeof({expr}) = '{kind}' AND {expr} {op} {placeholder})")
                }
                _ => format!("{expr} {op} {}", column.placeholder(sql, value)?),
            }
        }
        Comparison::Contains(needle) => {
            let expr = column.expr(sql);
            let text = match column {
                Column::Timestamp => {
                    return Err(BackendError::parameter(
                        "postgres cannot apply `contains` to `timestamp`",
                    ))
                }
                Column::Json(_) => format!("({expr} #>> '{{}}')"),
                _ => expr.clone(),
            };
            let placeholder = sql.bind(SqlParam::Text(needle.clone()));
            match column {
                Column::Json(_) => format!(
                    "(jsonb_typeof({expr}) = 'string' AND strpos({text}, {placeholder}) > 0)"
                ),
                _ => format!("strpos({text}, {placeholder}) > 0"),
            }
        }
        Comparison::In(values) if values.is_empty() => "FALSE".to_string(),
        Comparison::In(values) => in_clause(sql, column, values)?,
    };
    Ok(clause)
}

fn in_clause(sql: &mut SqlQuery, column: Column<'_>, values: &[Value]) -> BackendResult<String> {
    let expr = column.expr(sql);
    match column {
        Column::Json(_) => {
            let placeholder = sql.bind(SqlParam::JsonArray(values.to_vec()));
            Ok(format!("{expr} = ANY({placeholder}::jsonb[])"))
        }
        Column::StatementId | Column::DocId => {
            let strings = values
                .iter()
                .map(|value| match value {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(BackendError::parameter(format!(
                        "postgres cannot compare an identifier with {other}"
                    ))),
                })
                .collect::<BackendResult<Vec<String>>>()?;
            let placeholder = sql.bind(SqlParam::TextArray(strings));
            Ok(format!("{expr} = ANY({placeholder}::text[])"))
        }
        Column::Timestamp => {
            let alternatives = values
                .iter()
                .map(|value| Ok(format!("{expr} = {}", column.placeholder(sql, value)?)))
                .collect::<BackendResult<Vec<String>>>()?;
            Ok(format!("({})", alternatives.join(" OR ")))
        }
    }
}

// =============================================================================
// Sort and keyset
// =============================================================================

fn order_clause(sql: &mut SqlQuery, sort: &[SortKey]) -> String {
    sort.iter()
        .map(|key| {
            let expr = Column::of(&key.field).expr(sql);
            match key.direction {
                Direction::Asc => format!("{expr} ASC"),
                Direction::Desc => format!("{expr} DESC"),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `(k1 > v1) OR (k1 = v1 AND k2 > v2) OR ...`, with `<` for descending keys.
fn keyset_clause(sql: &mut SqlQuery, sort: &[SortKey], cursor: &Cursor) -> BackendResult<String> {
    if cursor.sort_values.len() != sort.len() {
        return Err(BackendError::parameter(format!(
            "cursor has {} sort values for {} sort keys",
            cursor.sort_values.len(),
            sort.len()
        )));
    }

    let mut bound = Vec::with_capacity(sort.len());
    for (key, value) in sort.iter().zip(&cursor.sort_values) {
        let column = Column::of(&key.field);
        let expr = column.expr(sql);
        let placeholder = column.placeholder(sql, value)?;
        bound.push((expr, placeholder, key.direction));
    }

    let alternatives: Vec<String> = (0..bound.len())
        .map(|position| {
            let mut terms: Vec<String> = bound[..position]
                .iter()
                .map(|(expr, placeholder, _)| format!("{expr} = {placeholder}"))
                .collect();
            let (expr, placeholder, direction) = &bound[position];
            let op = match direction {
                Direction::Asc => ">",
                Direction::Desc => "<",
            };
            terms.push(format!("{expr} {op} {placeholder}"));
            format!("({})", terms.join(" AND "))
        })
        .collect();
    Ok(format!("({})", alternatives.join(" OR ")))
}

// =============================================================================
// Statements
// =============================================================================

/// One keyset page of a structured query.
///
/// `sort` must already carry the tie-breaker. Selects `doc_id` and
/// `document`; the projection is applied by the caller.
///
/// # Errors
/// Returns `Parameter` for values the columns cannot be compared with.
pub fn select_page(
    table: &str,
    query: &StructuredQuery,
    sort: &[SortKey],
    after: Option<&Cursor>,
    size: usize,
) -> BackendResult<SqlQuery> {
    let table = quote_table(table)?;
    let mut sql = SqlQuery::default();

    let mut conditions = query
        .filters
        .iter()
        .map(|filter| filter_clause(&mut sql, filter))
        .collect::<BackendResult<Vec<String>>>()?;
    if let Some(cursor) = after {
        conditions.push(keyset_clause(&mut sql, sort, cursor)?);
    }
    let order = order_clause(&mut sql, sort);
    let limit = sql.bind(SqlParam::Int(i64::try_from(size).unwrap_or(i64::MAX)));

    let mut text = format!("SELECT {POSTGRES_DOC_ID_COLUMN}, document FROM {table}");
    if !conditions.is_empty() {
        text.push_str(" WHERE ");
        text.push_str(&conditions.join(" AND "));
    }
    text.push_str(&format!(" ORDER BY {order} LIMIT {limit}"));
    sql.sql = text;
    Ok(sql)
}

/// A native query: a `WHERE` fragment, or an object with `where`,
/// `order_by` and `limit` keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeSql {
    /// Condition, verbatim
    pub condition: Option<String>,
    /// Ordering, verbatim; `doc_id` is always appended
    pub order_by: Option<String>,
    /// Total records to return
    pub limit: Option<usize>,
}

impl NativeSql {
    /// Parse a native query.
    ///
    /// # Errors
    /// Returns `Parameter` for unknown keys or mistyped values.
    pub fn parse(native: &NativeQuery) -> BackendResult<Self> {
        match native {
            NativeQuery::Text(condition) => Ok(Self {
                condition: Some(condition.clone()),
                ..Default::default()
            }),
            NativeQuery::Object(object) => {
                if let Some(key) = object
                    .keys()
                    .find(|key| !NATIVE_KEYS_ALLOWED.contains(&key.as_str()))
                {
                    return Err(BackendError::parameter(format!(
                        "postgres native query key `{key}` is not allowed"
                    )));
                }
                let text = |key: &str| match object.get(key) {
                    None => Ok(None),
                    Some(Value::String(s)) => Ok(Some(s.clone())),
                    Some(other) => Err(BackendError::parameter(format!(
                        "postgres native `{key}` must be a string, got {other}"
                    ))),
                };
                let limit = match object.get("limit") {
                    None => None,
                    Some(limit) => Some(
                        limit
                            .as_u64()
                            .and_then(|l| usize::try_from(l).ok())
                            .ok_or_else(|| {
                                BackendError::parameter(format!(
                                    "postgres native `limit` {limit} is invalid"
                                ))
                            })?,
                    ),
                };
                Ok(Self {
                    condition: text("where")?,
                    order_by: text("order_by")?,
                    limit,
                })
            }
        }
    }

    /// One offset page of this query.
    ///
    /// # Errors
    /// Returns `Parameter` for an invalid table name.
    pub fn select_page(&self, table: &str, offset: usize, size: usize) -> BackendResult<SqlQuery> {
        let table = quote_table(table)?;
        let mut sql = SqlQuery::default();
        let mut text = format!("SELECT {POSTGRES_DOC_ID_COLUMN}, document FROM {table}");
        if let Some(condition) = &self.condition {
            text.push_str(&format!(" WHERE ({condition})"));
        }
        match &self.order_by {
            Some(order) => text.push_str(&format!(" ORDER BY {order}, {POSTGRES_DOC_ID_COLUMN}")),
            None => text.push_str(&format!(" ORDER BY {POSTGRES_DOC_ID_COLUMN}")),
        }
        let limit = sql.bind(SqlParam::Int(i64::try_from(size).unwrap_or(i64::MAX)));
        let offset = sql.bind(SqlParam::Int(i64::try_from(offset).unwrap_or(i64::MAX)));
        text.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        sql.sql = text;
        Ok(sql)
    }
}

/// Schema of a statements table.
///
/// # Errors
/// Returns `Parameter` for an invalid table name.
pub fn create_table(table: &str) -> BackendResult<String> {
    let quoted = quote_table(table)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {quoted} (\
         {POSTGRES_DOC_ID_COLUMN} TEXT PRIMARY KEY, \
         statement_id TEXT NOT NULL, \
         emission_time TIMESTAMPTZ NOT NULL, \
         document JSONB NOT NULL)"
    ))
}

/// Bulk statement for `operation`, reading rows from four parallel arrays
/// (`doc_id`, `statement_id`, `emission_time`, `document`); `Delete` reads
/// only the first. Returns the `doc_id` of every row it touched.
///
/// # Errors
/// Returns `Parameter` for an invalid table name or `Append`.
pub fn write_statement(table: &str, operation: Operation) -> BackendResult<String> {
    let table = quote_table(table)?;
    let rows = "UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::jsonb[])";
    let insert = format!(
        "INSERT INTO {table} ({POSTGRES_DOC_ID_COLUMN}, statement_id, emission_time, document) \
         SELECT * FROM {rows}"
    );
    match operation {
        Operation::Create => Ok(format!(
            "{insert} ON CONFLICT ({POSTGRES_DOC_ID_COLUMN}) DO NOTHING \
             RETURNING {POSTGRES_DOC_ID_COLUMN}"
        )),
        Operation::Index => Ok(format!(
            "{insert} ON CONFLICT ({POSTGRES_DOC_ID_COLUMN}) DO UPDATE SET \
             statement_id = EXCLUDED.statement_id, \
             emission_time = EXCLUDED.emission_time, \
             document = EXCLUDED.document \
             RETURNING {POSTGRES_DOC_ID_COLUMN}"
        )),
        Operation::Update => Ok(format!(
            "UPDATE {table} AS t SET \
             statement_id = u.statement_id, \
             emission_time = u.emission_time, \
             document = u.document \
             FROM {rows} AS u({POSTGRES_DOC_ID_COLUMN}, statement_id, emission_time, document) \
             WHERE t.{POSTGRES_DOC_ID_COLUMN} = u.{POSTGRES_DOC_ID_COLUMN} \
             RETURNING t.{POSTGRES_DOC_ID_COLUMN}"
        )),
        Operation::Delete => Ok(format!(
            "DELETE FROM {table} WHERE {POSTGRES_DOC_ID_COLUMN} = ANY($1::text[]) \
             RETURNING {POSTGRES_DOC_ID_COLUMN}"
        )),
        Operation::Append => Err(BackendError::parameter(
            "postgres does not support the append operation",
        )),
    }
}
