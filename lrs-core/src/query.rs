//! Query - Backend-Neutral Query Model
//!
//! `TigerStyle`: Validated once at construction, translated per engine.
//!
//! A query is either structured (filters, sort, limit, projection and an
//! optional cursor) or an engine-native escape hatch passed through
//! verbatim. The two are exclusive; [`QueryBuilder`] gives the native form
//! precedence when both are supplied.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    QUERY_FIELD_PATH_BYTES_MAX, QUERY_FILTERS_COUNT_MAX, QUERY_LIMIT_COUNT_MAX,
    QUERY_SORT_KEYS_COUNT_MAX, QUERY_TIE_BREAKER_FIELD,
};
use crate::cursor::Cursor;
use crate::error::{BackendError, BackendResult};
use crate::record::Document;

// =============================================================================
// Building blocks
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first
    #[default]
    Asc,
    /// Largest first
    Desc,
}

impl Direction {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Dotted field path
    pub field: String,
    /// Direction
    #[serde(default)]
    pub direction: Direction,
}

impl SortKey {
    /// Create a sort key.
    #[must_use]
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Sort on the engine's unique record identifier.
    #[must_use]
    pub fn tie_breaker(direction: Direction) -> Self {
        Self::new(QUERY_TIE_BREAKER_FIELD, direction)
    }

    /// True for the implicit tie-breaker key.
    #[must_use]
    pub fn is_tie_breaker(&self) -> bool {
        self.field == QUERY_TIE_BREAKER_FIELD
    }
}

/// Comparison applied to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Comparison {
    /// Equal
    Eq(Value),
    /// Not equal (also matches a missing field)
    Ne(Value),
    /// Greater than
    Gt(Value),
    /// Greater than or equal
    Gte(Value),
    /// Less than
    Lt(Value),
    /// Less than or equal
    Lte(Value),
    /// String field contains the substring
    Contains(String),
    /// Equal to any of the values
    In(Vec<Value>),
}

impl Comparison {
    /// Operator name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::Ne(_) => "ne",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::Contains(_) => "contains",
            Self::In(_) => "in",
        }
    }
}

/// One filter: `field op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted field path
    pub field: String,
    /// Comparison
    #[serde(flatten)]
    pub op: Comparison,
}

impl Filter {
    /// Create a filter.
    #[must_use]
    pub fn new(field: impl Into<String>, op: Comparison) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }
}

/// Field allow or deny list applied to returned documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Projection {
    /// Keep only these fields
    Include(Vec<String>),
    /// Drop these fields
    Exclude(Vec<String>),
}

impl Projection {
    /// Apply to a document (top-level or dotted paths).
    #[must_use]
    pub fn apply(&self, document: Document) -> Document {
        match self {
            Self::Include(fields) => {
                let mut out = Document::new();
                for field in fields {
                    copy_path(&document, &mut out, field);
                }
                out
            }
            Self::Exclude(fields) => {
                let mut out = document;
                for field in fields {
                    remove_path(&mut out, field);
                }
                out
            }
        }
    }
}

fn copy_path(source: &Document, target: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            if let Some(value) = source.get(path) {
                target.insert(path.to_string(), value.clone());
            }
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = source.get(head) {
                let slot = target
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(Document::new()));
                if let Value::Object(slot) = slot {
                    copy_path(inner, slot, rest);
                }
            }
        }
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(inner)) = document.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

// =============================================================================
// Query
// =============================================================================

/// Engine-native query, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NativeQuery {
    /// Query string (search syntax, SQL fragment, file name...)
    Text(String),
    /// Query object; the engine checks its keys
    Object(Document),
}

/// Structured query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredQuery {
    /// Conjunction of filters
    pub filters: Vec<Filter>,
    /// Caller sort keys (the tie-breaker is appended by the pagination engine)
    pub sort: Vec<SortKey>,
    /// Maximum records per page; `None` means engine default
    pub limit: Option<usize>,
    /// Optional projection
    pub projection: Option<Projection>,
    /// Resume position
    pub cursor: Option<Cursor>,
}

impl StructuredQuery {
    /// Copy of this query resuming after `cursor`.
    #[must_use]
    pub fn after(&self, cursor: Cursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..self.clone()
        }
    }

    /// Check field names and limits.
    ///
    /// # Errors
    /// Returns `Parameter` naming the first invalid element.
    pub fn validate(&self) -> BackendResult<()> {
        if self.filters.len() > QUERY_FILTERS_COUNT_MAX {
            return Err(BackendError::parameter(format!(
                "query has {} filters, at most {QUERY_FILTERS_COUNT_MAX} allowed",
                self.filters.len()
            )));
        }
        if self.sort.len() > QUERY_SORT_KEYS_COUNT_MAX {
            return Err(BackendError::parameter(format!(
                "query has {} sort keys, at most {QUERY_SORT_KEYS_COUNT_MAX} allowed",
                self.sort.len()
            )));
        }
        for filter in &self.filters {
            validate_field(&filter.field)?;
            if let Comparison::In(values) = &filter.op {
                if values.is_empty() {
                    return Err(BackendError::parameter(format!(
                        "`in` filter on `{}` needs at least one value",
                        filter.field
                    )));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for key in &self.sort {
            if !key.is_tie_breaker() {
                validate_field(&key.field)?;
            }
            if !seen.insert(key.field.as_str()) {
                return Err(BackendError::parameter(format!(
                    "field `{}` sorted twice",
                    key.field
                )));
            }
        }
        if let Some(limit) = self.limit {
            if limit > QUERY_LIMIT_COUNT_MAX {
                return Err(BackendError::parameter(format!(
                    "limit {limit} exceeds {QUERY_LIMIT_COUNT_MAX}"
                )));
            }
        }
        Ok(())
    }
}

fn validate_field(field: &str) -> BackendResult<()> {
    if field.is_empty() || field.len() > QUERY_FIELD_PATH_BYTES_MAX {
        return Err(BackendError::parameter(format!(
            "invalid field path `{field}`"
        )));
    }
    if field.split('.').any(str::is_empty) {
        return Err(BackendError::parameter(format!(
            "field path `{field}` has an empty segment"
        )));
    }
    Ok(())
}

impl<'a> From<&'a StructuredQuery> for Cow<'a, StructuredQuery> {
    fn from(query: &'a StructuredQuery) -> Self {
        Cow::Borrowed(query)
    }
}

impl From<StructuredQuery> for Cow<'_, StructuredQuery> {
    fn from(query: StructuredQuery) -> Self {
        Cow::Owned(query)
    }
}

/// A query: structured or engine-native.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Query {
    /// Neutral form, translated per engine
    Structured(StructuredQuery),
    /// Native form, passed through
    Native(NativeQuery),
}

impl Default for Query {
    fn default() -> Self {
        Self::Structured(StructuredQuery::default())
    }
}

impl From<StructuredQuery> for Query {
    fn from(query: StructuredQuery) -> Self {
        Self::Structured(query)
    }
}

impl From<NativeQuery> for Query {
    fn from(query: NativeQuery) -> Self {
        Self::Native(query)
    }
}

impl Query {
    /// Start building a query.
    #[must_use]
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Structured form, or a parameter error for native queries.
    ///
    /// # Errors
    /// Returns `Parameter` naming `what` when the query is native.
    pub fn as_structured(&self, what: &str) -> BackendResult<&StructuredQuery> {
        match self {
            Self::Structured(query) => Ok(query),
            Self::Native(_) => Err(BackendError::parameter(format!(
                "{what} requires a structured query"
            ))),
        }
    }
}

// =============================================================================
// QueryBuilder
// =============================================================================

/// Builder for [`Query`].
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    structured: StructuredQuery,
    native: Option<NativeQuery>,
}

impl QueryBuilder {
    /// Add a filter.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, op: Comparison) -> Self {
        self.structured.filters.push(Filter::new(field, op));
        self
    }

    /// Add an equality filter.
    #[must_use]
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparison::Eq(value.into()))
    }

    /// Append a sort key.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.structured.sort.push(SortKey::new(field, direction));
        self
    }

    /// Set the page size.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.structured.limit = Some(limit);
        self
    }

    /// Set the projection.
    #[must_use]
    pub fn projection(mut self, projection: Projection) -> Self {
        self.structured.projection = Some(projection);
        self
    }

    /// Resume after a cursor.
    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.structured.cursor = Some(cursor);
        self
    }

    /// Use an engine-native query instead of the structured parts.
    #[must_use]
    pub fn native(mut self, native: NativeQuery) -> Self {
        self.native = Some(native);
        self
    }

    /// Validate and build.
    ///
    /// A limit of 0 means engine default.
    ///
    /// # Errors
    /// Returns `Parameter` when the structured parts are invalid.
    pub fn build(self) -> BackendResult<Query> {
        if let Some(native) = self.native {
            return Ok(Query::Native(native));
        }
        let mut structured = self.structured;
        if structured.limit == Some(0) {
            structured.limit = None;
        }
        structured.validate()?;
        Ok(Query::Structured(structured))
    }
}
