//! Statement Queries - xAPI Parameters to Neutral Filters
//!
//! `TigerStyle`: One mapping, shared by every engine.
//!
//! The HTTP layer receives xAPI statement query parameters; this module
//! turns them into a [`StructuredQuery`] sorted by `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{RECORD_ID_FIELD, RECORD_TIMESTAMP_FIELD};
use crate::cursor::Cursor;
use crate::error::BackendResult;
use crate::query::{Comparison, Direction, Filter, SortKey, StructuredQuery};
use crate::record::format_timestamp;

/// Inverse functional identifier of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFilter {
    /// `mailto:` IRI
    Mbox(String),
    /// SHA-1 of the mailto IRI
    MboxSha1sum(String),
    /// OpenID URI
    Openid(String),
    /// Account on a system
    Account {
        /// Account name
        name: String,
        /// System home page
        home_page: String,
    },
}

impl AgentFilter {
    fn filters(&self, prefix: &str) -> Vec<Filter> {
        let eq = |field: &str, value: &str| {
            Filter::new(
                format!("{prefix}.{field}"),
                Comparison::Eq(Value::String(value.to_string())),
            )
        };
        match self {
            Self::Mbox(mbox) => vec![eq("mbox", mbox)],
            Self::MboxSha1sum(sum) => vec![eq("mbox_sha1sum", sum)],
            Self::Openid(openid) => vec![eq("openid", openid)],
            Self::Account { name, home_page } => {
                vec![eq("account.name", name), eq("account.homePage", home_page)]
            }
        }
    }
}

/// xAPI statement query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementQuery {
    /// Single statement by id
    pub statement_id: Option<String>,
    /// Verb IRI
    pub verb: Option<String>,
    /// Activity IRI (statement object)
    pub activity: Option<String>,
    /// Actor identifier
    pub agent: Option<AgentFilter>,
    /// Authority identifier
    pub authority: Option<AgentFilter>,
    /// Context registration UUID
    pub registration: Option<String>,
    /// Statements stored strictly after this instant
    pub since: Option<DateTime<Utc>>,
    /// Statements stored at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Oldest first when true
    pub ascending: bool,
    /// Page size
    pub limit: Option<usize>,
    /// Sort-tuple half of a cursor
    pub search_after: Option<String>,
    /// Handle half of a cursor
    pub pit_id: Option<String>,
}

impl StatementQuery {
    /// Translate into a neutral structured query.
    ///
    /// # Errors
    /// Returns `Parameter` if the cursor strings are malformed or the
    /// resulting query is invalid.
    pub fn into_query(self) -> BackendResult<StructuredQuery> {
        let mut filters = Vec::new();
        let eq = |field: &str, value: String| {
            Filter::new(field, Comparison::Eq(Value::String(value)))
        };

        if let Some(id) = self.statement_id {
            filters.push(eq(RECORD_ID_FIELD, id));
        }
        if let Some(verb) = self.verb {
            filters.push(eq("verb.id", verb));
        }
        if let Some(activity) = self.activity {
            filters.push(eq("object.objectType", "Activity".to_string()));
            filters.push(eq("object.id", activity));
        }
        if let Some(agent) = &self.agent {
            filters.extend(agent.filters("actor"));
        }
        if let Some(authority) = &self.authority {
            filters.extend(authority.filters("authority"));
        }
        if let Some(registration) = self.registration {
            filters.push(eq("context.registration", registration));
        }
        if let Some(since) = self.since {
            filters.push(Filter::new(
                RECORD_TIMESTAMP_FIELD,
                Comparison::Gt(Value::String(format_timestamp(&since))),
            ));
        }
        if let Some(until) = self.until {
            filters.push(Filter::new(
                RECORD_TIMESTAMP_FIELD,
                Comparison::Lte(Value::String(format_timestamp(&until))),
            ));
        }

        let direction = if self.ascending {
            Direction::Asc
        } else {
            Direction::Desc
        };
        let cursor = match self.search_after.as_deref() {
            Some(tuple) => Some(Cursor::from_parts(tuple, self.pit_id.as_deref())?),
            None => None,
        };

        let query = StructuredQuery {
            filters,
            sort: vec![SortKey::new(RECORD_TIMESTAMP_FIELD, direction)],
            limit: self.limit.filter(|&l| l > 0),
            projection: None,
            cursor,
        };
        query.validate()?;
        Ok(query)
    }
}
