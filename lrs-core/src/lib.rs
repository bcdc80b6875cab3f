//! LRS Core - Backend-Neutral Data Layer
//!
//! TigerStyle simulation-first data layer for a learning record store.
//!
//! # Philosophy
//!
//! > "If you're not testing with fault injection, you're not testing."
//!
//! Every storage engine sits behind one contract:
//! 1. Reads are lazy streams paged with keyset cursors
//! 2. Writes are chunked, and partial failures are counted, not hidden
//! 3. Health is one of three states, re-probed on every call
//! 4. Errors fall into three kinds: parameter, engine, bad format
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Backend                      │
//! │  read · write · list · status · close        │
//! ├─────────────────────────────────────────────┤
//! │  pagination   │ cursors, tie-breaker         │
//! │  bulk         │ chunks, tally, concurrency   │
//! │  status       │ OK / ERROR / AWAY            │
//! ├─────────────────────────────────────────────┤
//! │  DST Framework │ Fault injection             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use lrs_core::{Cursor, Direction, Query};
//!
//! let query = Query::builder()
//!     .eq("verb.id", "http://adlnet.gov/expapi/verbs/completed")
//!     .sort("timestamp", Direction::Desc)
//!     .limit(10)
//!     .build()
//!     .unwrap();
//! assert!(query.as_structured("read").is_ok());
//!
//! let cursor = Cursor::new(vec![serde_json::json!(1)]);
//! let (tuple, _handle) = cursor.to_parts();
//! assert_eq!(Cursor::from_parts(&tuple, None).unwrap(), cursor);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod blocking;
pub mod bulk;
pub mod constants;
pub mod cursor;
pub mod dst;
pub mod error;
pub mod eval;
pub mod history;
pub mod pagination;
pub mod query;
pub mod record;
pub mod statements;
pub mod status;

// Re-export common types
pub use backend::{Backend, ListEntry};
pub use blocking::{BlockingBackend, BlockingIter};
pub use bulk::{write_all, ChunkReport, ChunkWriter, Rejection, RejectionKind, WriteOptions};
pub use constants::*;
pub use cursor::Cursor;
pub use dst::{property_seeds, DeterministicRng, FaultConfig, FaultInjector, FaultType, SimConfig};
pub use error::{BackendError, BackendResult, ErrorKind};
pub use history::{History, HistoryAction, HistoryEntry};
pub use pagination::{
    effective_sort, paged_stream, query_page, CandidateLoader, Page, PageRequest, PageSource,
    Snapshot, StatementQueryResult,
};
pub use query::{
    Comparison, Direction, Filter, NativeQuery, Projection, Query, QueryBuilder, SortKey,
    StructuredQuery,
};
pub use record::{physical_id, Document, Operation, Record, ValidatedRecord, WriteInput};
pub use statements::{AgentFilter, StatementQuery};
pub use status::{evaluate, BackendStatus, Probe};
