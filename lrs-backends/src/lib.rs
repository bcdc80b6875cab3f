//! # LRS Backends
//!
//! Storage engine adapters for a learning record store, all behind the
//! [`lrs_core::Backend`] contract.
//!
//! ## Engines
//!
//! - **Simulation**: in-memory engine with deterministic fault injection
//! - **Elasticsearch**: point-in-time pagination with `search_after`
//! - **PostgreSQL** (feature `postgres`): JSONB documents with keyset SQL
//! - **ClickHouse**: HTTP interface, typed query parameters
//! - **Object store**: one JSON object per statement
//! - **Filesystem**: JSON-lines files under a root directory
//! - **Websocket**: read-only statement stream
//!
//! ## Quick Start
//!
//! ```rust
//! use futures::stream::{self, StreamExt, TryStreamExt};
//! use lrs_backends::config::{connect, BackendConfig, SimSettings};
//! use lrs_core::{Direction, Query, Record, WriteInput, WriteOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = connect(&BackendConfig::Sim(SimSettings::default().with_seed(42))).await?;
//!
//! let statement = serde_json::json!({"id": "s1", "timestamp": "2024-01-01T00:00:00Z"});
//! let data = stream::iter(vec![WriteInput::Document(
//!     statement.as_object().cloned().unwrap_or_default(),
//! )]);
//! let written = backend.write(data.boxed(), &WriteOptions::default()).await?;
//! assert_eq!(written, 1);
//!
//! let query = Query::builder().sort("timestamp", Direction::Desc).build()?;
//! let records: Vec<Record> = backend.read(&query, None, None).try_collect().await?;
//! assert_eq!(records.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           config::connect(&BackendConfig)               │
//! ├─────────────────────────────────────────────────────────┤
//! │  storage::{Sim, Es, Postgres, ClickHouse,               │
//! │            ObjectStore, Fs, Ws}Backend                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  lrs_core: pagination · bulk · status · eval · dst      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL adapter (`sqlx`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod storage;
pub mod telemetry;

pub use config::{
    connect, BackendConfig, ClickHouseSettings, EsSettings, FsSettings, ObjectStoreSettings,
    PostgresSettings, SimSettings, WsSettings,
};
pub use storage::{
    ClickHouseBackend, EsBackend, FsBackend, ObjectStoreBackend, SimBackend, WsBackend,
};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};

#[cfg(feature = "postgres")]
pub use storage::PostgresBackend;
