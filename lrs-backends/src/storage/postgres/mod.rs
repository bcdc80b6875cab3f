//! PostgreSQL Adapter
//!
//! The translator is always compiled; the sqlx-backed engine needs the
//! `postgres` feature.

pub mod translate;

#[cfg(feature = "postgres")]
mod backend;

#[cfg(feature = "postgres")]
pub use backend::PostgresBackend;
