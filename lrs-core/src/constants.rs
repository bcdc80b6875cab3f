//! Constants - TigerStyle Limits
//!
//! All limits are explicit and named with units. Naming follows
//! `CATEGORY_THING_UNIT_MAX|MIN|DEFAULT`.

// =============================================================================
// Record Limits
// =============================================================================

/// Field holding the logical statement identifier.
pub const RECORD_ID_FIELD: &str = "id";

/// Field holding the statement emission time.
pub const RECORD_TIMESTAMP_FIELD: &str = "timestamp";

/// Maximum length of a logical record id
pub const RECORD_ID_BYTES_MAX: usize = 1024;

/// Bytes of the SHA-256 digest kept for a physical id
pub const RECORD_PHYSICAL_ID_BYTES: usize = 16;

// =============================================================================
// Query Limits
// =============================================================================

/// Pseudo-field naming the engine's unique record identifier in a sort.
pub const QUERY_TIE_BREAKER_FIELD: &str = "_id";

/// Maximum length of a field path
pub const QUERY_FIELD_PATH_BYTES_MAX: usize = 256;

/// Maximum number of filters in one structured query
pub const QUERY_FILTERS_COUNT_MAX: usize = 64;

/// Maximum number of caller sort keys
pub const QUERY_SORT_KEYS_COUNT_MAX: usize = 8;

/// Maximum records in one page
pub const QUERY_LIMIT_COUNT_MAX: usize = 10_000;

/// Page size used when a query carries no limit
pub const QUERY_LIMIT_COUNT_DEFAULT: usize = 100;

/// Maximum ids per filter when fetching statements by id
pub const QUERY_IDS_CHUNK_SIZE_COUNT_MAX: usize = 10_000;

// =============================================================================
// Cursor Limits
// =============================================================================

/// Separator between encoded sort values
pub const CURSOR_SEPARATOR: char = '|';

/// Maximum number of sort values a cursor may carry
pub const CURSOR_SORT_VALUES_COUNT_MAX: usize = QUERY_SORT_KEYS_COUNT_MAX + 1;

/// Maximum length of a serialized sort tuple
pub const CURSOR_SORT_TUPLE_BYTES_MAX: usize = 8 * 1024;

/// Maximum length of an engine handle
pub const CURSOR_HANDLE_BYTES_MAX: usize = 4 * 1024;

// =============================================================================
// Backend Limits
// =============================================================================

/// Default records fetched per underlying read call
pub const BACKEND_READ_CHUNK_SIZE_DEFAULT: usize = 500;

/// Maximum records fetched per underlying read call
pub const BACKEND_READ_CHUNK_SIZE_MAX: usize = 10_000;

/// Default records per write chunk
pub const BACKEND_WRITE_CHUNK_SIZE_DEFAULT: usize = 500;

/// Maximum records per write chunk
pub const BACKEND_WRITE_CHUNK_SIZE_MAX: usize = 50_000;

/// Default write chunks in flight
pub const BACKEND_WRITE_CONCURRENCY_DEFAULT: usize = 1;

/// Maximum write chunks in flight
pub const BACKEND_WRITE_CONCURRENCY_MAX: usize = 64;

/// Maximum length of a target name
pub const BACKEND_TARGET_BYTES_MAX: usize = 255;

// =============================================================================
// DST (Deterministic Simulation Testing) Limits
// =============================================================================

/// Maximum number of simulation steps
pub const DST_SIMULATION_STEPS_MAX: u64 = 1_000_000;

/// Maximum probability for fault injection (1.0 = 100%)
pub const DST_FAULT_PROBABILITY_MAX: f64 = 1.0;

/// Default number of seeds a property loop runs
pub const DST_PROPERTY_SEEDS_COUNT_DEFAULT: u64 = 16;

// =============================================================================
// Time Constants
// =============================================================================

/// Microseconds per second
pub const TIME_US_PER_SEC: i64 = 1_000_000;

/// Seconds per hour
pub const TIME_SECS_PER_HOUR: i64 = 3_600;
