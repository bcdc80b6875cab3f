//! Backend Configuration
//!
//! `TigerStyle`: Sensible defaults, builder pattern, explicit over implicit.
//!
//! Every engine has a settings struct with a `Default`, a `from_env()`
//! reading `LRS_<ENGINE>_*` variables, and `with_*` builders.
//! [`BackendConfig`] tags them by engine and [`connect`] turns one into a
//! ready backend. Adapters never read the environment after construction.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lrs_core::{Backend, BackendError, BackendResult};

use crate::constants::{
    CLICKHOUSE_DATABASE_DEFAULT, CLICKHOUSE_REQUEST_TIMEOUT_SECS_DEFAULT,
    CLICKHOUSE_TABLE_DEFAULT, CLICKHOUSE_URL_DEFAULT, ES_INDEX_DEFAULT,
    ES_PIT_KEEP_ALIVE_SECS_DEFAULT, ES_REQUEST_TIMEOUT_SECS_DEFAULT, ES_URL_DEFAULT,
    FS_ROOT_DEFAULT, FS_TARGET_DEFAULT, OBJECT_STORE_PREFIX_DEFAULT,
    POSTGRES_CONNECTIONS_COUNT_MAX, POSTGRES_TABLE_DEFAULT, POSTGRES_URL_DEFAULT,
    WS_CONNECT_TIMEOUT_MS_DEFAULT, WS_URL_DEFAULT,
};
use crate::storage::{
    ClickHouseBackend, EsBackend, FsBackend, ObjectStoreBackend, SimBackend, WsBackend,
};

// =============================================================================
// Environment helpers
// =============================================================================

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T>(key: &str) -> BackendResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| BackendError::parameter(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    })
}

// =============================================================================
// Elasticsearch
// =============================================================================

/// Elasticsearch settings (`LRS_ES_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsSettings {
    /// Cluster URL
    pub url: String,
    /// Default index
    pub index: String,
    /// Basic-auth user
    pub username: Option<String>,
    /// Basic-auth password
    pub password: Option<String>,
    /// Report a yellow cluster as `Ok`
    pub allow_yellow: bool,
    /// Point-in-time keep-alive between page fetches
    pub pit_keep_alive_secs: u64,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Wait for a refresh after each bulk request
    pub refresh: bool,
    /// Fields mapped as dates (no `.keyword` sub-field)
    pub date_fields: Vec<String>,
}

impl Default for EsSettings {
    fn default() -> Self {
        Self {
            url: ES_URL_DEFAULT.to_string(),
            index: ES_INDEX_DEFAULT.to_string(),
            username: None,
            password: None,
            allow_yellow: false,
            pit_keep_alive_secs: ES_PIT_KEEP_ALIVE_SECS_DEFAULT,
            request_timeout_secs: ES_REQUEST_TIMEOUT_SECS_DEFAULT,
            refresh: false,
            date_fields: vec!["timestamp".to_string(), "stored".to_string()],
        }
    }
}

impl EsSettings {
    /// Defaults overridden by `LRS_ES_*` variables.
    ///
    /// # Errors
    /// Returns `Parameter` if a variable does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        if let Some(url) = env_string("LRS_ES_URL") {
            settings.url = url;
        }
        if let Some(index) = env_string("LRS_ES_INDEX") {
            settings.index = index;
        }
        settings.username = env_string("LRS_ES_USERNAME");
        settings.password = env_string("LRS_ES_PASSWORD");
        if let Some(allow) = env_parse("LRS_ES_ALLOW_YELLOW")? {
            settings.allow_yellow = allow;
        }
        if let Some(secs) = env_parse("LRS_ES_PIT_KEEP_ALIVE_SECS")? {
            settings.pit_keep_alive_secs = secs;
        }
        if let Some(secs) = env_parse("LRS_ES_REQUEST_TIMEOUT_SECS")? {
            settings.request_timeout_secs = secs;
        }
        if let Some(refresh) = env_parse("LRS_ES_REFRESH")? {
            settings.refresh = refresh;
        }
        if let Some(fields) = env_list("LRS_ES_DATE_FIELDS") {
            settings.date_fields = fields;
        }
        Ok(settings)
    }

    /// Set the cluster URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the default index.
    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    /// Set basic-auth credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Accept a yellow cluster as healthy.
    #[must_use]
    pub fn with_allow_yellow(mut self, allow: bool) -> Self {
        self.allow_yellow = allow;
        self
    }

    /// Set the point-in-time keep-alive.
    #[must_use]
    pub fn with_pit_keep_alive_secs(mut self, secs: u64) -> Self {
        self.pit_keep_alive_secs = secs;
        self
    }

    /// Wait for a refresh after each bulk request.
    #[must_use]
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// PostgreSQL settings (`LRS_POSTGRES_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// Connection URL
    pub url: String,
    /// Default table
    pub table: String,
    /// Pool size
    pub max_connections: u32,
    /// Create missing tables on first write
    pub create_tables: bool,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            url: POSTGRES_URL_DEFAULT.to_string(),
            table: POSTGRES_TABLE_DEFAULT.to_string(),
            max_connections: POSTGRES_CONNECTIONS_COUNT_MAX,
            create_tables: true,
        }
    }
}

impl PostgresSettings {
    /// Defaults overridden by `LRS_POSTGRES_*` variables.
    ///
    /// # Errors
    /// Returns `Parameter` if a variable does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        if let Some(url) = env_string("LRS_POSTGRES_URL") {
            settings.url = url;
        }
        if let Some(table) = env_string("LRS_POSTGRES_TABLE") {
            settings.table = table;
        }
        if let Some(max) = env_parse("LRS_POSTGRES_MAX_CONNECTIONS")? {
            settings.max_connections = max;
        }
        if let Some(create) = env_parse("LRS_POSTGRES_CREATE_TABLES")? {
            settings.create_tables = create;
        }
        Ok(settings)
    }

    /// Set the connection URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the default table.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the pool size.
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

// =============================================================================
// ClickHouse
// =============================================================================

/// ClickHouse settings (`LRS_CLICKHOUSE_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseSettings {
    /// HTTP interface URL
    pub url: String,
    /// Database
    pub database: String,
    /// Default table
    pub table: String,
    /// User
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            url: CLICKHOUSE_URL_DEFAULT.to_string(),
            database: CLICKHOUSE_DATABASE_DEFAULT.to_string(),
            table: CLICKHOUSE_TABLE_DEFAULT.to_string(),
            username: None,
            password: None,
            request_timeout_secs: CLICKHOUSE_REQUEST_TIMEOUT_SECS_DEFAULT,
        }
    }
}

impl ClickHouseSettings {
    /// Defaults overridden by `LRS_CLICKHOUSE_*` variables.
    ///
    /// # Errors
    /// Returns `Parameter` if a variable does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        if let Some(url) = env_string("LRS_CLICKHOUSE_URL") {
            settings.url = url;
        }
        if let Some(database) = env_string("LRS_CLICKHOUSE_DATABASE") {
            settings.database = database;
        }
        if let Some(table) = env_string("LRS_CLICKHOUSE_TABLE") {
            settings.table = table;
        }
        settings.username = env_string("LRS_CLICKHOUSE_USERNAME");
        settings.password = env_string("LRS_CLICKHOUSE_PASSWORD");
        if let Some(secs) = env_parse("LRS_CLICKHOUSE_REQUEST_TIMEOUT_SECS")? {
            settings.request_timeout_secs = secs;
        }
        Ok(settings)
    }

    /// Set the HTTP interface URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the default table.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

// =============================================================================
// Filesystem
// =============================================================================

/// JSON-lines filesystem settings (`LRS_FS_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSettings {
    /// Directory holding the files
    pub root: PathBuf,
    /// File used when no target is given
    pub default_target: String,
}

impl Default for FsSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(FS_ROOT_DEFAULT),
            default_target: FS_TARGET_DEFAULT.to_string(),
        }
    }
}

impl FsSettings {
    /// Defaults overridden by `LRS_FS_*` variables.
    ///
    /// # Errors
    /// Never fails today; kept fallible like the other engines.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        if let Some(root) = env_string("LRS_FS_ROOT") {
            settings.root = PathBuf::from(root);
        }
        if let Some(target) = env_string("LRS_FS_DEFAULT_TARGET") {
            settings.default_target = target;
        }
        Ok(settings)
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the default file.
    #[must_use]
    pub fn with_default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = target.into();
        self
    }
}

// =============================================================================
// Object store
// =============================================================================

/// Object store settings (`LRS_OBJECT_STORE_*`).
///
/// Without a `root` the store lives in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    /// Local directory backing the store
    pub root: Option<PathBuf>,
    /// Key prefix used when no target is given
    pub prefix: String,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            root: None,
            prefix: OBJECT_STORE_PREFIX_DEFAULT.to_string(),
        }
    }
}

impl ObjectStoreSettings {
    /// Defaults overridden by `LRS_OBJECT_STORE_*` variables.
    ///
    /// # Errors
    /// Never fails today; kept fallible like the other engines.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        settings.root = env_string("LRS_OBJECT_STORE_ROOT").map(PathBuf::from);
        if let Some(prefix) = env_string("LRS_OBJECT_STORE_PREFIX") {
            settings.prefix = prefix;
        }
        Ok(settings)
    }

    /// Back the store with a local directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Set the default key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

// =============================================================================
// Websocket
// =============================================================================

/// Websocket stream settings (`LRS_WS_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSettings {
    /// Stream URL
    pub url: String,
    /// Connect timeout of the status probe
    pub connect_timeout_ms: u64,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            url: WS_URL_DEFAULT.to_string(),
            connect_timeout_ms: WS_CONNECT_TIMEOUT_MS_DEFAULT,
        }
    }
}

impl WsSettings {
    /// Defaults overridden by `LRS_WS_*` variables.
    ///
    /// # Errors
    /// Returns `Parameter` if a variable does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        if let Some(url) = env_string("LRS_WS_URL") {
            settings.url = url;
        }
        if let Some(ms) = env_parse("LRS_WS_CONNECT_TIMEOUT_MS")? {
            settings.connect_timeout_ms = ms;
        }
        Ok(settings)
    }

    /// Set the stream URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }
}

// =============================================================================
// Simulation
// =============================================================================

/// Simulated engine settings (`LRS_SIM_*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// RNG seed; `DST_SEED` or random when absent
    pub seed: Option<u64>,
    /// Report a degraded engine as `Ok`
    pub allow_degraded: bool,
    /// Target used when none is given
    pub default_target: String,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            seed: None,
            allow_degraded: false,
            default_target: "statements".to_string(),
        }
    }
}

impl SimSettings {
    /// Defaults overridden by `LRS_SIM_*` variables.
    ///
    /// # Errors
    /// Returns `Parameter` if a variable does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let mut settings = Self::default();
        settings.seed = env_parse("LRS_SIM_SEED")?;
        if let Some(allow) = env_parse("LRS_SIM_ALLOW_DEGRADED")? {
            settings.allow_degraded = allow;
        }
        if let Some(target) = env_string("LRS_SIM_DEFAULT_TARGET") {
            settings.default_target = target;
        }
        Ok(settings)
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Report a degraded engine as `Ok`.
    #[must_use]
    pub fn with_allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    /// Set the default target.
    #[must_use]
    pub fn with_default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = target.into();
        self
    }
}

// =============================================================================
// BackendConfig
// =============================================================================

/// Engine choice with its settings.
///
/// # Example
///
/// ```rust
/// use lrs_backends::config::BackendConfig;
///
/// let config: BackendConfig =
///     serde_json::from_str(r#"{"type": "fs", "root": "/var/lib/lrs"}"#).unwrap();
/// assert_eq!(config.engine(), "fs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-memory simulated engine
    Sim(SimSettings),
    /// Elasticsearch
    #[serde(rename = "es")]
    Elasticsearch(EsSettings),
    /// PostgreSQL JSONB documents
    Postgres(PostgresSettings),
    /// ClickHouse
    #[serde(rename = "clickhouse")]
    ClickHouse(ClickHouseSettings),
    /// JSON-lines files
    Fs(FsSettings),
    /// Object store
    ObjectStore(ObjectStoreSettings),
    /// Websocket stream
    Ws(WsSettings),
}

impl BackendConfig {
    /// Engine named by `LRS_BACKEND`, with its settings from the environment.
    ///
    /// # Errors
    /// Returns `Parameter` if `LRS_BACKEND` is missing or unknown, or if a
    /// setting does not parse.
    pub fn from_env() -> BackendResult<Self> {
        let engine = env_string("LRS_BACKEND")
            .ok_or_else(|| BackendError::parameter("LRS_BACKEND is not set"))?;
        Ok(match engine.to_ascii_lowercase().as_str() {
            "sim" => Self::Sim(SimSettings::from_env()?),
            "es" | "elasticsearch" => Self::Elasticsearch(EsSettings::from_env()?),
            "postgres" => Self::Postgres(PostgresSettings::from_env()?),
            "clickhouse" => Self::ClickHouse(ClickHouseSettings::from_env()?),
            "fs" => Self::Fs(FsSettings::from_env()?),
            "object_store" => Self::ObjectStore(ObjectStoreSettings::from_env()?),
            "ws" => Self::Ws(WsSettings::from_env()?),
            other => {
                return Err(BackendError::parameter(format!(
                    "unknown backend `{other}`"
                )))
            }
        })
    }

    /// Engine name, as used in the `type` tag.
    #[must_use]
    pub fn engine(&self) -> &'static str {
        match self {
            Self::Sim(_) => "sim",
            Self::Elasticsearch(_) => "es",
            Self::Postgres(_) => "postgres",
            Self::ClickHouse(_) => "clickhouse",
            Self::Fs(_) => "fs",
            Self::ObjectStore(_) => "object_store",
            Self::Ws(_) => "ws",
        }
    }
}

/// Build the backend described by `config`.
///
/// # Errors
/// Returns `Parameter` for invalid settings and `Engine` when the engine
/// client cannot be created.
pub async fn connect(config: &BackendConfig) -> BackendResult<Arc<dyn Backend>> {
    tracing::info!(engine = config.engine(), "connecting backend");
    Ok(match config {
        BackendConfig::Sim(settings) => Arc::new(SimBackend::new(settings.clone())),
        BackendConfig::Elasticsearch(settings) => Arc::new(EsBackend::new(settings.clone())?),
        BackendConfig::Postgres(settings) => connect_postgres(settings).await?,
        BackendConfig::ClickHouse(settings) => {
            Arc::new(ClickHouseBackend::new(settings.clone())?)
        }
        BackendConfig::Fs(settings) => Arc::new(FsBackend::new(settings.clone())?),
        BackendConfig::ObjectStore(settings) => {
            Arc::new(ObjectStoreBackend::from_settings(settings)?)
        }
        BackendConfig::Ws(settings) => Arc::new(WsBackend::new(settings.clone())?),
    })
}

#[cfg(feature = "postgres")]
async fn connect_postgres(settings: &PostgresSettings) -> BackendResult<Arc<dyn Backend>> {
    let backend = crate::storage::PostgresBackend::connect(settings.clone()).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn connect_postgres(_settings: &PostgresSettings) -> BackendResult<Arc<dyn Backend>> {
    Err(BackendError::parameter(
        "postgres support is not compiled in (enable the `postgres` feature)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let es = EsSettings::default();
        assert_eq!(es.url, ES_URL_DEFAULT);
        assert!(!es.allow_yellow);
        assert!(es.date_fields.contains(&"timestamp".to_string()));

        assert_eq!(FsSettings::default().default_target, FS_TARGET_DEFAULT);
        assert!(ObjectStoreSettings::default().root.is_none());
        assert_eq!(SimSettings::default().default_target, "statements");
    }

    #[test]
    fn test_builders() {
        let es = EsSettings::default()
            .with_url("http://es:9200")
            .with_index("xapi")
            .with_credentials("elastic", "secret")
            .with_allow_yellow(true);
        assert_eq!(es.url, "http://es:9200");
        assert_eq!(es.index, "xapi");
        assert_eq!(es.username.as_deref(), Some("elastic"));
        assert!(es.allow_yellow);

        let sim = SimSettings::default().with_seed(7).with_allow_degraded(true);
        assert_eq!(sim.seed, Some(7));
        assert!(sim.allow_degraded);
    }

    #[test]
    fn test_tagged_config_uses_defaults_for_missing_fields() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"type": "es", "index": "xapi"}"#).unwrap();
        let BackendConfig::Elasticsearch(settings) = &config else {
            panic!("expected es config, got {config:?}");
        };
        assert_eq!(settings.index, "xapi");
        assert_eq!(settings.url, ES_URL_DEFAULT);
        assert_eq!(config.engine(), "es");

        let config: BackendConfig = serde_json::from_str(r#"{"type": "clickhouse"}"#).unwrap();
        assert_eq!(config, BackendConfig::ClickHouse(ClickHouseSettings::default()));

        let unknown = serde_json::from_str::<BackendConfig>(r#"{"type": "mongo"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_ws_settings_from_env() {
        env::set_var("LRS_WS_URL", "ws://stream:9000");
        env::set_var("LRS_WS_CONNECT_TIMEOUT_MS", "250");
        let settings = WsSettings::from_env().unwrap();
        assert_eq!(settings.url, "ws://stream:9000");
        assert_eq!(settings.connect_timeout_ms, 250);

        env::set_var("LRS_WS_CONNECT_TIMEOUT_MS", "soon");
        assert!(WsSettings::from_env().unwrap_err().is_parameter());

        env::remove_var("LRS_WS_URL");
        env::remove_var("LRS_WS_CONNECT_TIMEOUT_MS");
    }

    #[tokio::test]
    async fn test_connect_sim() {
        let backend = connect(&BackendConfig::Sim(SimSettings::default().with_seed(42)))
            .await
            .unwrap();
        assert_eq!(backend.name(), "sim");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_connect_postgres_without_feature() {
        let err = connect(&BackendConfig::Postgres(PostgresSettings::default()))
            .await
            .err()
            .unwrap();
        assert!(err.is_parameter());
    }
}
