//! Tracing Initialisation
//!
//! `TigerStyle`: Explicit configuration, one global subscriber, never panics.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lrs_backends::telemetry::{init_tracing, TelemetryConfig};
//!
//! // Defaults: `RUST_LOG` or "info", human-readable output
//! init_tracing(&TelemetryConfig::default()).expect("tracing init");
//!
//! // Or configure explicitly
//! let config = TelemetryConfig::builder()
//!     .service_name("lrs-import")
//!     .filter("lrs_backends=debug")
//!     .json(true)
//!     .build();
//! # let _ = config;
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG` - Filter directives (default: "info")
//! - `LRS_LOG_JSON` - Emit JSON lines when set to `1` or `true`

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::constants::{TELEMETRY_FILTER_DEFAULT, TELEMETRY_SERVICE_NAME_DEFAULT};

/// Tracing initialisation errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Filter directives did not parse
    #[error("invalid filter `{filter}`: {reason}")]
    InvalidFilter {
        /// The rejected directives
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("tracing initialization failed: {reason}")]
    InitFailed {
        /// The reason for the failure
        reason: String,
    },
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Tracing subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name recorded on the startup event
    pub service_name: String,

    /// `EnvFilter` directives, e.g. "info,lrs_backends=debug"
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: TELEMETRY_SERVICE_NAME_DEFAULT.to_string(),
            filter: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| TELEMETRY_FILTER_DEFAULT.to_string()),
            json: std::env::var("LRS_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

impl TelemetryConfig {
    /// Create a new builder for `TelemetryConfig`
    #[must_use]
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::default()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        if self.service_name.is_empty() {
            return Err(TelemetryError::InitFailed {
                reason: "service_name cannot be empty".to_string(),
            });
        }
        EnvFilter::try_new(&self.filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Builder for `TelemetryConfig`
#[derive(Default)]
pub struct TelemetryConfigBuilder {
    service_name: Option<String>,
    filter: Option<String>,
    json: Option<bool>,
}

impl TelemetryConfigBuilder {
    /// Set the service name
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the filter directives
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Choose JSON output
    #[must_use]
    pub fn json(mut self, json: bool) -> Self {
        self.json = Some(json);
        self
    }

    /// Build the `TelemetryConfig`
    #[must_use]
    pub fn build(self) -> TelemetryConfig {
        let default = TelemetryConfig::default();
        TelemetryConfig {
            service_name: self.service_name.unwrap_or(default.service_name),
            filter: self.filter.unwrap_or(default.filter),
            json: self.json.unwrap_or(default.json),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidFilter` if the directives do not parse.
/// Returns `TelemetryError::InitFailed` if a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| TelemetryError::InitFailed {
        reason: e.to_string(),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        filter = %config.filter,
        json = config.json,
        "tracing initialized"
    );
    Ok(())
}
