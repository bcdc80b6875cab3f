//! Status - Health Probe Normalisation
//!
//! `TigerStyle`: Three states, re-probed on every call.

use serde::{Deserialize, Serialize};

/// Health of an engine as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Reachable and healthy
    Ok,
    /// Reachable but degraded
    Error,
    /// Unreachable
    Away,
}

impl BackendStatus {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Away => "away",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome of an engine liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Engine answered and reports itself healthy
    Healthy,
    /// Engine answered but reports a degraded state
    Degraded(String),
    /// Connection or protocol failure during the probe
    Unreachable(String),
}

/// Map a probe outcome to a [`BackendStatus`].
///
/// A degraded engine is `Ok` only when `accept_degraded` is set.
#[must_use]
pub fn evaluate(engine: &str, probe: Probe, accept_degraded: bool) -> BackendStatus {
    match probe {
        Probe::Healthy => BackendStatus::Ok,
        Probe::Degraded(reason) if accept_degraded => {
            tracing::debug!(engine, %reason, "degraded state accepted");
            BackendStatus::Ok
        }
        Probe::Degraded(reason) => {
            tracing::error!(engine, %reason, "engine is degraded");
            BackendStatus::Error
        }
        Probe::Unreachable(reason) => {
            tracing::error!(engine, %reason, "engine is unreachable");
            BackendStatus::Away
        }
    }
}
