//! FaultInjector - Probabilistic Fault Injection
//!
//! TigerStyle: Explicit fault injection for chaos testing of engine
//! adapters.

use std::collections::HashMap;
use std::sync::Mutex;

use super::rng::DeterministicRng;
use crate::constants::DST_FAULT_PROBABILITY_MAX;
use crate::error::BackendError;

/// Types of faults a simulated engine can suffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    // =========================================================================
    // Connectivity
    // =========================================================================
    /// Connection refused before the request is sent
    ConnectionRefused,
    /// Request sent, no answer in time
    Timeout,

    // =========================================================================
    // Engine state
    // =========================================================================
    /// Engine answers but reports a degraded internal state
    Degraded,
    /// Execution context (point in time, snapshot) expired between pages
    ContextExpired,
    /// Engine answered with a body it could not have meant
    MalformedResponse,

    // =========================================================================
    // Bulk
    // =========================================================================
    /// Whole chunk refused (cluster blocked, disk full)
    ChunkRejected,
    /// Some records of a chunk refused, the rest applied
    PartialChunk,
}

impl FaultType {
    /// Get the fault type name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::Timeout => "timeout",
            Self::Degraded => "degraded",
            Self::ContextExpired => "context_expired",
            Self::MalformedResponse => "malformed_response",
            Self::ChunkRejected => "chunk_rejected",
            Self::PartialChunk => "partial_chunk",
        }
    }

    /// True for faults that make the engine unreachable.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::ConnectionRefused | Self::Timeout)
    }

    /// Error an engine adapter would surface for this fault.
    #[must_use]
    pub fn to_error(&self, operation: &str) -> BackendError {
        BackendError::simulated_fault(format!("{} during {operation}", self.as_str()))
    }
}

/// Configuration for a specific fault.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// The type of fault
    pub fault_type: FaultType,
    /// Probability of injection (0.0 to 1.0)
    pub probability: f64,
    /// Optional operation filter (substring match)
    pub operation_filter: Option<String>,
    /// Maximum number of injections (None = unlimited)
    pub max_injections: Option<u64>,
}

impl FaultConfig {
    /// Create a new fault configuration.
    ///
    /// # Panics
    /// Panics if probability is not in [0, 1].
    #[must_use]
    pub fn new(fault_type: FaultType, probability: f64) -> Self {
        assert!(
            (0.0..=DST_FAULT_PROBABILITY_MAX).contains(&probability),
            "probability must be in [0, {DST_FAULT_PROBABILITY_MAX}], got {probability}"
        );

        Self {
            fault_type,
            probability,
            operation_filter: None,
            max_injections: None,
        }
    }

    /// Only inject into operations whose name contains `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.operation_filter = Some(filter.into());
        self
    }

    /// Set maximum number of injections.
    ///
    /// # Panics
    /// Panics if `max` is zero.
    #[must_use]
    pub fn with_max_injections(mut self, max: u64) -> Self {
        assert!(max > 0, "max_injections must be positive");
        self.max_injections = Some(max);
        self
    }
}

/// Fault injector for simulation testing.
///
/// TigerStyle:
/// - Explicit fault registration
/// - Deterministic through RNG
/// - Interior mutability for sharing via Arc
#[derive(Debug)]
pub struct FaultInjector {
    rng: Mutex<DeterministicRng>,
    configs: Vec<FaultConfig>,
    injection_counts: Mutex<HashMap<FaultType, u64>>,
}

impl FaultInjector {
    /// Create a new fault injector with the given RNG.
    #[must_use]
    pub fn new(rng: DeterministicRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            configs: Vec::new(),
            injection_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fault configuration.
    ///
    /// Registration must happen before sharing via Arc.
    pub fn register(&mut self, config: FaultConfig) {
        self.injection_counts
            .lock()
            .unwrap()
            .entry(config.fault_type)
            .or_insert(0);
        self.configs.push(config);
    }

    /// Check if a fault should be injected for the given operation.
    pub fn should_inject(&self, operation: &str) -> Option<FaultType> {
        for config in &self.configs {
            if let Some(ref filter) = config.operation_filter {
                if !operation.contains(filter.as_str()) {
                    continue;
                }
            }

            let mut counts = self.injection_counts.lock().unwrap();
            let count = counts.entry(config.fault_type).or_insert(0);
            if config.max_injections.is_some_and(|max| *count >= max) {
                continue;
            }

            let roll = self.rng.lock().unwrap().next_bool(config.probability);
            if roll {
                *count += 1;
                return Some(config.fault_type);
            }
        }
        None
    }

    /// Injections so far, by fault name.
    #[must_use]
    pub fn injection_stats(&self) -> HashMap<String, u64> {
        self.injection_counts
            .lock()
            .unwrap()
            .iter()
            .map(|(fault, count)| (fault.as_str().to_string(), *count))
            .collect()
    }

    /// Get total number of injections.
    #[must_use]
    pub fn total_injections(&self) -> u64 {
        self.injection_counts.lock().unwrap().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_no_faults_registered() {
        let injector = FaultInjector::new(DeterministicRng::new(42));
        for _ in 0..100 {
            assert!(injector.should_inject("write").is_none());
        }
    }

    #[test]
    fn test_always_and_never() {
        let mut injector = FaultInjector::new(DeterministicRng::new(42));
        injector.register(FaultConfig::new(FaultType::Timeout, 0.0));
        injector.register(FaultConfig::new(FaultType::ChunkRejected, 1.0));
        for _ in 0..10 {
            assert_eq!(
                injector.should_inject("write_chunk"),
                Some(FaultType::ChunkRejected)
            );
        }
    }

    #[test]
    fn test_operation_filter() {
        let mut injector = FaultInjector::new(DeterministicRng::new(42));
        injector.register(FaultConfig::new(FaultType::ConnectionRefused, 1.0).with_filter("status"));

        assert_eq!(
            injector.should_inject("status"),
            Some(FaultType::ConnectionRefused)
        );
        assert!(injector.should_inject("read").is_none());
    }

    #[test]
    fn test_max_injections() {
        let mut injector = FaultInjector::new(DeterministicRng::new(42));
        injector.register(FaultConfig::new(FaultType::ContextExpired, 1.0).with_max_injections(2));

        assert!(injector.should_inject("read").is_some());
        assert!(injector.should_inject("read").is_some());
        assert!(injector.should_inject("read").is_none());
        assert_eq!(injector.injection_stats().get("context_expired"), Some(&2));
    }

    #[test]
    fn test_arc_sharing() {
        let mut injector = FaultInjector::new(DeterministicRng::new(42));
        injector.register(FaultConfig::new(FaultType::Timeout, 1.0));
        let injector = Arc::new(injector);
        let shared = Arc::clone(&injector);

        assert!(injector.should_inject("read").is_some());
        assert!(shared.should_inject("read").is_some());
        assert_eq!(injector.total_injections(), 2);
    }

    #[test]
    fn test_fault_error_is_transient() {
        let err = FaultType::Timeout.to_error("status");
        assert!(err.is_transient());
        assert!(err.to_string().contains("timeout during status"));
        assert!(FaultType::ConnectionRefused.is_connectivity());
        assert!(!FaultType::Degraded.is_connectivity());
    }

    #[test]
    #[should_panic(expected = "probability must be in")]
    fn test_invalid_probability() {
        let _ = FaultConfig::new(FaultType::Timeout, 1.5);
    }
}
