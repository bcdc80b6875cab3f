//! DST - Deterministic Simulation Testing
//!
//! TigerBeetle/FoundationDB-style fault injection for engine adapters.
//!
//! # Philosophy
//!
//! > "If you're not testing with fault injection, you're not testing."
//!
//! # Usage
//!
//! ```rust
//! use lrs_core::dst::{DeterministicRng, FaultConfig, FaultInjector, FaultType};
//!
//! let mut faults = FaultInjector::new(DeterministicRng::new(42));
//! faults.register(FaultConfig::new(FaultType::ConnectionRefused, 1.0).with_filter("status"));
//! assert_eq!(faults.should_inject("status"), Some(FaultType::ConnectionRefused));
//! assert_eq!(faults.should_inject("read"), None);
//! ```
//!
//! Run with explicit seed for reproducibility:
//! ```bash
//! DST_SEED=12345 cargo test
//! ```

mod config;
mod fault;
mod rng;

pub use config::{property_seeds, SimConfig};
pub use fault::{FaultConfig, FaultInjector, FaultType};
pub use rng::DeterministicRng;
