//! SimConfig - Simulation Configuration
//!
//! TigerStyle: Seed management for deterministic testing.

use std::env;

use rand::Rng;

use super::rng::DeterministicRng;
use crate::constants::{DST_PROPERTY_SEEDS_COUNT_DEFAULT, DST_SIMULATION_STEPS_MAX};

/// Configuration for a simulation run.
///
/// TigerStyle:
/// - Immutable after creation
/// - Seed logged for reproducibility
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    seed: u64,
    steps_max: u64,
}

impl SimConfig {
    /// Create config with explicit seed.
    ///
    /// # Example
    /// ```
    /// use lrs_core::dst::SimConfig;
    /// let config = SimConfig::with_seed(12345);
    /// assert_eq!(config.seed(), 12345);
    /// ```
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            steps_max: DST_SIMULATION_STEPS_MAX,
        }
    }

    /// Create config from the `DST_SEED` env var, or a random seed.
    ///
    /// A random seed is logged so the run can be replayed.
    ///
    /// # Panics
    /// Panics if `DST_SEED` is set but is not a valid u64.
    #[must_use]
    pub fn from_env_or_random() -> Self {
        let seed = match env::var("DST_SEED") {
            Ok(raw) => raw
                .parse::<u64>()
                .unwrap_or_else(|_| panic!("DST_SEED must be a valid u64, got: {raw}")),
            Err(_) => {
                let seed = rand::thread_rng().gen::<u64>();
                tracing::info!(seed, "DST: generated random seed (replay with DST_SEED)");
                seed
            }
        };
        Self::with_seed(seed)
    }

    /// Get the seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Get the maximum number of steps.
    #[must_use]
    pub fn steps_max(&self) -> u64 {
        self.steps_max
    }

    /// Create a new config with a different steps_max.
    ///
    /// # Panics
    /// Panics if `steps_max` is zero.
    #[must_use]
    pub fn with_steps_max(self, steps_max: u64) -> Self {
        assert!(steps_max > 0, "steps_max must be positive");
        Self { steps_max, ..self }
    }

    /// RNG seeded from this config.
    #[must_use]
    pub fn rng(&self) -> DeterministicRng {
        DeterministicRng::new(self.seed)
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::from_env_or_random()
    }
}

/// Seeds for a multi-seed property loop: `0, 1, 42`, then seeds derived
/// from `DST_SEED` (or 0xC0FFEE), so failures replay.
#[must_use]
pub fn property_seeds(count: u64) -> Vec<u64> {
    let count = if count == 0 {
        DST_PROPERTY_SEEDS_COUNT_DEFAULT
    } else {
        count
    };
    let base = env::var("DST_SEED")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0x00C0_FFEE);

    let mut seeds = vec![0, 1, 42];
    let mut rng = DeterministicRng::new(base);
    while (seeds.len() as u64) < count {
        seeds.push(rng.next_u64());
    }
    seeds.truncate(usize::try_from(count).unwrap_or(usize::MAX));
    seeds
}
