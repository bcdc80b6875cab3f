//! DeterministicRng - Seeded Random Number Generator
//!
//! TigerStyle: ChaCha20-based RNG; every random choice in a simulation
//! flows through it so a seed replays a run exactly.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A deterministic random number generator.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    rng: ChaCha20Rng,
    seed: u64,
    fork_counter: u64,
}

impl DeterministicRng {
    /// Create a new RNG with the given seed.
    ///
    /// # Example
    /// ```
    /// use lrs_core::dst::DeterministicRng;
    /// let mut a = DeterministicRng::new(42);
    /// let mut b = DeterministicRng::new(42);
    /// assert_eq!(a.next_u64(), b.next_u64());
    /// ```
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
            fork_counter: 0,
        }
    }

    /// Get the original seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generate a random float in [0, 1).
    pub fn next_float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Generate a random u64.
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Generate a random usize in [min, max] (inclusive).
    ///
    /// # Panics
    /// Panics if min > max.
    pub fn next_usize(&mut self, min: usize, max: usize) -> usize {
        assert!(min <= max, "min ({min}) must be <= max ({max})");
        self.rng.gen_range(min..=max)
    }

    /// Generate a random boolean with the given probability of true.
    ///
    /// # Panics
    /// Panics if probability is not in [0, 1].
    pub fn next_bool(&mut self, probability: f64) -> bool {
        assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1], got {probability}"
        );
        self.next_float() < probability
    }

    /// Choose a random element from a slice.
    ///
    /// # Panics
    /// Panics if the slice is empty.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        assert!(!items.is_empty(), "cannot choose from empty slice");
        &items[self.next_usize(0, items.len() - 1)]
    }

    /// Shuffle a mutable slice in place (Fisher-Yates).
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_usize(0, i);
            items.swap(i, j);
        }
    }

    /// Instant within `spread_secs` seconds after `base`, whole seconds only.
    ///
    /// Small spreads produce many identical timestamps, which is what
    /// tie-breaker tests need.
    pub fn next_timestamp(&mut self, base: DateTime<Utc>, spread_secs: u32) -> DateTime<Utc> {
        let offset = self.next_usize(0, spread_secs as usize);
        base + Duration::seconds(i64::try_from(offset).unwrap_or(i64::MAX))
    }

    /// Random hex identifier of `bytes` bytes.
    pub fn next_hex_id(&mut self, bytes: usize) -> String {
        assert!(bytes > 0 && bytes <= 64, "bytes must be in [1, 64]");
        let mut buf = vec![0u8; bytes];
        self.rng.fill(&mut buf[..]);
        hex::encode(buf)
    }

    /// Create an independent fork of this RNG.
    pub fn fork(&mut self) -> Self {
        // golden-ratio increment spreads fork seeds
        let fork_seed = self.seed.wrapping_add(
            self.fork_counter
                .wrapping_add(1)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        self.fork_counter += 1;
        Self::new(fork_seed)
    }
}
