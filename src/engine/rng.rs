//! Deterministic random number generation.
//!
//! PCG64 with partitioned streams. Every random draw in the sampling,
//! learning and optimization loops goes through [`SimRng`], so a pipeline run
//! is reproducible from the configured master seed.

use rand::prelude::*;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

/// Golden-ratio increment used to derive partition seeds.
const STREAM_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Deterministic, reproducible random number generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimRng {
    /// Master seed for reproducibility.
    master_seed: u64,
    /// Current stream index for partitioning.
    stream: u64,
    /// Internal PCG state.
    rng: Pcg64,
}

impl SimRng {
    /// Create a new RNG with the given master seed.
    #[must_use]
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            stream: 0,
            rng: Pcg64::seed_from_u64(master_seed),
        }
    }

    /// Get the master seed.
    #[must_use]
    pub const fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Get current stream index.
    #[must_use]
    pub const fn stream(&self) -> u64 {
        self.stream
    }

    /// Create partitioned RNGs, one per parallel task.
    ///
    /// Each partition gets an independent stream derived from the master seed,
    /// so results do not depend on which worker picks up which task.
    #[must_use]
    pub fn partition(&mut self, n: usize) -> Vec<Self> {
        let partitions: Vec<Self> = (0..n)
            .map(|i| {
                let stream = self.stream + i as u64;
                let seed = self
                    .master_seed
                    .wrapping_add(stream.wrapping_mul(STREAM_STRIDE));
                Self {
                    master_seed: self.master_seed,
                    stream,
                    rng: Pcg64::seed_from_u64(seed),
                }
            })
            .collect();

        self.stream += n as u64;
        partitions
    }

    /// Generate a random f64 in [0, 1).
    pub fn gen_f64(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Generate a random f64 in `[min, max)`.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    pub fn gen_range_f64(&mut self, min: f64, max: f64) -> f64 {
        assert!(min <= max, "Invalid range: min > max");
        min + (max - min) * self.gen_f64()
    }

    /// Generate a uniform index in `0..n` (`n` must be non-zero).
    pub fn gen_index(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n.max(1))
    }

    /// Generate a random u64.
    pub fn gen_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Generate a standard normal sample using Box-Muller transform.
    pub fn gen_standard_normal(&mut self) -> f64 {
        let u1 = self.gen_f64();
        let u2 = self.gen_f64();

        // Avoid log(0)
        let u1 = if u1 < f64::EPSILON { f64::EPSILON } else { u1 };

        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Generate a normal sample with given mean and std.
    pub fn gen_normal(&mut self, mean: f64, std: f64) -> f64 {
        mean + std * self.gen_standard_normal()
    }

    /// Draw an index with probability proportional to `weights`.
    ///
    /// Non-finite and negative weights count as zero. When every weight is
    /// zero the draw is uniform.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> usize {
        let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f64 = weights.iter().copied().map(clean).sum();
        if total <= 0.0 {
            return self.gen_index(weights.len());
        }

        let mut target = self.gen_f64() * total;
        for (i, &w) in weights.iter().enumerate() {
            let w = clean(w);
            if target < w {
                return i;
            }
            target -= w;
        }
        // Rounding can leave a tiny remainder; fall back to the last positive weight.
        weights
            .iter()
            .rposition(|&w| clean(w) > 0.0)
            .unwrap_or(0)
    }
}
