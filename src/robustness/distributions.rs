//! Proposal distributions over the design space.

use serde::{Deserialize, Serialize};

use super::sobol::SobolGenerator;
use super::Sample;
use crate::engine::SimRng;
use crate::error::{ChainError, ChainResult};

/// Source of candidate samples.
pub trait ProposalDistribution {
    /// Number of dimensions of the drawn samples.
    fn dims(&self) -> usize;

    /// Draw `n` samples.
    fn sample(&self, n: usize, rng: &mut SimRng) -> Vec<Sample>;
}

/// Independent uniform draws in a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultivariateUniform {
    low: Vec<f64>,
    high: Vec<f64>,
}

impl MultivariateUniform {
    /// Uniform over `[0, 1]^dims`.
    #[must_use]
    pub fn unit(dims: usize) -> Self {
        Self {
            low: vec![0.0; dims],
            high: vec![1.0; dims],
        }
    }

    /// Uniform over the box `[low, high]`; `low[i] == high[i]` pins a
    /// coordinate.
    ///
    /// # Errors
    ///
    /// Returns a dimension mismatch if the bounds differ in length, and a
    /// configuration error if some `low[i] > high[i]`.
    pub fn new(low: Vec<f64>, high: Vec<f64>) -> ChainResult<Self> {
        if low.len() != high.len() {
            return Err(ChainError::DimensionMismatch {
                expected: low.len(),
                found: high.len(),
            });
        }
        if low.iter().zip(&high).any(|(a, b)| a > b) {
            return Err(ChainError::config("uniform lower bound exceeds upper bound"));
        }
        Ok(Self { low, high })
    }
}

impl ProposalDistribution for MultivariateUniform {
    fn dims(&self) -> usize {
        self.low.len()
    }

    fn sample(&self, n: usize, rng: &mut SimRng) -> Vec<Sample> {
        (0..n)
            .map(|_| {
                self.low
                    .iter()
                    .zip(&self.high)
                    .map(|(&a, &b)| rng.gen_range_f64(a, b))
                    .collect()
            })
            .collect()
    }
}

/// Sobol sequence scaled to `[low, high]^dims`.
///
/// Every call restarts the sequence, so the draw does not consume the RNG.
#[derive(Debug, Clone)]
pub struct SobolSequence {
    generator: SobolGenerator,
    low: f64,
    high: f64,
}

impl SobolSequence {
    /// Sobol points over `[0, 1]^dims`.
    ///
    /// # Errors
    ///
    /// See [`SobolGenerator::new`].
    pub fn unit(dims: usize) -> ChainResult<Self> {
        Self::new(dims, 0.0, 1.0)
    }

    /// Sobol points over `[low, high]^dims`.
    ///
    /// # Errors
    ///
    /// See [`SobolGenerator::new`].
    pub fn new(dims: usize, low: f64, high: f64) -> ChainResult<Self> {
        Ok(Self {
            generator: SobolGenerator::new(dims)?,
            low,
            high,
        })
    }
}

impl ProposalDistribution for SobolSequence {
    fn dims(&self) -> usize {
        self.generator.dims()
    }

    fn sample(&self, n: usize, _rng: &mut SimRng) -> Vec<Sample> {
        let width = self.high - self.low;
        self.generator
            .generate(n)
            .into_iter()
            .map(|p| p.into_iter().map(|x| width * x + self.low).collect())
            .collect()
    }
}

/// Gaussian with diagonal covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianComponent {
    /// Mean.
    pub mean: Sample,
    /// Per-dimension variance; zero pins the coordinate to the mean.
    pub variances: Vec<f64>,
}

impl GaussianComponent {
    /// Isotropic component with covariance `variance · I`.
    #[must_use]
    pub fn isotropic(mean: Sample, variance: f64) -> Self {
        let variances = vec![variance; mean.len()];
        Self { mean, variances }
    }
}

/// Weighted mixture of diagonal Gaussians, clipped to `[low, high]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureOfGaussians {
    components: Vec<GaussianComponent>,
    weights: Vec<f64>,
    low: f64,
    high: f64,
}

impl MixtureOfGaussians {
    /// Create a mixture clipped to the unit cube.
    ///
    /// Weights are normalized; if they sum to zero (or are not finite) the
    /// mixture is uniform over its components.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no components, the weight count does
    /// not match, or components disagree on the dimension.
    pub fn new(components: Vec<GaussianComponent>, weights: Vec<f64>) -> ChainResult<Self> {
        let Some(first) = components.first() else {
            return Err(ChainError::config("mixture needs at least one component"));
        };
        if weights.len() != components.len() {
            return Err(ChainError::DimensionMismatch {
                expected: components.len(),
                found: weights.len(),
            });
        }
        let dims = first.mean.len();
        for c in &components {
            if c.mean.len() != dims || c.variances.len() != dims {
                return Err(ChainError::DimensionMismatch {
                    expected: dims,
                    found: c.mean.len().max(c.variances.len()),
                });
            }
        }

        let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
        let weights = if total > 0.0 {
            weights
                .iter()
                .map(|&w| if w.is_finite() && w > 0.0 { w / total } else { 0.0 })
                .collect()
        } else {
            vec![1.0 / components.len() as f64; components.len()]
        };

        Ok(Self {
            components,
            weights,
            low: 0.0,
            high: 1.0,
        })
    }

    /// Components.
    #[must_use]
    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    /// Normalized weights.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl ProposalDistribution for MixtureOfGaussians {
    fn dims(&self) -> usize {
        self.components.first().map_or(0, |c| c.mean.len())
    }

    fn sample(&self, n: usize, rng: &mut SimRng) -> Vec<Sample> {
        (0..n)
            .map(|_| {
                let c = &self.components[rng.choose_weighted(&self.weights)];
                c.mean
                    .iter()
                    .zip(&c.variances)
                    .map(|(&m, &v)| {
                        let x = if v > 0.0 { rng.gen_normal(m, v.sqrt()) } else { m };
                        x.clamp(self.low, self.high)
                    })
                    .collect()
            })
            .collect()
    }
}
