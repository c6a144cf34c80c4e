//! Pipeline configuration with YAML loading and validation.
//!
//! Every field has a default, so an empty document is a valid
//! configuration. Unknown keys are rejected. Range checks run through
//! `validator`; cross-field checks run in [`ChainConfig::validate_semantic`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

use crate::engine::{SimTime, WorkerPool};
use crate::error::{ChainError, ChainResult};
use crate::optimize::OptimizerSettings;
use crate::robustness::active::{ActiveLearningSettings, QueryStrategy};
use crate::robustness::attribution::AttributionSettings;
use crate::robustness::estimator::{LogSpace, SvcSettings};
use crate::robustness::{SamplingSettings, SimulationSettings};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Schema version for forward compatibility.
    #[validate(length(min = 1))]
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Seeding.
    #[serde(default)]
    pub reproducibility: ReproducibilityConfig,

    /// Parallel labeling.
    #[validate(nested)]
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Physics simulation of one sample.
    #[validate(nested)]
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Successful-sample search.
    #[validate(nested)]
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Boundary learning.
    #[validate(nested)]
    #[serde(default)]
    pub active_learning: ActiveLearningConfig,

    /// Event-to-dimension attribution.
    #[validate(nested)]
    #[serde(default)]
    pub attribution: AttributionConfig,

    /// Robustness optimization.
    #[validate(nested)]
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            reproducibility: ReproducibilityConfig::default(),
            workers: WorkersConfig::default(),
            simulation: SimulationConfig::default(),
            sampling: SamplingConfig::default(),
            active_learning: ActiveLearningConfig::default(),
            attribution: AttributionConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - YAML parsing fails
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_yaml(yaml: &str) -> ChainResult<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        config.validate_semantic()?;
        Ok(config)
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_yaml(&self) -> ChainResult<String> {
        serde_yaml::to_string(self).map_err(|e| ChainError::serialization(e.to_string()))
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> ChainConfigBuilder {
        ChainConfigBuilder::default()
    }

    /// Cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violated constraint.
    pub fn validate_semantic(&self) -> ChainResult<()> {
        let sim = &self.simulation;
        if sim.timestep > sim.duration {
            return Err(ChainError::config(format!(
                "timestep {} exceeds duration {}",
                sim.timestep, sim.duration
            )));
        }
        if sim.max_wait_time < sim.timestep {
            return Err(ChainError::config(format!(
                "max_wait_time {} is shorter than one timestep",
                sim.max_wait_time
            )));
        }

        let al = &self.active_learning;
        for (name, range) in [("c_range", al.c_range), ("gamma_range", al.gamma_range)] {
            if range.num == 0 {
                return Err(ChainError::config(format!("{name} must contain at least one value")));
            }
            if range.start > range.stop {
                return Err(ChainError::config(format!("{name} start exceeds stop")));
            }
        }
        Ok(())
    }

    /// Simulation horizon and step.
    #[must_use]
    pub const fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            duration: self.simulation.duration,
            timestep: self.simulation.timestep,
        }
    }

    /// Event timeout.
    #[must_use]
    pub fn max_wait_time(&self) -> SimTime {
        SimTime::from_secs(self.simulation.max_wait_time)
    }

    /// Successful-sample search parameters.
    #[must_use]
    pub const fn sampling_settings(&self) -> SamplingSettings {
        let s = &self.sampling;
        SamplingSettings {
            n_succ: s.n_succ,
            n_0: s.n_0,
            n_k: s.n_k,
            k_max: s.k_max,
            sigma: s.sigma,
            trial_factor: s.trial_factor,
        }
    }

    /// Active learning parameters.
    #[must_use]
    pub const fn active_learning_settings(&self) -> ActiveLearningSettings {
        let a = &self.active_learning;
        ActiveLearningSettings {
            accuracy: a.accuracy,
            n_k: a.n_k,
            k_max: a.k_max,
            strategy: a.strategy,
            svc: SvcSettings {
                c_range: a.c_range,
                gamma_range: a.gamma_range,
                cv_folds: a.cv_folds,
                max_iter: a.max_iter,
            },
        }
    }

    /// Attribution thresholds.
    #[must_use]
    pub const fn attribution_settings(&self) -> AttributionSettings {
        AttributionSettings {
            invar_success_rate: self.attribution.invar_success_rate,
            select_coeff: self.attribution.select_coeff,
        }
    }

    /// Optimizer parameters.
    #[must_use]
    pub const fn optimizer_settings(&self) -> OptimizerSettings {
        let o = &self.optimizer;
        OptimizerSettings {
            smin_coeff: o.smin_coeff,
            sigma0: o.sigma0,
            max_fevals: o.max_fevals,
            max_iter: o.max_iter,
        }
    }

    /// Worker pool sized by `workers.cores` (all available cores if 0).
    #[must_use]
    pub fn worker_pool(&self) -> WorkerPool {
        match self.workers.cores {
            0 => WorkerPool::new(),
            n => WorkerPool::with_workers(n),
        }
    }
}

/// Builder for programmatic construction.
#[derive(Debug, Default)]
pub struct ChainConfigBuilder {
    seed: Option<u64>,
    cores: Option<usize>,
    duration: Option<f64>,
    timestep: Option<f64>,
    strategy: Option<QueryStrategy>,
}

impl ChainConfigBuilder {
    /// Set the master seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the number of labeling workers.
    #[must_use]
    pub const fn cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Set the simulated duration in seconds.
    #[must_use]
    pub const fn duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the timestep in seconds.
    #[must_use]
    pub const fn timestep(mut self, dt: f64) -> Self {
        self.timestep = Some(dt);
        self
    }

    /// Set the query strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: QueryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ChainConfig {
        let mut config = ChainConfig::default();
        if let Some(seed) = self.seed {
            config.reproducibility.seed = seed;
        }
        if let Some(cores) = self.cores {
            config.workers.cores = cores;
        }
        if let Some(duration) = self.duration {
            config.simulation.duration = duration;
        }
        if let Some(dt) = self.timestep {
            config.simulation.timestep = dt;
        }
        if let Some(strategy) = self.strategy {
            config.active_learning.strategy = strategy;
        }
        config
    }
}

/// Reproducibility settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReproducibilityConfig {
    /// Master seed for all RNG.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

const fn default_seed() -> u64 {
    42
}

impl Default for ReproducibilityConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Labeling threads; 0 uses every available core.
    #[validate(range(max = 1024))]
    #[serde(default)]
    pub cores: usize,
}

/// Simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Simulated time per sample in seconds.
    #[validate(range(min = 0.001, max = 3600.0))]
    #[serde(default = "default_duration")]
    pub duration: f64,
    /// Physics timestep in seconds.
    #[validate(range(min = 0.000_001, max = 1.0))]
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    /// Seconds an awake event may wait before failing.
    #[validate(range(min = 0.000_001))]
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: f64,
}

const fn default_duration() -> f64 {
    8.0
}

const fn default_timestep() -> f64 {
    1.0 / 500.0
}

const fn default_max_wait_time() -> f64 {
    2.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            timestep: default_timestep(),
            max_wait_time: default_max_wait_time(),
        }
    }
}

/// Successful-sample search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    /// Stop once this many successes are found.
    #[validate(range(min = 1))]
    #[serde(default = "default_n_succ")]
    pub n_succ: usize,
    /// Initial design size.
    #[validate(range(min = 1))]
    #[serde(default = "default_n_0")]
    pub n_0: usize,
    /// Samples added per round.
    #[validate(range(min = 1))]
    #[serde(default = "default_sampling_n_k")]
    pub n_k: usize,
    /// Maximum number of rounds.
    #[serde(default = "default_k_max")]
    pub k_max: usize,
    /// Variance of the proposal components.
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Proposal draws allowed per wanted valid sample.
    #[validate(range(min = 1))]
    #[serde(default = "default_trial_factor")]
    pub trial_factor: usize,
}

const fn default_n_succ() -> usize {
    100
}

const fn default_n_0() -> usize {
    1000
}

const fn default_sampling_n_k() -> usize {
    100
}

const fn default_k_max() -> usize {
    10
}

const fn default_sigma() -> f64 {
    0.01
}

const fn default_trial_factor() -> usize {
    100
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_succ: default_n_succ(),
            n_0: default_n_0(),
            n_k: default_sampling_n_k(),
            k_max: default_k_max(),
            sigma: default_sigma(),
            trial_factor: default_trial_factor(),
        }
    }
}

/// Active learning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ActiveLearningConfig {
    /// Target cross-validated accuracy.
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    /// Samples queried per iteration.
    #[validate(range(min = 1))]
    #[serde(default = "default_learning_n_k")]
    pub n_k: usize,
    /// Maximum number of iterations.
    #[serde(default = "default_k_max")]
    pub k_max: usize,
    /// Query distribution.
    #[serde(default)]
    pub strategy: QueryStrategy,
    /// Penalty grid (log10).
    #[serde(default = "default_c_range")]
    pub c_range: LogSpace,
    /// Kernel width grid (log10).
    #[serde(default = "default_gamma_range")]
    pub gamma_range: LogSpace,
    /// Cross-validation folds.
    #[validate(range(min = 2, max = 20))]
    #[serde(default = "default_cv_folds")]
    pub cv_folds: usize,
    /// SMO iteration cap.
    #[validate(range(min = 1))]
    #[serde(default = "default_svc_max_iter")]
    pub max_iter: usize,
}

const fn default_accuracy() -> f64 {
    0.9
}

const fn default_learning_n_k() -> usize {
    10
}

const fn default_c_range() -> LogSpace {
    LogSpace::new(-2.0, 3.0, 6)
}

const fn default_gamma_range() -> LogSpace {
    LogSpace::new(-3.0, 2.0, 6)
}

const fn default_cv_folds() -> usize {
    3
}

const fn default_svc_max_iter() -> usize {
    100_000
}

impl Default for ActiveLearningConfig {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy(),
            n_k: default_learning_n_k(),
            k_max: default_k_max(),
            strategy: QueryStrategy::default(),
            c_range: default_c_range(),
            gamma_range: default_gamma_range(),
            cv_folds: default_cv_folds(),
            max_iter: default_svc_max_iter(),
        }
    }
}

/// Attribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AttributionConfig {
    /// Events succeeding at least this often are invariant.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_invar_success_rate")]
    pub invar_success_rate: f64,
    /// Relative score threshold for keeping a dimension.
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    #[serde(default = "default_select_coeff")]
    pub select_coeff: f64,
}

const fn default_invar_success_rate() -> f64 {
    0.95
}

const fn default_select_coeff() -> f64 {
    0.1
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            invar_success_rate: default_invar_success_rate(),
            select_coeff: default_select_coeff(),
        }
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Soft-min sharpness.
    #[validate(range(min = 0.0))]
    #[serde(default = "default_smin_coeff")]
    pub smin_coeff: f64,
    /// Initial CMA-ES step size.
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[serde(default = "default_sigma0")]
    pub sigma0: f64,
    /// CMA-ES evaluation budget.
    #[validate(range(min = 1))]
    #[serde(default = "default_max_fevals")]
    pub max_fevals: usize,
    /// Iteration cap.
    #[validate(range(min = 1))]
    #[serde(default = "default_optimizer_max_iter")]
    pub max_iter: usize,
}

const fn default_smin_coeff() -> f64 {
    1.0
}

const fn default_sigma0() -> f64 {
    0.25
}

const fn default_max_fevals() -> usize {
    1000
}

const fn default_optimizer_max_iter() -> usize {
    100
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            smin_coeff: default_smin_coeff(),
            sigma0: default_sigma0(),
            max_fevals: default_max_fevals(),
            max_iter: default_optimizer_max_iter(),
        }
    }
}
