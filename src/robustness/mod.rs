//! Robustness analysis of causal chains.
//!
//! The pipeline runs in four stages over the unit cube of free transform
//! parameters of a [`Scenario`](crate::scene::Scenario):
//!
//! 1. [`sampler`]: find successful samples, steering proposals towards
//!    samples that trigger more events of the causal graph.
//! 2. [`attribution`]: relate each event to the dimensions its outcome
//!    depends on.
//! 3. [`active`]: learn the success boundary with an SVC, querying new
//!    labels where the classifier is uncertain.
//! 4. [`crate::optimize`]: move a solution as far from that boundary as the
//!    physical constraints allow.

pub mod active;
pub mod attribution;
pub mod cache;
pub mod distributions;
pub mod estimator;
pub mod oracle;
pub mod sampler;
pub mod sobol;
pub mod svm;

#[cfg(test)]
pub(crate) mod testing;

use indexmap::IndexMap;

pub use active::{
    learn_active, learn_factorized, ActiveLearner, ActiveLearningSettings, ActiveLearningTrace,
    ProposalShaping, QueryStrategy, ScalerDiagonal,
};
pub use attribution::{map_events_to_dimensions, mutual_information};
pub use cache::LabelCache;
pub use distributions::{
    GaussianComponent, MixtureOfGaussians, MultivariateUniform, ProposalDistribution,
    SobolSequence,
};
pub use estimator::{train_svc, BoundaryEstimator, StandardScaler, SvcSettings};
pub use oracle::{
    compute_event_labels, compute_label, Label, LabelOracle, SimulationOracle, SimulationSettings,
};
pub use sampler::{
    find_physically_valid_samples, find_successful_samples_adaptive,
    find_successful_samples_uniform, SampleSet, SamplingSettings,
};

/// Point in the unit cube of free parameters.
pub type Sample = Vec<f64>;

/// Dimensions relevant to each event.
pub type DimensionAssignment = IndexMap<String, Vec<usize>>;
