//! Active learning of the success boundary.
//!
//! Starting from labeled samples, an SVC is trained and then refined by
//! querying the oracle where the classifier is least certain: candidates
//! are drawn from a [`QueryStrategy`] distribution and only those closest
//! to the decision boundary are labeled.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::attribution::{map_events_to_dimensions, AttributionSettings};
use super::distributions::{
    GaussianComponent, MixtureOfGaussians, MultivariateUniform, ProposalDistribution,
};
use super::estimator::{train_svc, BoundaryEstimator, SvcSettings};
use super::oracle::LabelOracle;
use super::sampler::{find_physically_valid_samples, SampleSet};
use super::Sample;
use crate::engine::{SimRng, WorkerPool};
use crate::error::{ChainError, ChainResult};

/// Valid candidates drawn per queried sample.
const CANDIDATE_FACTOR: usize = 10;

/// Proposal draws allowed per queried sample.
const TRIAL_FACTOR: usize = 1000;

/// Where new queries are proposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    /// Uniformly over the learned dimensions.
    Uniform,
    /// Around training samples the estimator gets wrong.
    #[default]
    Misclassified,
    /// Around the support vectors.
    SupportVectors,
}

impl QueryStrategy {
    /// Parse a strategy name.
    ///
    /// # Errors
    ///
    /// Returns a config error for unknown names.
    pub fn from_name(name: &str) -> ChainResult<Self> {
        match name {
            "uniform" => Ok(Self::Uniform),
            "misclassified" => Ok(Self::Misclassified),
            "support_vectors" => Ok(Self::SupportVectors),
            other => Err(ChainError::config(format!("unknown query strategy '{other}'"))),
        }
    }
}

/// Covariance of the Gaussian placed around a query anchor.
pub trait ProposalShaping: Sync {
    /// Per-dimension variances for an anchor at distance `margin` from the
    /// boundary, for samples of dimension `width`.
    fn variances(&self, estimator: &BoundaryEstimator, margin: f64, width: usize) -> Vec<f64>;
}

/// `margin / scale` on the estimator's dimensions, zero elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalerDiagonal;

impl ProposalShaping for ScalerDiagonal {
    fn variances(&self, estimator: &BoundaryEstimator, margin: f64, width: usize) -> Vec<f64> {
        let mut variances = vec![0.0; width];
        for (&d, &s) in estimator.dims().iter().zip(estimator.scale()) {
            if d < width {
                variances[d] = margin / s;
            }
        }
        variances
    }
}

/// Active learning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveLearningSettings {
    /// Stop once the cross-validated accuracy reaches this value.
    pub accuracy: f64,
    /// Samples queried per iteration.
    pub n_k: usize,
    /// Maximum number of iterations.
    pub k_max: usize,
    /// Query distribution.
    pub strategy: QueryStrategy,
    /// Classifier grid search.
    pub svc: SvcSettings,
}

impl Default for ActiveLearningSettings {
    fn default() -> Self {
        Self {
            accuracy: 0.9,
            n_k: 10,
            k_max: 10,
            strategy: QueryStrategy::default(),
            svc: SvcSettings::default(),
        }
    }
}

/// One training pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Training set size.
    pub n_samples: usize,
    /// Successes in the training set.
    pub n_successes: usize,
    /// Cross-validated accuracy.
    pub score: f64,
}

/// History of an active learning run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveLearningTrace {
    /// Every training pass before calibration, in order.
    pub steps: Vec<TraceStep>,
    /// Final training set.
    pub samples: Vec<Sample>,
    /// Final training labels.
    pub labels: Vec<bool>,
}

impl ActiveLearningTrace {
    fn record(&mut self, samples: &[Sample], labels: &[bool], score: f64) {
        self.steps.push(TraceStep {
            n_samples: samples.len(),
            n_successes: labels.iter().filter(|&&l| l).count(),
            score,
        });
    }

    /// Score of the last training pass.
    #[must_use]
    pub fn final_score(&self) -> Option<f64> {
        self.steps.last().map(|s| s.score)
    }
}

/// Build the query distribution of `strategy`, or `None` when it has no
/// anchor to work from.
///
/// # Errors
///
/// Returns an error if the distribution cannot be built.
pub fn query_distribution(
    strategy: QueryStrategy,
    samples: &[Sample],
    labels: &[bool],
    estimator: &BoundaryEstimator,
    shaping: &dyn ProposalShaping,
    rng: &mut SimRng,
) -> ChainResult<Option<Box<dyn ProposalDistribution>>> {
    let width = samples.first().map_or(0, Vec::len);
    let anchors: Vec<usize> = match strategy {
        QueryStrategy::Uniform => {
            return uniform_distribution(samples, labels, estimator, rng).map(Some);
        }
        QueryStrategy::Misclassified => (0..samples.len())
            .filter(|&i| estimator.predict(&samples[i]) != labels[i])
            .collect(),
        QueryStrategy::SupportVectors => estimator.support().to_vec(),
    };
    if anchors.is_empty() {
        return Ok(None);
    }

    let margins: Vec<f64> = anchors
        .iter()
        .map(|&i| estimator.decision_function(&samples[i]).abs())
        .collect();
    let components = anchors
        .iter()
        .zip(&margins)
        .map(|(&i, &margin)| GaussianComponent {
            mean: samples[i].clone(),
            variances: shaping.variances(estimator, margin, width),
        })
        .collect();
    Ok(Some(Box::new(MixtureOfGaussians::new(components, margins)?)))
}

/// Uniform over the estimator's dimensions; other coordinates are copied
/// from a random successful sample.
fn uniform_distribution(
    samples: &[Sample],
    labels: &[bool],
    estimator: &BoundaryEstimator,
    rng: &mut SimRng,
) -> ChainResult<Box<dyn ProposalDistribution>> {
    let width = samples.first().map_or(0, Vec::len);
    if estimator.dims().len() >= width {
        return Ok(Box::new(MultivariateUniform::unit(width)));
    }
    let successes: Vec<usize> = (0..labels.len()).filter(|&i| labels[i]).collect();
    let anchor = &samples[successes[rng.gen_index(successes.len())]];
    let mut low = anchor.clone();
    let mut high = anchor.clone();
    for &d in estimator.dims() {
        low[d] = 0.0;
        high[d] = 1.0;
    }
    Ok(Box::new(MultivariateUniform::new(low, high)?))
}

/// Boundary learner over an oracle.
pub struct ActiveLearner<'a, O: ?Sized> {
    oracle: &'a O,
    settings: ActiveLearningSettings,
    dims: Option<Vec<usize>>,
    event: Option<String>,
    shaping: Box<dyn ProposalShaping + 'a>,
}

impl<'a, O: LabelOracle + ?Sized> ActiveLearner<'a, O> {
    /// Learner of the global success label over every dimension.
    #[must_use]
    pub fn new(oracle: &'a O, settings: ActiveLearningSettings) -> Self {
        Self {
            oracle,
            settings,
            dims: None,
            event: None,
            shaping: Box::new(ScalerDiagonal),
        }
    }

    /// Restrict the classifier to `dims`.
    #[must_use]
    pub fn with_dims(mut self, dims: Vec<usize>) -> Self {
        self.dims = Some(dims);
        self
    }

    /// Learn the outcome of `event` instead of the global label.
    #[must_use]
    pub fn for_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Replace the proposal covariance heuristic.
    #[must_use]
    pub fn with_shaping(mut self, shaping: impl ProposalShaping + 'a) -> Self {
        self.shaping = Box::new(shaping);
        self
    }

    fn label_batch(&self, batch: &[Sample], pool: &WorkerPool) -> ChainResult<Vec<Option<bool>>> {
        match &self.event {
            None => pool.try_map(batch, |_, s| Ok(self.oracle.label(s)?.as_bool())),
            Some(event) => pool.try_map(batch, |_, s| {
                let (_, events) = self.oracle.label_with_events(s)?;
                Ok(events.get(event).copied().flatten())
            }),
        }
    }

    /// Run the learning loop from initial labeled samples.
    ///
    /// Unlabeled (`None`) samples are dropped. The loop stops when the
    /// cross-validated accuracy reaches the target, after `k_max`
    /// iterations, when the strategy has no anchor, or when no valid
    /// candidate can be found. The returned estimator is retrained with
    /// probability estimates.
    ///
    /// # Errors
    ///
    /// Returns a learning error if the initial data lacks a class, and
    /// propagates oracle errors.
    pub fn run(
        &self,
        init_samples: &[Sample],
        init_labels: &[Option<bool>],
        rng: &mut SimRng,
        pool: &WorkerPool,
    ) -> ChainResult<(BoundaryEstimator, ActiveLearningTrace)> {
        let (mut samples, mut labels): (Vec<Sample>, Vec<bool>) = init_samples
            .iter()
            .zip(init_labels)
            .filter_map(|(s, l)| l.map(|l| (s.clone(), l)))
            .unzip();
        let dims = self.dims.as_deref();
        let svc = &self.settings.svc;
        info!(
            event = self.event.as_deref().unwrap_or("<global>"),
            ?dims,
            n = samples.len(),
            "starting active learning"
        );

        let mut trace = ActiveLearningTrace::default();
        let (mut estimator, mut score) = train_svc(&samples, &labels, dims, false, svc, pool)?;
        trace.record(&samples, &labels, score);

        let n_k = self.settings.n_k;
        let mut k = 0;
        while k < self.settings.k_max && score < self.settings.accuracy {
            let Some(distribution) = query_distribution(
                self.settings.strategy,
                &samples,
                &labels,
                &estimator,
                self.shaping.as_ref(),
                rng,
            )?
            else {
                info!(step = k, "no query anchor left");
                break;
            };
            let mut candidates = find_physically_valid_samples(
                self.oracle,
                distribution.as_ref(),
                CANDIDATE_FACTOR * n_k,
                TRIAL_FACTOR * n_k,
                rng,
                pool,
            )?;
            if candidates.is_empty() {
                warn!(step = k, "no valid candidate to query");
                break;
            }

            let margins: Vec<f64> = candidates
                .iter()
                .map(|c| estimator.decision_function(c).abs())
                .collect();
            let mut order: Vec<usize> = (0..candidates.len()).collect();
            order.sort_by(|&a, &b| margins[a].total_cmp(&margins[b]));
            order.truncate(n_k);
            let batch: Vec<Sample> = order
                .into_iter()
                .map(|i| std::mem::take(&mut candidates[i]))
                .collect();

            let new_labels = self.label_batch(&batch, pool)?;
            for (sample, label) in batch.into_iter().zip(new_labels) {
                if let Some(label) = label {
                    samples.push(sample);
                    labels.push(label);
                }
            }

            (estimator, score) = train_svc(&samples, &labels, dims, false, svc, pool)?;
            trace.record(&samples, &labels, score);
            k += 1;
            info!(step = k, score, n = samples.len(), "active learning step");
        }

        let (estimator, _) = train_svc(&samples, &labels, dims, true, svc, pool)?;
        trace.samples = samples;
        trace.labels = labels;
        Ok((estimator, trace))
    }
}

/// Learn the global success boundary.
///
/// # Errors
///
/// See [`ActiveLearner::run`].
pub fn learn_active<O: LabelOracle + ?Sized>(
    oracle: &O,
    samples: &[Sample],
    labels: &[Option<bool>],
    settings: &ActiveLearningSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<(BoundaryEstimator, ActiveLearningTrace)> {
    ActiveLearner::new(oracle, *settings).run(samples, labels, rng, pool)
}

/// One estimator per event that depends on at least one dimension.
///
/// Dimensions come from [`map_events_to_dimensions`] on the sample set's
/// event labels; each learner then only sees its event's dimensions and
/// labels.
///
/// # Errors
///
/// Propagates attribution, learning and oracle errors.
pub fn learn_factorized<O: LabelOracle + ?Sized>(
    oracle: &O,
    set: &SampleSet,
    attribution: &AttributionSettings,
    settings: &ActiveLearningSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<IndexMap<String, (BoundaryEstimator, ActiveLearningTrace)>> {
    let assignment = map_events_to_dimensions(
        &set.samples,
        &set.event_labels,
        attribution.invar_success_rate,
        attribution.select_coeff,
        rng,
    )?;
    let mut estimators = IndexMap::new();
    for (event, dims) in assignment {
        if dims.is_empty() {
            continue;
        }
        let labels = &set.event_labels[&event];
        let result = ActiveLearner::new(oracle, *settings)
            .with_dims(dims)
            .for_event(event.clone())
            .run(&set.samples, labels, rng, pool)?;
        estimators.insert(event, result);
    }
    Ok(estimators)
}
