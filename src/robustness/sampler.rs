//! Adaptive search for successful samples.
//!
//! Sampling starts from a space-filling Sobol design and then concentrates
//! on the samples that made the most progress through the causal graph.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::distributions::{
    GaussianComponent, MixtureOfGaussians, MultivariateUniform, ProposalDistribution,
    SobolSequence,
};
use super::oracle::{Label, LabelOracle};
use super::Sample;
use crate::causal::EventLabels;
use crate::engine::{SimRng, WorkerPool};
use crate::error::ChainResult;

/// Parameters of the successful-sample search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Stop once this many successes are found.
    pub n_succ: usize,
    /// Initial number of valid samples.
    pub n_0: usize,
    /// Valid samples added per round.
    pub n_k: usize,
    /// Maximum number of rounds.
    pub k_max: usize,
    /// Isotropic variance of the mixture components.
    pub sigma: f64,
    /// Candidates drawn per wanted valid sample.
    pub trial_factor: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            n_succ: 100,
            n_0: 1000,
            n_k: 100,
            k_max: 10,
            sigma: 0.01,
            trial_factor: 100,
        }
    }
}

/// Labeled samples accumulated by a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    /// Physically valid samples.
    pub samples: Vec<Sample>,
    /// Global label of each sample.
    pub labels: Vec<Label>,
    /// Per-event label columns, aligned with `samples`.
    pub event_labels: IndexMap<String, Vec<Option<bool>>>,
    /// Number of successes at the start of each round.
    pub totals: Vec<usize>,
}

impl SampleSet {
    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if no sample was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of successful samples.
    #[must_use]
    pub fn n_successes(&self) -> usize {
        self.labels.iter().filter(|l| l.is_success()).count()
    }

    /// Labels as `Option<bool>` (`None` for invalid samples).
    #[must_use]
    pub fn success_labels(&self) -> Vec<Option<bool>> {
        self.labels.iter().map(|l| l.as_bool()).collect()
    }

    /// Append a labeled sample; events seen for the first time get `None`
    /// for every earlier sample.
    pub fn push(&mut self, sample: Sample, label: Label, events: Option<EventLabels>) {
        let row = self.samples.len();
        self.samples.push(sample);
        self.labels.push(label);
        let Some(events) = events else {
            return;
        };
        for (name, value) in events {
            self.event_labels
                .entry(name)
                .or_insert_with(|| vec![None; row])
                .push(value);
        }
        for column in self.event_labels.values_mut() {
            column.resize(row + 1, None);
        }
    }
}

/// Draw up to `max_trials` candidates and keep the first `n_valid` valid
/// ones, in draw order.
///
/// Running out of trials is not an error: a warning is logged and the
/// shorter list is returned.
///
/// # Errors
///
/// Propagates oracle errors.
pub fn find_physically_valid_samples<O, D>(
    oracle: &O,
    distribution: &D,
    n_valid: usize,
    max_trials: usize,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<Vec<Sample>>
where
    O: LabelOracle + ?Sized,
    D: ProposalDistribution + ?Sized,
{
    let mut valid = Vec::with_capacity(n_valid);
    if n_valid == 0 {
        return Ok(valid);
    }

    let candidates = distribution.sample(max_trials, rng);
    let batch = n_valid.max(pool.num_workers());
    for chunk in candidates.chunks(batch) {
        let flags = pool.try_map(chunk, |_, sample| oracle.is_physically_valid(sample))?;
        for (sample, ok) in chunk.iter().zip(flags) {
            if ok {
                valid.push(sample.clone());
                if valid.len() == n_valid {
                    return Ok(valid);
                }
            }
        }
    }

    warn!(
        found = valid.len(),
        wanted = n_valid,
        trials = max_trials,
        "ran out of trials looking for valid samples"
    );
    Ok(valid)
}

/// Number of successful events.
fn n_successful_events(events: &EventLabels) -> usize {
    events.values().filter(|v| **v == Some(true)).count()
}

/// Sample until `n_succ` successes are found or `k_max` rounds have run.
///
/// Each round fits a mixture of isotropic Gaussians (variance `sigma`) on
/// the `n_succ` samples with the most successful events, weighted by that
/// count, and draws `n_k` new valid samples from it.
///
/// # Errors
///
/// Returns a configuration error when the oracle has more dimensions than
/// the Sobol sequence supports, and propagates oracle errors.
pub fn find_successful_samples_adaptive<O: LabelOracle + ?Sized>(
    oracle: &O,
    settings: &SamplingSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<SampleSet> {
    let dims = oracle.dims();
    let initial = SobolSequence::unit(dims)?;

    let mut set = SampleSet::default();
    let mut progress = Vec::new();
    let samples = find_physically_valid_samples(
        oracle,
        &initial,
        settings.n_0,
        settings.trial_factor * settings.n_0,
        rng,
        pool,
    )?;
    label_into(oracle, samples, pool, &mut set, &mut progress)?;

    let mut k = 0;
    loop {
        let total = set.n_successes();
        info!(step = k, successes = total, samples = set.len(), "adaptive sampling");
        set.totals.push(total);
        if total >= settings.n_succ || k >= settings.k_max {
            break;
        }
        k += 1;

        let n_top = settings.n_succ.min(set.len());
        if n_top == 0 {
            warn!("no valid sample to adapt from");
            break;
        }
        let mut order: Vec<usize> = (0..set.len()).collect();
        order.sort_by(|&a, &b| progress[b].cmp(&progress[a]));
        let top = &order[..n_top];

        let components = top
            .iter()
            .map(|&i| GaussianComponent::isotropic(set.samples[i].clone(), settings.sigma))
            .collect();
        let weights = top.iter().map(|&i| progress[i] as f64).collect();
        let mixture = MixtureOfGaussians::new(components, weights)?;

        let samples = find_physically_valid_samples(
            oracle,
            &mixture,
            settings.n_k,
            settings.trial_factor * settings.n_k,
            rng,
            pool,
        )?;
        label_into(oracle, samples, pool, &mut set, &mut progress)?;
    }
    Ok(set)
}

fn label_into<O: LabelOracle + ?Sized>(
    oracle: &O,
    samples: Vec<Sample>,
    pool: &WorkerPool,
    set: &mut SampleSet,
    progress: &mut Vec<usize>,
) -> ChainResult<()> {
    let results = pool.try_map(&samples, |_, sample| oracle.label_with_events(sample))?;
    for (sample, (label, events)) in samples.into_iter().zip(results) {
        progress.push(n_successful_events(&events));
        set.push(sample, label, Some(events));
    }
    Ok(())
}

/// Baseline search drawing uniform samples each round.
///
/// # Errors
///
/// Propagates oracle errors.
pub fn find_successful_samples_uniform<O: LabelOracle + ?Sized>(
    oracle: &O,
    settings: &SamplingSettings,
    rng: &mut SimRng,
    pool: &WorkerPool,
) -> ChainResult<SampleSet> {
    let uniform = MultivariateUniform::unit(oracle.dims());
    let mut set = SampleSet::default();
    let mut k = 0;
    let mut wanted = settings.n_0;
    loop {
        let samples = find_physically_valid_samples(
            oracle,
            &uniform,
            wanted,
            settings.trial_factor * wanted,
            rng,
            pool,
        )?;
        let labels = pool.try_map(&samples, |_, sample| oracle.label(sample))?;
        for (sample, label) in samples.into_iter().zip(labels) {
            set.push(sample, label, None);
        }

        let total = set.n_successes();
        info!(step = k, successes = total, samples = set.len(), "uniform sampling");
        set.totals.push(total);
        if total >= settings.n_succ || k >= settings.k_max {
            break;
        }
        k += 1;
        wanted = settings.n_k;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robustness::sobol::MAX_SOBOL_DIMS;
    use crate::robustness::testing::DiskOracle;

    fn settings() -> SamplingSettings {
        SamplingSettings {
            n_succ: 20,
            n_0: 50,
            n_k: 20,
            k_max: 5,
            sigma: 0.01,
            trial_factor: 100,
        }
    }

    #[test]
    fn test_valid_samples_filter() {
        let oracle = DiskOracle::new(2).with_forbidden_corner(0.5);
        let mut rng = SimRng::new(1);
        let pool = WorkerPool::with_workers(2);
        let found = find_physically_valid_samples(
            &oracle,
            &MultivariateUniform::unit(2),
            30,
            1000,
            &mut rng,
            &pool,
        )
        .unwrap();
        assert_eq!(found.len(), 30);
        assert!(found.iter().all(|s| oracle.is_physically_valid(s).unwrap()));
    }

    #[test]
    fn test_valid_samples_run_out() {
        let oracle = DiskOracle::new(2).with_forbidden_corner(1.0);
        let mut rng = SimRng::new(1);
        let found = find_physically_valid_samples(
            &oracle,
            &MultivariateUniform::unit(2),
            5,
            50,
            &mut rng,
            &WorkerPool::with_workers(1),
        )
        .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_adaptive_finds_small_region() {
        // success disk of radius 0.1: about 3% of the cube
        let oracle = DiskOracle::new(2).with_radius(0.1);
        let mut rng = SimRng::new(42);
        let tight = SamplingSettings {
            n_k: 30,
            k_max: 10,
            sigma: 0.002,
            ..settings()
        };
        let set = find_successful_samples_adaptive(&oracle, &tight, &mut rng, &WorkerPool::new())
            .unwrap();
        assert!(set.n_successes() >= 20);
        assert_eq!(set.labels.len(), set.len());
        assert_eq!(set.event_labels["near"].len(), set.len());
        assert!(set.totals.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_adaptive_zero_rounds() {
        let oracle = DiskOracle::new(2).with_radius(0.1);
        let mut rng = SimRng::new(42);
        let set = find_successful_samples_adaptive(
            &oracle,
            &SamplingSettings {
                k_max: 0,
                ..settings()
            },
            &mut rng,
            &WorkerPool::with_workers(2),
        )
        .unwrap();
        assert_eq!(set.len(), 50);
        assert_eq!(set.totals.len(), 1);
    }

    #[test]
    fn test_adaptive_initial_design_in_high_dimensions() {
        let oracle = DiskOracle::new(25).with_radius(0.5);
        let mut rng = SimRng::new(3);
        let set = find_successful_samples_adaptive(
            &oracle,
            &SamplingSettings {
                k_max: 0,
                ..settings()
            },
            &mut rng,
            &WorkerPool::with_workers(2),
        )
        .unwrap();
        let expected = SobolSequence::unit(25).unwrap().sample(50, &mut SimRng::new(0));
        assert_eq!(set.samples, expected);
    }

    #[test]
    fn test_adaptive_rejects_unsupported_dimensions() {
        let oracle = DiskOracle::new(MAX_SOBOL_DIMS + 1);
        let mut rng = SimRng::new(3);
        let result =
            find_successful_samples_adaptive(&oracle, &settings(), &mut rng, &WorkerPool::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_adaptive_is_reproducible() {
        let oracle = DiskOracle::new(3).with_radius(0.2);
        let run = |workers| {
            let mut rng = SimRng::new(9);
            find_successful_samples_adaptive(
                &oracle,
                &settings(),
                &mut rng,
                &WorkerPool::with_workers(workers),
            )
            .unwrap()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn test_uniform_baseline() {
        let oracle = DiskOracle::new(2).with_radius(0.3);
        let mut rng = SimRng::new(5);
        let set =
            find_successful_samples_uniform(&oracle, &settings(), &mut rng, &WorkerPool::new())
                .unwrap();
        assert!(set.event_labels.is_empty());
        assert!(!set.totals.is_empty());
        assert_eq!(set.success_labels().len(), set.len());
    }

    #[test]
    fn test_sample_set_pads_new_events() {
        let mut set = SampleSet::default();
        set.push(vec![0.1], Label::Failure, None);
        let mut events = EventLabels::new();
        events.insert("a".into(), Some(true));
        set.push(vec![0.2], Label::Success, Some(events));
        assert_eq!(set.event_labels["a"], vec![None, Some(true)]);
    }
}
