//! End-to-end robustness pipeline tests.
//!
//! A closed-form oracle stands in for physics so that each stage can be
//! checked against the true success region: a vertical strip
//! `|x0 - 0.5| < 0.2`, with samples above `x1 = 0.95` physically invalid.

use chainsim::causal::EventLabels;
use chainsim::config::ChainConfig;
use chainsim::engine::{SimRng, WorkerPool};
use chainsim::error::ChainResult;
use chainsim::optimize::{
    maximize_robustness_global, maximize_robustness_local, select_warm_start, RobustnessEnergy,
};
use chainsim::robustness::{
    find_successful_samples_adaptive, find_successful_samples_uniform, learn_active,
    learn_factorized, Label, LabelOracle, SampleSet,
};

const HALF_WIDTH: f64 = 0.2;
const CEILING: f64 = 0.95;

struct StripOracle;

impl LabelOracle for StripOracle {
    fn dims(&self) -> usize {
        2
    }

    fn is_physically_valid(&self, sample: &[f64]) -> ChainResult<bool> {
        Ok(sample[1] <= CEILING)
    }

    fn validity_constraint(&self, sample: &[f64]) -> ChainResult<f64> {
        Ok((CEILING - sample[1]).min(0.0))
    }

    fn label(&self, sample: &[f64]) -> ChainResult<Label> {
        Ok(self.label_with_events(sample)?.0)
    }

    fn label_with_events(&self, sample: &[f64]) -> ChainResult<(Label, EventLabels)> {
        let mut events = EventLabels::new();
        if !self.is_physically_valid(sample)? {
            events.insert("start".into(), None);
            events.insert("inside".into(), None);
            return Ok((Label::Invalid, events));
        }
        let inside = (sample[0] - 0.5).abs() < HALF_WIDTH;
        events.insert("start".into(), Some(true));
        events.insert("inside".into(), Some(inside));
        Ok((Label::from_success(inside), events))
    }
}

const PIPELINE: &str = r"
reproducibility:
  seed: 2024
workers:
  cores: 2
sampling:
  n_succ: 30
  n_0: 100
  n_k: 30
  k_max: 3
  trial_factor: 20
active_learning:
  accuracy: 0.95
  n_k: 10
  k_max: 3
  c_range: {start: 0.0, stop: 2.0, num: 3}
  gamma_range: {start: -1.0, stop: 1.0, num: 3}
optimizer:
  max_fevals: 200
  max_iter: 50
";

fn sample_set(config: &ChainConfig, rng: &mut SimRng, pool: &WorkerPool) -> SampleSet {
    find_successful_samples_adaptive(&StripOracle, &config.sampling_settings(), rng, pool).unwrap()
}

#[test]
fn adaptive_search_collects_valid_labeled_samples() {
    let config = ChainConfig::from_yaml(PIPELINE).unwrap();
    let mut rng = SimRng::new(config.reproducibility.seed);
    let set = sample_set(&config, &mut rng, &config.worker_pool());

    assert!(set.n_successes() >= 30);
    assert!(set.samples.iter().all(|s| s[1] <= CEILING));
    assert!(set.labels.iter().all(|l| *l != Label::Invalid));
    assert_eq!(set.event_labels["inside"].len(), set.len());
    assert_eq!(set.totals.last().copied(), Some(set.n_successes()));
}

#[test]
fn sampling_is_independent_of_worker_count() {
    let config = ChainConfig::from_yaml(PIPELINE).unwrap();
    let run = |workers: usize| {
        let mut rng = SimRng::new(config.reproducibility.seed);
        sample_set(&config, &mut rng, &WorkerPool::with_workers(workers))
    };
    assert_eq!(run(1), run(3));

    let mut rng = SimRng::new(7);
    let uniform = find_successful_samples_uniform(
        &StripOracle,
        &config.sampling_settings(),
        &mut rng,
        &WorkerPool::with_workers(1),
    )
    .unwrap();
    let mut rng = SimRng::new(7);
    let again = find_successful_samples_uniform(
        &StripOracle,
        &config.sampling_settings(),
        &mut rng,
        &WorkerPool::with_workers(4),
    )
    .unwrap();
    assert_eq!(uniform, again);
    assert!(uniform.event_labels.is_empty());
}

#[test]
fn active_learning_recovers_strip() {
    let config = ChainConfig::from_yaml(PIPELINE).unwrap();
    let pool = config.worker_pool();
    let mut rng = SimRng::new(config.reproducibility.seed);
    let set = sample_set(&config, &mut rng, &pool);

    let (estimator, trace) = learn_active(
        &StripOracle,
        &set.samples,
        &set.success_labels(),
        &config.active_learning_settings(),
        &mut rng,
        &pool,
    )
    .unwrap();

    assert!(estimator.has_probability());
    assert!(trace.samples.len() >= set.len());
    assert!(estimator.predict(&[0.5, 0.5]));
    assert!(!estimator.predict(&[0.02, 0.5]));
    assert!(!estimator.predict(&[0.98, 0.5]));
    let center = estimator.predict_proba(&[0.5, 0.5]).unwrap();
    assert!(center > estimator.predict_proba(&[0.02, 0.5]).unwrap());
}

#[test]
fn factorized_pipeline_optimizes_inside_strip() {
    let config = ChainConfig::from_yaml(PIPELINE).unwrap();
    let pool = config.worker_pool();
    let mut rng = SimRng::new(config.reproducibility.seed);
    let set = sample_set(&config, &mut rng, &pool);

    let learned = learn_factorized(
        &StripOracle,
        &set,
        &config.attribution_settings(),
        &config.active_learning_settings(),
        &mut rng,
        &pool,
    )
    .unwrap();
    // "start" always happens and carries no information
    assert!(!learned.contains_key("start"));
    let (inside, _) = &learned["inside"];
    assert!(inside.dims().contains(&0));

    let estimators: Vec<_> = learned.values().map(|(e, _)| e).collect();
    let successes: Vec<Vec<f64>> = set
        .samples
        .iter()
        .zip(&set.labels)
        .filter(|(_, l)| l.is_success())
        .map(|(s, _)| s.clone())
        .collect();
    let x0 = select_warm_start(&estimators, &successes).unwrap().unwrap();

    let settings = config.optimizer_settings();
    let energy = RobustnessEnergy::new(estimators.iter().copied(), settings.smin_coeff).unwrap();
    let start = energy.evaluate(&x0).unwrap();

    let local = maximize_robustness_local(&StripOracle, &estimators, &x0, &settings).unwrap();
    assert!(local.fun <= start + 1e-9);
    assert!(local.x.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(local.x[1] <= CEILING + 1e-6);

    let global =
        maximize_robustness_global(&StripOracle, &estimators, &x0, &settings, &mut rng, &pool)
            .unwrap();
    assert!(global.nfev <= settings.max_fevals + 16);
    assert!(StripOracle.is_physically_valid(&global.x).unwrap());
    assert_eq!(StripOracle.label(&global.x).unwrap(), Label::Success);
    assert!(global.fun < 0.0);
}
