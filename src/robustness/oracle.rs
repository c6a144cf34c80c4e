//! Label oracle: one simulation per sample.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::cache::{CacheEntry, LabelCache};
use crate::causal::EventLabels;
use crate::error::ChainResult;
use crate::physics::PhysicsWorld;
use crate::scene::{Scenario, WorldFactory};

/// Outcome of labeling a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Sample is not physically valid; nothing was simulated.
    Invalid,
    /// Causal graph succeeded.
    Success,
    /// Causal graph failed or did not terminate in time.
    Failure,
}

impl Label {
    /// Numeric form: `0`, `1` or `-1`.
    #[must_use]
    pub const fn value(self) -> i8 {
        match self {
            Self::Invalid => 0,
            Self::Success => 1,
            Self::Failure => -1,
        }
    }

    /// Label of a simulated sample.
    #[must_use]
    pub const fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }

    /// True for [`Label::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// `None` for invalid samples, else whether the sample succeeded.
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Invalid => None,
            Self::Success => Some(true),
            Self::Failure => Some(false),
        }
    }
}

/// Simulation horizon and step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Maximum simulated time (s).
    pub duration: f64,
    /// Integration step (s).
    pub timestep: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            duration: 8.0,
            timestep: 1.0 / 500.0,
        }
    }
}

/// Maps samples to labels.
///
/// Implementations must be shareable between labeling workers.
pub trait LabelOracle: Sync {
    /// Dimension of the samples.
    fn dims(&self) -> usize;

    /// True if the configuration has no interpenetration.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be instantiated.
    fn is_physically_valid(&self, sample: &[f64]) -> ChainResult<bool>;

    /// Sum of penetration depths, `<= 0`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be instantiated.
    fn validity_constraint(&self, sample: &[f64]) -> ChainResult<f64>;

    /// Global label.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation or simulation fails.
    fn label(&self, sample: &[f64]) -> ChainResult<Label>;

    /// Global label plus per-event labels.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation or simulation fails.
    fn label_with_events(&self, sample: &[f64]) -> ChainResult<(Label, EventLabels)>;
}

/// Label a sample by simulating `scenario`.
///
/// Invalid samples return [`Label::Invalid`] without simulating.
///
/// # Errors
///
/// Returns an error if instantiation or simulation fails.
pub fn compute_label<F: WorldFactory>(
    scenario: &Scenario<F>,
    sample: &[f64],
    settings: &SimulationSettings,
) -> ChainResult<Label> {
    compute_event_labels(scenario, sample, settings).map(|(label, _)| label)
}

/// Like [`compute_label`], also returning per-event labels.
///
/// Events of an invalid sample are all unresolved.
///
/// # Errors
///
/// Returns an error if instantiation or simulation fails.
pub fn compute_event_labels<F: WorldFactory>(
    scenario: &Scenario<F>,
    sample: &[f64],
    settings: &SimulationSettings,
) -> ChainResult<(Label, EventLabels)> {
    let mut instance = scenario.instantiate_from_sample(sample)?;
    if !instance.world.is_physically_valid() {
        let events = scenario
            .causal_graph()
            .event_names()
            .into_iter()
            .map(|name| (name.to_string(), None))
            .collect();
        return Ok((Label::Invalid, events));
    }

    let success = instance.simulate(settings.duration, settings.timestep)?;
    let label = Label::from_success(success == Some(true));
    let events = instance
        .traverser
        .as_ref()
        .map(crate::causal::CausalGraphTraverser::event_labels)
        .unwrap_or_default();
    trace!(?label, "sample labeled");
    Ok((label, events))
}

/// [`LabelOracle`] backed by a scenario and the physics simulation.
#[derive(Debug)]
pub struct SimulationOracle<'a, F> {
    scenario: &'a Scenario<F>,
    settings: SimulationSettings,
    cache: Option<Arc<LabelCache>>,
}

impl<'a, F: WorldFactory> SimulationOracle<'a, F> {
    /// Create an oracle.
    #[must_use]
    pub const fn new(scenario: &'a Scenario<F>, settings: SimulationSettings) -> Self {
        Self {
            scenario,
            settings,
            cache: None,
        }
    }

    /// Memoize labels in `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<LabelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Scenario.
    #[must_use]
    pub const fn scenario(&self) -> &'a Scenario<F> {
        self.scenario
    }

    /// Simulation settings.
    #[must_use]
    pub const fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    fn cached<T>(
        &self,
        function: &str,
        sample: &[f64],
        compute: impl FnOnce() -> ChainResult<CacheEntry>,
        extract: impl FnOnce(CacheEntry) -> Option<T>,
    ) -> ChainResult<Option<T>> {
        let Some(cache) = &self.cache else {
            return Ok(extract(compute()?));
        };
        let key = LabelCache::key(self.scenario.identity(), function, sample, &self.settings);
        if let Some(entry) = cache.get(&key) {
            return Ok(extract(entry));
        }
        let entry = compute()?;
        cache.insert(key, entry.clone());
        Ok(extract(entry))
    }
}

impl<F: WorldFactory> LabelOracle for SimulationOracle<'_, F> {
    fn dims(&self) -> usize {
        self.scenario.dims()
    }

    fn is_physically_valid(&self, sample: &[f64]) -> ChainResult<bool> {
        self.scenario.check_physically_valid_sample(sample)
    }

    fn validity_constraint(&self, sample: &[f64]) -> ChainResult<f64> {
        Ok(self.scenario.physical_validity_constraint(sample)?.min(0.0))
    }

    fn label(&self, sample: &[f64]) -> ChainResult<Label> {
        let label = self.cached(
            "label",
            sample,
            || compute_label(self.scenario, sample, &self.settings).map(CacheEntry::Label),
            |entry| match entry {
                CacheEntry::Label(label) | CacheEntry::WithEvents(label, _) => Some(label),
            },
        )?;
        Ok(label.unwrap_or(Label::Invalid))
    }

    fn label_with_events(&self, sample: &[f64]) -> ChainResult<(Label, EventLabels)> {
        let result = self.cached(
            "label_with_events",
            sample,
            || {
                compute_event_labels(self.scenario, sample, &self.settings)
                    .map(|(label, events)| CacheEntry::WithEvents(label, events))
            },
            |entry| match entry {
                CacheEntry::WithEvents(label, events) => Some((label, events)),
                CacheEntry::Label(_) => None,
            },
        )?;
        match result {
            Some(result) => Ok(result),
            None => compute_event_labels(self.scenario, sample, &self.settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::SphereWorldFactory;
    use crate::scene::ScenarioDescription;

    fn bowling() -> Scenario<SphereWorldFactory> {
        let json = r#"{
            "scene": [
                {"name": "floor", "type": "Ground"},
                {"name": "ball", "type": "Ball", "args": {"radius": 0.1, "velocity": [1.0, 0.0, 0.0]},
                 "xform": {"value": [-0.1, 0, 0.1, 0, 0, 0], "range": [null, [-0.3, 0.3], null, null, null, null]}},
                {"name": "pin", "type": "Ball", "args": {"radius": 0.1},
                 "xform": {"value": [0.5, 0, 0.1, 0, 0, 0], "range": [[0.0, 1.0], null, null, null, null, null]}}
            ],
            "causal_graph": [
                {"name": "roll", "type": "RollingOn", "args": {"rolling": "ball", "support": "floor"}, "children": ["hit"]},
                {"name": "hit", "type": "Contact", "args": {"first": "ball", "second": "pin"}}
            ]
        }"#;
        Scenario::new(
            ScenarioDescription::from_json(json).unwrap(),
            SphereWorldFactory::new(),
        )
        .unwrap()
    }

    fn settings() -> SimulationSettings {
        SimulationSettings {
            duration: 3.0,
            timestep: 0.002,
        }
    }

    #[test]
    fn test_label_values() {
        assert_eq!(Label::Invalid.value(), 0);
        assert_eq!(Label::Success.value(), 1);
        assert_eq!(Label::Failure.value(), -1);
        assert_eq!(Label::Invalid.as_bool(), None);
        assert_eq!(Label::from_success(false), Label::Failure);
    }

    #[test]
    fn test_success_and_failure() {
        let scenario = bowling();
        // ball at y = 0, pin at x = 0.5
        assert_eq!(compute_label(&scenario, &[0.5, 0.5], &settings()).unwrap(), Label::Success);
        // ball at y = 0.3 rolls past
        assert_eq!(compute_label(&scenario, &[1.0, 0.5], &settings()).unwrap(), Label::Failure);
    }

    #[test]
    fn test_invalid_sample_skips_simulation() {
        let scenario = bowling();
        // pin at x = 0 overlaps the ball
        let (label, events) = compute_event_labels(&scenario, &[0.5, 0.0], &settings()).unwrap();
        assert_eq!(label, Label::Invalid);
        assert!(events.values().all(Option::is_none));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_event_labels_on_failure() {
        let scenario = bowling();
        let (label, events) = compute_event_labels(&scenario, &[1.0, 0.5], &settings()).unwrap();
        assert_eq!(label, Label::Failure);
        assert_eq!(events["roll"], Some(true));
        assert_eq!(events["hit"], Some(false));
    }

    #[test]
    fn test_oracle_uses_cache() {
        let scenario = bowling();
        let cache = Arc::new(LabelCache::new());
        let oracle = SimulationOracle::new(&scenario, settings()).with_cache(Arc::clone(&cache));
        assert_eq!(oracle.dims(), 2);
        let first = oracle.label_with_events(&[0.5, 0.5]).unwrap();
        let second = oracle.label_with_events(&[0.5, 0.5]).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(oracle.label(&[0.5, 0.5]).unwrap(), Label::Success);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_oracle_validity() {
        let scenario = bowling();
        let oracle = SimulationOracle::new(&scenario, settings());
        assert!(oracle.is_physically_valid(&[0.5, 0.5]).unwrap());
        assert!(!oracle.is_physically_valid(&[0.5, 0.0]).unwrap());
        assert!(oracle.validity_constraint(&[0.5, 0.0]).unwrap() < -0.05);
    }
}
