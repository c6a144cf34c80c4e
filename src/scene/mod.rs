//! Scenario descriptions and instantiation.
//!
//! A [`Scenario`] is the read-only, preprocessed form of a scenario file:
//! scene objects, the validated causal graph and the design space. Placing
//! it at a point of the design space yields a [`ScenarioInstance`] ready to
//! simulate.

pub mod design_space;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use design_space::DesignSpace;

use crate::causal::{CausalGraphSpec, CausalGraphTraverser, EventSpec, DEFAULT_MAX_WAIT_TIME};
use crate::engine::{simulate, SimTime, StepCallback};
use crate::error::{ChainError, ChainResult};
use crate::physics::PhysicsWorld;

/// Object transform `(x, y, z, h, p, r)`; angles in degrees.
pub type Xform = [f64; 6];

/// Transform of every object, in scene order.
pub type Xforms = IndexMap<String, Xform>;

/// Transform entry of a scene object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XformSpec {
    /// Fixed transform (zeros if absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<f64>>,
    /// Per-component `[lo, hi]` range; `null` fixes a component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Vec<Option<[f64; 2]>>>,
}

/// Scene object of a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectSpec {
    /// Unique object name.
    pub name: String,
    /// Object type understood by the world factory.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Parent object in the scene hierarchy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Component objects of a composite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
    /// Transform and design range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xform: Option<XformSpec>,
}

/// Contents of a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDescription {
    /// Scene objects.
    pub scene: Vec<ObjectSpec>,
    /// Causal graph events (empty if absent).
    #[serde(default)]
    pub causal_graph: Vec<EventSpec>,
}

impl ScenarioDescription {
    /// Load from a `.json`, `.yaml` or `.yml` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Parse JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_json(json: &str) -> ChainResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_yaml(yaml: &str) -> ChainResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Builds a physics world from scene objects placed at given transforms.
///
/// Factories are shared by the labeling workers, hence `Sync`.
pub trait WorldFactory: Sync {
    /// World type produced.
    type World: PhysicsWorld;

    /// Build a world.
    ///
    /// # Errors
    ///
    /// Returns an error for object types or arguments the factory does not
    /// understand.
    fn build(&self, objects: &[ObjectSpec], xforms: &Xforms) -> ChainResult<Self::World>;
}

/// Preprocessed scenario.
#[derive(Debug, Clone)]
pub struct Scenario<F> {
    objects: Vec<ObjectSpec>,
    causal_graph: CausalGraphSpec,
    design_space: DesignSpace,
    factory: F,
    max_wait: SimTime,
    identity: [u8; 32],
}

impl<F: WorldFactory> Scenario<F> {
    /// Validate a description and bind it to a world factory.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate or dangling object references, a bad
    /// design space, or an invalid causal graph.
    pub fn new(description: ScenarioDescription, factory: F) -> ChainResult<Self> {
        let ScenarioDescription {
            scene: objects,
            causal_graph,
        } = description;
        check_objects(&objects)?;
        let causal_graph = CausalGraphSpec::from_specs(&causal_graph)?;
        let design_space = DesignSpace::from_objects(&objects)?;
        let identity = scenario_identity(&objects, &causal_graph, &design_space);
        debug!(
            objects = objects.len(),
            events = causal_graph.len(),
            dims = design_space.len(),
            "scenario loaded"
        );
        Ok(Self {
            objects,
            causal_graph,
            design_space,
            factory,
            max_wait: SimTime::from_secs(DEFAULT_MAX_WAIT_TIME),
            identity,
        })
    }

    /// Load a scenario file.
    ///
    /// # Errors
    ///
    /// See [`ScenarioDescription::load`] and [`Scenario::new`].
    pub fn load<P: AsRef<Path>>(path: P, factory: F) -> ChainResult<Self> {
        Self::new(ScenarioDescription::load(path)?, factory)
    }

    /// Set the causal graph's maximum wait time.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: SimTime) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Dimension of the design space.
    #[must_use]
    pub fn dims(&self) -> usize {
        self.design_space.len()
    }

    /// Design space.
    #[must_use]
    pub const fn design_space(&self) -> &DesignSpace {
        &self.design_space
    }

    /// Validated causal graph.
    #[must_use]
    pub const fn causal_graph(&self) -> &CausalGraphSpec {
        &self.causal_graph
    }

    /// Scene objects.
    #[must_use]
    pub fn objects(&self) -> &[ObjectSpec] {
        &self.objects
    }

    /// World factory.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Content hash of object names, causal edges and design ranges.
    #[must_use]
    pub const fn identity(&self) -> &[u8; 32] {
        &self.identity
    }

    /// Hex form of [`Scenario::identity`].
    #[must_use]
    pub fn identity_hex(&self) -> String {
        self.identity.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    /// Build the world for a sample without a causal graph.
    ///
    /// # Errors
    ///
    /// Returns an error on a dimension mismatch or a factory failure.
    pub fn build_world(&self, sample: &[f64]) -> ChainResult<F::World> {
        let xforms = self.design_space.sample_to_xforms(sample)?;
        self.factory.build(&self.objects, &xforms)
    }

    /// Instantiate at a point of the design space.
    ///
    /// # Errors
    ///
    /// See [`Scenario::instantiate_from_xforms`].
    pub fn instantiate_from_sample(
        &self,
        sample: &[f64],
    ) -> ChainResult<ScenarioInstance<F::World>> {
        let xforms = self.design_space.sample_to_xforms(sample)?;
        self.instantiate_from_xforms(&xforms)
    }

    /// Instantiate with explicit transforms.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory fails or the causal graph references
    /// a body missing from the world.
    pub fn instantiate_from_xforms(
        &self,
        xforms: &Xforms,
    ) -> ChainResult<ScenarioInstance<F::World>> {
        let world = self.factory.build(&self.objects, xforms)?;
        let traverser = self.causal_graph.embed(&world, self.max_wait)?;
        Ok(ScenarioInstance { world, traverser })
    }

    /// True if no pair of bodies interpenetrates beyond tolerance.
    ///
    /// # Errors
    ///
    /// See [`Scenario::build_world`].
    pub fn check_physically_valid_sample(&self, sample: &[f64]) -> ChainResult<bool> {
        Ok(self.build_world(sample)?.is_physically_valid())
    }

    /// Sum of penetration depths, `<= 0`.
    ///
    /// # Errors
    ///
    /// See [`Scenario::build_world`].
    pub fn physical_validity_constraint(&self, sample: &[f64]) -> ChainResult<f64> {
        Ok(self.build_world(sample)?.physical_validity_constraint())
    }
}

/// World plus its embedded causal graph.
#[derive(Debug)]
pub struct ScenarioInstance<W> {
    /// Physics world.
    pub world: W,
    /// Embedded causal graph, absent if the scenario has none.
    pub traverser: Option<CausalGraphTraverser>,
}

impl<W: PhysicsWorld> ScenarioInstance<W> {
    /// Simulate until the causal graph terminates or `duration` elapses.
    ///
    /// Returns the verdict as in [`ScenarioInstance::success`].
    ///
    /// # Errors
    ///
    /// Propagates world stepping errors.
    pub fn simulate(&mut self, duration: f64, timestep: f64) -> ChainResult<Option<bool>> {
        self.simulate_with(duration, timestep, Vec::new())
    }

    /// Like [`ScenarioInstance::simulate`], with extra callbacks polled after
    /// the causal graph.
    ///
    /// # Errors
    ///
    /// Propagates world stepping and callback errors.
    pub fn simulate_with(
        &mut self,
        duration: f64,
        timestep: f64,
        extra: Vec<&mut dyn StepCallback<W>>,
    ) -> ChainResult<Option<bool>> {
        let mut callbacks: Vec<&mut dyn StepCallback<W>> = Vec::with_capacity(extra.len() + 1);
        if let Some(traverser) = self.traverser.as_mut() {
            callbacks.push(traverser);
        }
        for callback in extra {
            callbacks.push(callback);
        }
        simulate(&mut self.world, duration, timestep, &mut callbacks)?;
        drop(callbacks);
        Ok(self.success())
    }

    /// `Some(true)` on success, `Some(false)` on failure or if the graph is
    /// still running, `None` without a causal graph.
    #[must_use]
    pub fn success(&self) -> Option<bool> {
        self.traverser.as_ref().map(CausalGraphTraverser::is_success)
    }
}

fn check_objects(objects: &[ObjectSpec]) -> ChainResult<()> {
    let mut names = HashSet::with_capacity(objects.len());
    for object in objects {
        if !names.insert(object.name.as_str()) {
            return Err(ChainError::scenario(format!(
                "duplicate object name '{}'",
                object.name
            )));
        }
    }
    for object in objects {
        let references = object
            .parent
            .iter()
            .chain(object.components.iter().flatten());
        for other in references {
            if !names.contains(other.as_str()) || *other == object.name {
                return Err(ChainError::scenario(format!(
                    "object '{}' references unknown object '{other}'",
                    object.name
                )));
            }
        }
    }
    Ok(())
}

fn scenario_identity(
    objects: &[ObjectSpec],
    causal_graph: &CausalGraphSpec,
    design_space: &DesignSpace,
) -> [u8; 32] {
    let mut names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();
    names.sort_unstable();
    let mut edges: Vec<[&str; 2]> = causal_graph
        .edges()
        .into_iter()
        .map(|(a, b)| if a <= b { [a, b] } else { [b, a] })
        .collect();
    edges.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&[0xff]);
    for [a, b] in edges {
        hasher.update(a.as_bytes());
        hasher.update(&[0]);
        hasher.update(b.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&[0xff]);
    hasher.update(&design_space.fingerprint());
    *hasher.finalize().as_bytes()
}
