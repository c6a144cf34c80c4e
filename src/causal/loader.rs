//! Loading causal graphs from scenario descriptions.
//!
//! Loading is split in two: [`CausalGraphSpec::from_specs`] resolves event
//! kinds and checks the graph structure once per scenario, and
//! [`CausalGraphSpec::embed`] binds the validated spec to a freshly built
//! world for each simulation.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::graph::find_root;
use super::{CausalGraph, CausalGraphTraverser, EventKind, Signal};
use crate::engine::SimTime;
use crate::error::{ChainError, ChainResult};
use crate::physics::PhysicsWorld;

/// Precondition selector in scenario files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreconditionKind {
    /// Wake when every parent has fired.
    #[default]
    AllBefore,
    /// Wake when any parent has fired.
    AnyBefore,
}

/// Raw event entry of a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSpec {
    /// Unique event name.
    pub name: String,
    /// Registered kind name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Names of child events.
    #[serde(default)]
    pub children: Vec<String>,
    /// Category tag per child, for categorical events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<Signal>>,
    /// Wake-up rule.
    #[serde(default)]
    pub precondition: PreconditionKind,
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedEvent {
    name: String,
    kind: EventKind,
    children: Vec<usize>,
    categories: Option<Vec<Signal>>,
    precondition: PreconditionKind,
}

/// Validated, world-independent causal graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CausalGraphSpec {
    events: Vec<ResolvedEvent>,
    root: Option<usize>,
}

impl CausalGraphSpec {
    /// Resolve and validate a list of raw events.
    ///
    /// An empty list yields an empty spec (a scenario without a causal graph).
    ///
    /// # Errors
    ///
    /// Returns an error for unknown kinds, bad arguments, duplicate names,
    /// unknown children, category lists that do not match the children, or
    /// a graph that is not a single-rooted DAG.
    pub fn from_specs(specs: &[EventSpec]) -> ChainResult<Self> {
        if specs.is_empty() {
            return Ok(Self::default());
        }

        let mut index: IndexMap<&str, usize> = IndexMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.as_str(), i).is_some() {
                return Err(ChainError::graph(format!("duplicate event name '{}'", spec.name)));
            }
        }

        let mut events = Vec::with_capacity(specs.len());
        for spec in specs {
            let kind = EventKind::from_name(&spec.name, &spec.kind, &spec.args)?;
            let mut children = Vec::with_capacity(spec.children.len());
            let mut seen = HashSet::new();
            for child in &spec.children {
                let id = *index.get(child.as_str()).ok_or_else(|| {
                    ChainError::graph(format!("event '{}' has unknown child '{child}'", spec.name))
                })?;
                if !seen.insert(id) {
                    return Err(ChainError::graph(format!(
                        "event '{}' lists child '{child}' twice",
                        spec.name
                    )));
                }
                children.push(id);
            }
            if let Some(categories) = &spec.categories {
                if categories.len() != children.len() {
                    return Err(ChainError::graph(format!(
                        "event '{}' has {} categories for {} children",
                        spec.name,
                        categories.len(),
                        children.len()
                    )));
                }
            }
            events.push(ResolvedEvent {
                name: spec.name.clone(),
                kind,
                children,
                categories: spec.categories.clone(),
                precondition: spec.precondition,
            });
        }

        let edges: Vec<(usize, usize)> = events
            .iter()
            .enumerate()
            .flat_map(|(i, e)| e.children.iter().map(move |&c| (i, c)))
            .collect();
        let root = find_root(events.len(), &edges, |i| events[i].name.as_str())?;

        Ok(Self {
            events,
            root: Some(root),
        })
    }

    /// True if the scenario has no causal graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Root event name.
    #[must_use]
    pub fn root_name(&self) -> Option<&str> {
        self.root.map(|r| self.events[r].name.as_str())
    }

    /// Event names in declaration order.
    #[must_use]
    pub fn event_names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.name.as_str()).collect()
    }

    /// Kind of the event called `name`.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<&EventKind> {
        self.events.iter().find(|e| e.name == name).map(|e| &e.kind)
    }

    /// `(parent, child)` name pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.events
            .iter()
            .flat_map(|e| {
                e.children
                    .iter()
                    .map(move |&c| (e.name.as_str(), self.events[c].name.as_str()))
            })
            .collect()
    }

    /// Body names referenced by any event, deduplicated.
    #[must_use]
    pub fn body_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.events
            .iter()
            .flat_map(|e| e.kind.body_names())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Bind the graph to `world`.
    ///
    /// Returns `None` for an empty spec.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnknownBody`] if an event references a body
    /// absent from the world.
    pub fn embed(
        &self,
        world: &dyn PhysicsWorld,
        max_wait: SimTime,
    ) -> ChainResult<Option<CausalGraphTraverser>> {
        if self.events.is_empty() {
            return Ok(None);
        }

        let mut graph = CausalGraph::new();
        for event in &self.events {
            graph.add_boxed_event(event.name.clone(), event.kind.embed(&event.name, world)?);
        }
        for (source, event) in self.events.iter().enumerate() {
            match &event.categories {
                Some(categories) => {
                    for (&dest, tag) in event.children.iter().zip(categories) {
                        graph.connect_categorical(source, dest, tag.clone())?;
                    }
                }
                None => {
                    for &dest in &event.children {
                        graph.connect(source, dest)?;
                    }
                }
            }
        }
        for (id, event) in self.events.iter().enumerate() {
            if event.precondition == PreconditionKind::AnyBefore {
                graph.set_any_before(id)?;
            }
        }

        Ok(Some(CausalGraphTraverser::new(graph)?.with_max_wait(max_wait)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::Verdict;
    use crate::engine::simulate;
    use crate::physics::{SphereWorld, Vec3};
    use serde_json::json;

    fn specs(value: serde_json::Value) -> Vec<EventSpec> {
        serde_json::from_value(value).unwrap()
    }

    fn rolling_scene() -> SphereWorld {
        let mut world = SphereWorld::new();
        world.add_ground("floor", 0.0);
        let a = world.add_ball("a", 0.1, Vec3::new(0.0, 0.0, 0.1), Some(1.0));
        world.add_ball("b", 0.1, Vec3::new(0.5, 0.0, 0.1), Some(1.0));
        world.set_linear_velocity(a, Vec3::new(1.0, 0.0, 0.0));
        world
    }

    #[test]
    fn test_load_chain() {
        let spec = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "start", "type": "Dummy", "args": {}, "children": ["hit"]},
            {"name": "hit", "type": "Contact", "args": {"first": "a", "second": "b"}, "children": ["rest"]},
            {"name": "rest", "type": "Stopping", "args": {"body": "a"}}
        ])))
        .unwrap();
        assert_eq!(spec.len(), 3);
        assert_eq!(spec.root_name(), Some("start"));
        assert_eq!(spec.edges(), vec![("start", "hit"), ("hit", "rest")]);
        assert_eq!(spec.body_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_graph() {
        let spec = CausalGraphSpec::from_specs(&[]).unwrap();
        assert!(spec.is_empty());
        let world = SphereWorld::new();
        assert!(spec.embed(&world, SimTime::from_secs(2.0)).unwrap().is_none());
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Dummy"},
            {"name": "a", "type": "Dummy"}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_unknown_child() {
        let err = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Dummy", "children": ["ghost"]}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Teleporting"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ChainError::UnknownEventKind { .. }));
    }

    #[test]
    fn test_rejects_multiple_roots_and_cycles() {
        assert!(CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Dummy"},
            {"name": "b", "type": "Dummy"}
        ])))
        .is_err());
        assert!(CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Dummy", "children": ["b"]},
            {"name": "b", "type": "Dummy", "children": ["c"]},
            {"name": "c", "type": "Dummy", "children": ["b"]}
        ])))
        .is_err());
    }

    #[test]
    fn test_rejects_category_mismatch() {
        let err = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "a", "type": "Dummy", "children": ["b"], "categories": ["x", "y"]},
            {"name": "b", "type": "Dummy"}
        ])))
        .unwrap_err();
        assert!(err.to_string().contains("categories"));
    }

    #[test]
    fn test_embed_unknown_body() {
        let spec = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "hit", "type": "Contact", "args": {"first": "a", "second": "zz"}}
        ])))
        .unwrap();
        let world = rolling_scene();
        let err = spec.embed(&world, SimTime::from_secs(2.0)).unwrap_err();
        assert!(matches!(err, ChainError::UnknownBody { .. }));
    }

    #[test]
    fn test_embedded_graph_runs_to_success() {
        let spec = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "roll", "type": "RollingOn", "args": {"rolling": "a", "support": "floor"}, "children": ["hit"]},
            {"name": "hit", "type": "Contact", "args": {"first": "a", "second": "b"}}
        ])))
        .unwrap();
        let mut world = rolling_scene();
        let mut trav = spec.embed(&world, SimTime::from_secs(2.0)).unwrap().unwrap();
        simulate(&mut world, 3.0, 0.002, &mut [&mut trav]).unwrap();
        assert_eq!(trav.state(), Some(Verdict::Success));
    }

    #[test]
    fn test_categorical_branch() {
        let spec = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "first", "type": "FirstContact", "args": {"body": "a", "candidates": ["b", "floor"]},
             "children": ["went_b", "went_floor"], "categories": ["b", "floor"]},
            {"name": "went_b", "type": "Dummy"},
            {"name": "went_floor", "type": "Dummy"}
        ])))
        .unwrap();
        let mut world = SphereWorld::new().with_gravity(Vec3::zero());
        let a = world.add_ball("a", 0.1, Vec3::new(0.0, 0.0, 1.0), Some(1.0));
        world.add_ball("b", 0.1, Vec3::new(0.5, 0.0, 1.0), Some(1.0));
        world.add_ground("floor", 0.0);
        world.set_linear_velocity(a, Vec3::new(1.0, 0.0, 0.0));

        let mut trav = spec.embed(&world, SimTime::from_secs(1.0)).unwrap().unwrap();
        simulate(&mut world, 5.0, 0.002, &mut [&mut trav]).unwrap();
        let labels = trav.event_labels();
        assert_eq!(labels["first"], Some(true));
        assert_eq!(labels["went_b"], Some(true));
        assert_eq!(labels["went_floor"], None);
        assert!(trav.is_success());
    }

    #[test]
    fn test_any_before_from_file() {
        let spec = CausalGraphSpec::from_specs(&specs(json!([
            {"name": "root", "type": "Dummy", "children": ["x", "y"]},
            {"name": "x", "type": "Dummy", "children": ["join"]},
            {"name": "y", "type": "Dummy", "children": ["join"]},
            {"name": "join", "type": "Dummy", "precondition": "AnyBefore"}
        ])))
        .unwrap();
        let world = SphereWorld::new();
        let trav = spec.embed(&world, SimTime::from_secs(1.0)).unwrap().unwrap();
        let join = trav.graph().event_id("join").unwrap();
        assert!(matches!(
            trav.graph().event(join).unwrap().precondition(),
            crate::causal::Precondition::AnyBefore(t) if t.len() == 2
        ));
    }
}
