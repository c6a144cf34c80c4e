//! Causal graph traversal.

use std::collections::{BTreeSet, HashSet, VecDeque};

use tracing::debug;

use super::{CausalGraph, Event, EventId, EventLabels, EventState, Probe, Verdict};
use crate::engine::{SimTime, StepCallback, StepControl};
use crate::error::ChainResult;
use crate::physics::PhysicsWorld;

/// Steps a causal graph alongside the simulation.
///
/// The traverser is the single callback the oracle registers with the
/// simulation driver; it asks to stop once a verdict is reached.
#[derive(Debug)]
pub struct CausalGraphTraverser {
    graph: CausalGraph,
    root: EventId,
    state: Option<Verdict>,
    max_wait: SimTime,
}

impl CausalGraphTraverser {
    /// Wrap a graph, checking that it is a single-rooted DAG.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the graph is empty, has several roots, or
    /// contains a cycle.
    pub fn new(graph: CausalGraph) -> ChainResult<Self> {
        let root = graph.root()?;
        Ok(Self {
            graph,
            root,
            state: None,
            max_wait: SimTime::from_secs(super::DEFAULT_MAX_WAIT_TIME),
        })
    }

    /// Set how long an awake event may wait for its condition.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: SimTime) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Maximum wait time.
    #[must_use]
    pub const fn max_wait(&self) -> SimTime {
        self.max_wait
    }

    /// Underlying graph.
    #[must_use]
    pub const fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    /// Root event id.
    #[must_use]
    pub const fn root(&self) -> EventId {
        self.root
    }

    /// Verdict, if reached.
    #[must_use]
    pub const fn state(&self) -> Option<Verdict> {
        self.state
    }

    /// True once a verdict is reached.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.state.is_some()
    }

    /// True if the verdict is success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.state, Some(Verdict::Success))
    }

    /// Terminal states are sticky: a verdict is never overwritten.
    fn set_state(&mut self, verdict: Verdict) {
        if self.state.is_none() {
            self.state = Some(verdict);
        }
    }

    /// Advance the graph at `time`.
    ///
    /// Returns `true` while the simulation should keep running. Once a
    /// verdict is reached further calls are no-ops returning `false`.
    pub fn update(&mut self, time: SimTime, world: &dyn PhysicsWorld) -> bool {
        if self.is_terminated() {
            return false;
        }

        let probe = Probe { time, world };
        let mut failed = false;
        let mut awake = false;
        let mut frontier = BTreeSet::from([self.root]);

        while let Some(id) = frontier.pop_first() {
            match self.graph.update_event(id, &probe, self.max_wait) {
                EventState::Success => frontier.extend(self.graph.active_children(id)),
                EventState::Failure => failed = true,
                EventState::Awake => awake = true,
                EventState::Asleep => {}
            }
        }

        if !awake {
            let verdict = if failed {
                Verdict::Failure
            } else {
                Verdict::Success
            };
            debug!(time = %time, verdict = ?verdict, "causal graph terminated");
            self.set_state(verdict);
        }

        !self.is_terminated()
    }

    /// Put every event to sleep, deactivate transitions and clear the verdict.
    pub fn reset(&mut self) {
        self.state = None;
        self.graph.reset();
    }

    /// Event called `name`, if reachable from the root.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events().into_iter().find(|e| e.name() == name)
    }

    /// Events reachable from the root, breadth-first.
    #[must_use]
    pub fn events(&self) -> Vec<&Event> {
        let mut seen = HashSet::from([self.root]);
        let mut queue = VecDeque::from([self.root]);
        let mut out = Vec::with_capacity(self.graph.len());
        while let Some(id) = queue.pop_front() {
            if let Some(event) = self.graph.event(id) {
                out.push(event);
            }
            for child in self.graph.children(id) {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        out
    }

    /// Events that have happened.
    #[must_use]
    pub fn successful_events(&self) -> Vec<&Event> {
        self.events().into_iter().filter(|e| e.is_success()).collect()
    }

    /// Per-event labels in breadth-first order.
    #[must_use]
    pub fn event_labels(&self) -> EventLabels {
        self.events()
            .into_iter()
            .map(|e| (e.name().to_string(), e.state().label()))
            .collect()
    }
}

impl<W: PhysicsWorld> StepCallback<W> for CausalGraphTraverser {
    fn on_step(&mut self, time: SimTime, world: &W) -> ChainResult<StepControl> {
        Ok(StepControl::from_continue(self.update(time, world)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causal::Signal;
    use crate::engine::simulate;
    use crate::physics::SphereWorld;

    fn after(secs: f64) -> impl FnMut(&Probe<'_>) -> Signal {
        let t = SimTime::from_secs(secs);
        move |probe: &Probe<'_>| Signal::from(probe.time >= t)
    }

    fn never() -> impl FnMut(&Probe<'_>) -> Signal {
        |_: &Probe<'_>| Signal::Bool(false)
    }

    fn chain(c: impl FnMut(&Probe<'_>) -> Signal + 'static) -> CausalGraph {
        let mut g = CausalGraph::new();
        let a = g.add_event("A", after(1.0));
        let b = g.add_event("B", after(2.0));
        let c = g.add_event("C", c);
        g.connect(a, b).unwrap();
        g.connect(b, c).unwrap();
        g
    }

    fn tick(trav: &mut CausalGraphTraverser, world: &SphereWorld, secs: f64) -> bool {
        trav.update(SimTime::from_secs(secs), world)
    }

    #[test]
    fn test_chain_succeeds() {
        let world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(after(3.0)))
            .unwrap()
            .with_max_wait(SimTime::from_secs(10.0));

        let mut t = 0.0;
        let mut ticks = 0;
        while tick(&mut trav, &world, t) {
            t += 0.5;
            ticks += 1;
            assert!(ticks < 100, "traverser did not terminate");
        }
        assert_eq!(trav.state(), Some(Verdict::Success));
        // A at 1.0, B at 2.0, C at 3.0 (seventh update)
        assert_eq!(ticks, 6);
        assert!(trav.events().iter().all(|e| e.is_success()));
    }

    #[test]
    fn test_chain_fails_on_timeout() {
        let world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(never()))
            .unwrap()
            .with_max_wait(SimTime::from_secs(1.0));

        let mut t = 0.0;
        while tick(&mut trav, &world, t) {
            t += 0.5;
        }
        assert_eq!(trav.state(), Some(Verdict::Failure));
        let labels = trav.event_labels();
        assert_eq!(labels["A"], Some(true));
        assert_eq!(labels["B"], Some(true));
        assert_eq!(labels["C"], Some(false));
        // C woke at 2.0 and fails strictly after 3.0
        assert!((t - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(after(0.0))).unwrap();
        while tick(&mut trav, &world, 5.0) {}
        assert!(trav.is_success());
        assert!(!tick(&mut trav, &world, 6.0));
        trav.set_state(Verdict::Failure);
        assert!(trav.is_success());
    }

    #[test]
    fn test_cascade_within_one_update() {
        let world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(after(0.0))).unwrap();
        assert!(!tick(&mut trav, &world, 2.0));
        assert!(trav.is_success());
    }

    #[test]
    fn test_reset_and_replay_matches() {
        let world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(after(3.0)))
            .unwrap()
            .with_max_wait(SimTime::from_secs(10.0));

        let run = |trav: &mut CausalGraphTraverser| {
            let mut t = 0.0;
            while tick(trav, &world, t) {
                t += 0.5;
            }
            (trav.state(), trav.event_labels(), t)
        };
        let first = run(&mut trav);
        trav.reset();
        assert_eq!(trav.state(), None);
        assert!(trav.events().iter().all(|e| e.state() == EventState::Asleep));
        let second = run(&mut trav);
        assert_eq!(first, second);
    }

    #[test]
    fn test_branch_failure_fails_graph() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let root = g.add_event("root", after(0.0));
        let ok = g.add_event("ok", after(0.0));
        let ko = g.add_event("ko", never());
        g.connect(root, ok).unwrap();
        g.connect(root, ko).unwrap();
        let mut trav = CausalGraphTraverser::new(g)
            .unwrap()
            .with_max_wait(SimTime::from_secs(0.5));

        let mut t = 0.0;
        while tick(&mut trav, &world, t) {
            t += 0.25;
        }
        assert_eq!(trav.state(), Some(Verdict::Failure));
        assert_eq!(trav.successful_events().len(), 2);
    }

    #[test]
    fn test_event_lookup_and_order() {
        let trav = CausalGraphTraverser::new(chain(never())).unwrap();
        let names: Vec<&str> = trav.events().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(trav.event("B").is_some());
        assert!(trav.event("Z").is_none());
    }

    #[test]
    fn test_runs_as_step_callback() {
        let mut world = SphereWorld::new();
        let mut trav = CausalGraphTraverser::new(chain(after(0.3)))
            .unwrap()
            .with_max_wait(SimTime::from_secs(5.0));
        let elapsed = simulate(&mut world, 10.0, 0.1, &mut [&mut trav]).unwrap();
        assert!(trav.is_success());
        assert_eq!(elapsed, SimTime::from_secs(2.0));
    }
}
