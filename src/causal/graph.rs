//! Arena-backed event graph.
//!
//! Events and transitions live in two vectors and refer to each other by
//! index. A transition is shared by its source's outcome (which activates it)
//! and its destination's precondition (which reads it).

use tracing::debug;

use super::{Condition, EventState, Probe, Signal};
use crate::engine::SimTime;
use crate::error::{ChainError, ChainResult};

/// Index of an event in its graph.
pub type EventId = usize;

/// Index of a transition in its graph.
pub type TransitionId = usize;

/// Edge between two events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Source event.
    pub source: EventId,
    /// Destination event.
    pub dest: EventId,
    /// Set when the source's outcome fires.
    pub active: bool,
}

/// When an asleep event wakes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Every incoming transition is active (vacuously true without any).
    AllBefore(Vec<TransitionId>),
    /// At least one incoming transition is active.
    AnyBefore(Vec<TransitionId>),
}

impl Precondition {
    /// Incoming transitions.
    #[must_use]
    pub fn transitions(&self) -> &[TransitionId] {
        match self {
            Self::AllBefore(t) | Self::AnyBefore(t) => t,
        }
    }

    fn push(&mut self, transition: TransitionId) {
        match self {
            Self::AllBefore(t) | Self::AnyBefore(t) => t.push(transition),
        }
    }

    fn holds(&self, transitions: &[Transition]) -> bool {
        match self {
            Self::AllBefore(ids) => ids.iter().all(|&t| transitions[t].active),
            Self::AnyBefore(ids) => ids.iter().any(|&t| transitions[t].active),
        }
    }
}

/// Which outgoing transitions fire on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// All of them.
    AllAfter(Vec<TransitionId>),
    /// Those whose tag equals the condition's signal.
    CategoricalAfter(Vec<(TransitionId, Signal)>),
}

impl Outcome {
    /// Outgoing transitions.
    #[must_use]
    pub fn transitions(&self) -> Vec<TransitionId> {
        match self {
            Self::AllAfter(t) => t.clone(),
            Self::CategoricalAfter(t) => t.iter().map(|(id, _)| *id).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::AllAfter(t) => t.is_empty(),
            Self::CategoricalAfter(t) => t.is_empty(),
        }
    }

    fn fire(&self, signal: &Signal, transitions: &mut [Transition]) {
        match self {
            Self::AllAfter(ids) => {
                for &t in ids {
                    transitions[t].active = true;
                }
            }
            Self::CategoricalAfter(tagged) => {
                for (t, tag) in tagged {
                    if tag == signal {
                        transitions[*t].active = true;
                        debug!(transition = t, category = %signal, "activating transition");
                    }
                }
            }
        }
    }
}

/// Node of the causal graph.
pub struct Event {
    name: String,
    condition: Box<dyn Condition>,
    precondition: Precondition,
    outcome: Outcome,
    state: EventState,
    wake_time: SimTime,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("condition", &"<dyn Condition>")
            .field("precondition", &self.precondition)
            .field("outcome", &self.outcome)
            .field("state", &self.state)
            .field("wake_time", &self.wake_time)
            .finish()
    }
}

impl Event {
    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> EventState {
        self.state
    }

    /// Time at which the event woke up (zero while asleep).
    #[must_use]
    pub const fn wake_time(&self) -> SimTime {
        self.wake_time
    }

    /// Precondition.
    #[must_use]
    pub const fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    /// Outcome.
    #[must_use]
    pub const fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// True if the event has happened.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == EventState::Success
    }

    /// True if the event timed out.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.state == EventState::Failure
    }

    fn reset(&mut self) {
        self.state = EventState::Asleep;
        self.wake_time = SimTime::ZERO;
    }
}

/// Events and transitions of a causal graph.
#[derive(Debug, Default)]
pub struct CausalGraph {
    events: Vec<Event>,
    transitions: Vec<Transition>,
}

impl CausalGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event with an `AllBefore` precondition and `AllAfter` outcome.
    pub fn add_event(
        &mut self,
        name: impl Into<String>,
        condition: impl Condition + 'static,
    ) -> EventId {
        self.add_boxed_event(name, Box::new(condition))
    }

    /// Add an event from a boxed condition.
    pub fn add_boxed_event(
        &mut self,
        name: impl Into<String>,
        condition: Box<dyn Condition>,
    ) -> EventId {
        self.events.push(Event {
            name: name.into(),
            condition,
            precondition: Precondition::AllBefore(Vec::new()),
            outcome: Outcome::AllAfter(Vec::new()),
            state: EventState::Asleep,
            wake_time: SimTime::ZERO,
        });
        self.events.len() - 1
    }

    /// Switch an event to an `AnyBefore` precondition, keeping its transitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the event does not exist.
    pub fn set_any_before(&mut self, event: EventId) -> ChainResult<()> {
        let ev = self.event_mut(event)?;
        let incoming = ev.precondition.transitions().to_vec();
        ev.precondition = Precondition::AnyBefore(incoming);
        Ok(())
    }

    /// Connect `source → dest`, activated whenever `source` succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if an event does not exist or `source` has a
    /// categorical outcome.
    pub fn connect(&mut self, source: EventId, dest: EventId) -> ChainResult<TransitionId> {
        self.event_mut(dest)?;
        let id = self.transitions.len();
        match &mut self.event_mut(source)?.outcome {
            Outcome::AllAfter(t) => t.push(id),
            Outcome::CategoricalAfter(_) => {
                return Err(ChainError::graph(format!(
                    "event {source} has a categorical outcome; use a category tag"
                )))
            }
        }
        self.link(id, source, dest);
        Ok(id)
    }

    /// Connect `source → dest`, activated when `source`'s signal equals `category`.
    ///
    /// # Errors
    ///
    /// Returns an error if an event does not exist or `source` already has
    /// untagged outgoing transitions.
    pub fn connect_categorical(
        &mut self,
        source: EventId,
        dest: EventId,
        category: Signal,
    ) -> ChainResult<TransitionId> {
        self.event_mut(dest)?;
        let id = self.transitions.len();
        let ev = self.event_mut(source)?;
        if let Outcome::AllAfter(t) = &ev.outcome {
            if !t.is_empty() {
                return Err(ChainError::graph(format!(
                    "event '{}' mixes tagged and untagged transitions",
                    ev.name
                )));
            }
            ev.outcome = Outcome::CategoricalAfter(Vec::new());
        }
        if let Outcome::CategoricalAfter(t) = &mut ev.outcome {
            t.push((id, category));
        }
        self.link(id, source, dest);
        Ok(id)
    }

    fn link(&mut self, id: TransitionId, source: EventId, dest: EventId) {
        self.transitions.push(Transition {
            source,
            dest,
            active: false,
        });
        self.events[dest].precondition.push(id);
    }

    fn event_mut(&mut self, id: EventId) -> ChainResult<&mut Event> {
        self.events
            .get_mut(id)
            .ok_or_else(|| ChainError::graph(format!("no event with id {id}")))
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if the graph has no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Event by id.
    #[must_use]
    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(id)
    }

    /// Id of the event called `name`.
    #[must_use]
    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.events.iter().position(|e| e.name == name)
    }

    /// Transition by id.
    #[must_use]
    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Destinations of `event`'s outgoing transitions, active or not.
    #[must_use]
    pub fn children(&self, event: EventId) -> Vec<EventId> {
        self.events.get(event).map_or_else(Vec::new, |e| {
            e.outcome
                .transitions()
                .into_iter()
                .map(|t| self.transitions[t].dest)
                .collect()
        })
    }

    /// Destinations of `event`'s active outgoing transitions.
    #[must_use]
    pub fn active_children(&self, event: EventId) -> Vec<EventId> {
        self.events.get(event).map_or_else(Vec::new, |e| {
            e.outcome
                .transitions()
                .into_iter()
                .filter(|&t| self.transitions[t].active)
                .map(|t| self.transitions[t].dest)
                .collect()
        })
    }

    /// Unique event without incoming transitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is empty, has several roots, or
    /// contains a cycle.
    pub fn root(&self) -> ChainResult<EventId> {
        let edges: Vec<(usize, usize)> =
            self.transitions.iter().map(|t| (t.source, t.dest)).collect();
        find_root(self.events.len(), &edges, |i| self.events[i].name.as_str())
    }

    /// Advance one event at `time`, returning its new state.
    ///
    /// Categorical outcomes fire with the signal that made the event succeed.
    pub(crate) fn update_event(
        &mut self,
        id: EventId,
        probe: &Probe<'_>,
        max_wait: SimTime,
    ) -> EventState {
        let Some(event) = self.events.get_mut(id) else {
            return EventState::Asleep;
        };
        let time = probe.time;

        if event.state == EventState::Asleep && event.precondition.holds(&self.transitions) {
            event.state = EventState::Awake;
            event.wake_time = time;
            debug!(event = %event.name, time = %time, "event is waiting to happen");
        }

        if event.state == EventState::Awake {
            let signal = event.condition.check(probe);
            if signal.is_truthy() {
                event.state = EventState::Success;
                debug!(event = %event.name, time = %time, "event has happened");
                if !event.outcome.is_empty() {
                    event.outcome.fire(&signal, &mut self.transitions);
                }
            } else if time - event.wake_time > max_wait {
                event.state = EventState::Failure;
                debug!(event = %event.name, time = %time, "event has not happened");
            }
        }

        event.state
    }

    /// Put every event to sleep and deactivate every transition.
    pub fn reset(&mut self) {
        for event in &mut self.events {
            event.reset();
        }
        for transition in &mut self.transitions {
            transition.active = false;
        }
    }
}

/// Find the unique in-degree-0 node of a DAG given as an edge list.
///
/// # Errors
///
/// Returns a graph error for an empty graph, several or no roots, or a cycle.
pub(crate) fn find_root<'a>(
    n: usize,
    edges: &[(usize, usize)],
    name: impl Fn(usize) -> &'a str,
) -> ChainResult<usize> {
    if n == 0 {
        return Err(ChainError::graph("graph has no events"));
    }

    let mut in_degree = vec![0usize; n];
    let mut out: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(s, d) in edges {
        in_degree[d] += 1;
        out[s].push(d);
    }

    let roots: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let root = match roots.as_slice() {
        [root] => *root,
        [] => return Err(ChainError::graph("no root event (every event has a parent)")),
        many => {
            let names: Vec<&str> = many.iter().map(|&i| name(i)).collect();
            return Err(ChainError::graph(format!(
                "expected exactly one root event, found {}: {}",
                many.len(),
                names.join(", ")
            )));
        }
    };

    // Kahn's algorithm: every node must be removable
    let mut queue = vec![root];
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &child in &out[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push(child);
            }
        }
    }
    if visited != n {
        let stuck = (0..n).find(|&i| in_degree[i] > 0).map_or("?", &name);
        return Err(ChainError::graph(format!("cycle through '{stuck}'")));
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::SphereWorld;

    fn always(value: bool) -> impl Condition {
        move |_: &Probe<'_>| Signal::from(value)
    }

    fn probe_at(world: &SphereWorld, secs: f64) -> Probe<'_> {
        Probe {
            time: SimTime::from_secs(secs),
            world,
        }
    }

    #[test]
    fn test_root_of_chain() {
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        let b = g.add_event("b", always(true));
        let c = g.add_event("c", always(true));
        g.connect(a, b).unwrap();
        g.connect(b, c).unwrap();
        assert_eq!(g.root().unwrap(), a);
        assert_eq!(g.children(a), vec![b]);
    }

    #[test]
    fn test_root_rejects_two_roots() {
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        let b = g.add_event("b", always(true));
        let c = g.add_event("c", always(true));
        g.connect(a, c).unwrap();
        g.connect(b, c).unwrap();
        let err = g.root().unwrap_err();
        assert!(err.to_string().contains("exactly one root"));
    }

    #[test]
    fn test_root_rejects_cycle() {
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        let b = g.add_event("b", always(true));
        let c = g.add_event("c", always(true));
        g.connect(a, b).unwrap();
        g.connect(b, c).unwrap();
        g.connect(c, b).unwrap();
        assert!(g.root().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_root_rejects_empty() {
        assert!(CausalGraph::new().root().is_err());
    }

    #[test]
    fn test_all_before_empty_is_vacuously_true() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(false));
        let state = g.update_event(a, &probe_at(&world, 0.0), SimTime::from_secs(1.0));
        assert_eq!(state, EventState::Awake);
    }

    #[test]
    fn test_any_before_without_transitions_never_wakes() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        g.set_any_before(a).unwrap();
        let state = g.update_event(a, &probe_at(&world, 0.0), SimTime::from_secs(1.0));
        assert_eq!(state, EventState::Asleep);
    }

    #[test]
    fn test_any_before_wakes_on_one_parent() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let root = g.add_event("root", always(true));
        let left = g.add_event("left", always(true));
        let right = g.add_event("right", always(false));
        let join = g.add_event("join", always(false));
        g.connect(root, left).unwrap();
        g.connect(root, right).unwrap();
        g.connect(left, join).unwrap();
        g.connect(right, join).unwrap();
        g.set_any_before(join).unwrap();

        let wait = SimTime::from_secs(1.0);
        let probe = probe_at(&world, 0.0);
        g.update_event(root, &probe, wait);
        g.update_event(left, &probe, wait);
        assert_eq!(g.update_event(join, &probe, wait), EventState::Awake);
    }

    #[test]
    fn test_timeout_is_strict() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(false));
        let wait = SimTime::from_secs(1.0);
        g.update_event(a, &probe_at(&world, 0.0), wait);
        assert_eq!(g.update_event(a, &probe_at(&world, 1.0), wait), EventState::Awake);
        assert_eq!(g.update_event(a, &probe_at(&world, 1.5), wait), EventState::Failure);
    }

    #[test]
    fn test_categorical_outcome_activates_matching_tag() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let pick = g.add_event("pick", |_: &Probe<'_>| Signal::Category("right".into()));
        let left = g.add_event("left", always(true));
        let right = g.add_event("right", always(true));
        let tl = g.connect_categorical(pick, left, Signal::Category("left".into())).unwrap();
        let tr = g.connect_categorical(pick, right, Signal::Category("right".into())).unwrap();

        g.update_event(pick, &probe_at(&world, 0.0), SimTime::from_secs(1.0));
        assert!(!g.transition(tl).unwrap().active);
        assert!(g.transition(tr).unwrap().active);
        assert_eq!(g.active_children(pick), vec![right]);
    }

    #[test]
    fn test_mixing_tagged_and_untagged_is_rejected() {
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        let b = g.add_event("b", always(true));
        let c = g.add_event("c", always(true));
        g.connect(a, b).unwrap();
        assert!(g.connect_categorical(a, c, Signal::Bool(true)).is_err());

        let d = g.add_event("d", always(true));
        g.connect_categorical(b, d, Signal::Bool(true)).unwrap();
        assert!(g.connect(b, c).is_err());
    }

    #[test]
    fn test_reset_clears_state() {
        let world = SphereWorld::new();
        let mut g = CausalGraph::new();
        let a = g.add_event("a", always(true));
        let b = g.add_event("b", always(false));
        let t = g.connect(a, b).unwrap();
        g.update_event(a, &probe_at(&world, 0.5), SimTime::from_secs(1.0));
        assert!(g.transition(t).unwrap().active);

        g.reset();
        let ev = g.event(a).unwrap();
        assert_eq!(ev.state(), EventState::Asleep);
        assert_eq!(ev.wake_time(), SimTime::ZERO);
        assert!(!g.transition(t).unwrap().active);
    }
}
