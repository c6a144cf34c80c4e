//! Causal event graphs.
//!
//! A scenario's expected outcome is a DAG of events ("ball A touches B",
//! "B topples", ...). During simulation a [`CausalGraphTraverser`] walks the
//! graph once per step, waking events whose preconditions hold, testing their
//! conditions against the world, and reaching a terminal verdict as soon as
//! no event is left waiting.
//!
//! # Event lifecycle
//!
//! ```text
//! asleep --precondition--> awake --condition--> success
//!                            |
//!                            +--timeout--> failure
//! ```
//!
//! Success and failure are terminal for an event until [`CausalGraphTraverser::reset`].

pub mod events;
pub mod graph;
pub mod loader;
pub mod traverser;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use events::EventKind;
pub use graph::{CausalGraph, Event, EventId, Outcome, Precondition, Transition, TransitionId};
pub use loader::{CausalGraphSpec, EventSpec, PreconditionKind};
pub use traverser::CausalGraphTraverser;

use crate::engine::SimTime;
use crate::physics::PhysicsWorld;

/// Default time an awake event may wait for its condition (seconds).
pub const DEFAULT_MAX_WAIT_TIME: f64 = 2.0;

/// Per-event outcome: `Some(true)` success, `Some(false)` failure, `None`
/// unresolved when the simulation ended.
pub type EventLabels = IndexMap<String, Option<bool>>;

/// State of a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    /// Waiting for its precondition.
    Asleep,
    /// Precondition met; waiting for its condition.
    Awake,
    /// Condition observed.
    Success,
    /// Condition not observed within the wait time.
    Failure,
}

impl EventState {
    /// True for success and failure.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Label of the event: `None` unless terminal.
    #[must_use]
    pub const fn label(self) -> Option<bool> {
        match self {
            Self::Success => Some(true),
            Self::Failure => Some(false),
            Self::Asleep | Self::Awake => None,
        }
    }
}

/// Terminal state of a whole causal graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Every reachable event happened.
    Success,
    /// Some event timed out.
    Failure,
}

/// Value returned by an event condition.
///
/// Boolean conditions return [`Signal::Bool`]; categorical conditions return
/// the name of what they observed. An event fires when its signal is truthy,
/// and categorical outcomes compare the signal with per-transition tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    /// Plain condition value.
    Bool(bool),
    /// Observed category.
    Category(String),
}

impl Signal {
    /// `Bool(true)` or any category.
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Category(_) => true,
        }
    }
}

impl From<bool> for Signal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Category(c) => write!(f, "{c}"),
        }
    }
}

/// What a condition may observe at one step.
#[derive(Clone, Copy)]
pub struct Probe<'a> {
    /// Current simulation time.
    pub time: SimTime,
    /// The world being simulated.
    pub world: &'a dyn PhysicsWorld,
}

impl std::fmt::Debug for Probe<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("time", &self.time)
            .field("world", &"<dyn PhysicsWorld>")
            .finish()
    }
}

/// Predicate evaluated against the world while an event is awake.
pub trait Condition {
    /// Evaluate the condition.
    fn check(&mut self, probe: &Probe<'_>) -> Signal;
}

impl<F> Condition for F
where
    F: FnMut(&Probe<'_>) -> Signal,
{
    fn check(&mut self, probe: &Probe<'_>) -> Signal {
        self(probe)
    }
}
