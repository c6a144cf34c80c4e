//! Simulation stepping.
//!
//! Drives a [`PhysicsWorld`] with a fixed-timestep clock and polls a list of
//! step callbacks before every physics step. A callback returning
//! [`StepControl::Stop`] ends the run after the current poll; the causal
//! graph traverser uses this to stop as soon as a verdict is reached.

pub mod clock;
pub mod pool;
pub mod rng;

use serde::{Deserialize, Serialize};
use tracing::trace;

pub use clock::SimClock;
pub use pool::WorkerPool;
pub use rng::SimRng;

use crate::error::ChainResult;
use crate::physics::PhysicsWorld;

/// Simulation time representation.
///
/// Fixed-point nanoseconds so that event wake times and timeouts compare
/// exactly across replays.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SimTime {
    /// Time in nanoseconds from simulation start.
    nanos: u64,
}

impl SimTime {
    /// Zero time (simulation start).
    pub const ZERO: Self = Self { nanos: 0 };

    /// Create time from seconds, rounded to the nearest nanosecond.
    ///
    /// # Panics
    ///
    /// Panics if seconds is negative or not finite.
    #[must_use]
    pub fn from_secs(secs: f64) -> Self {
        assert!(secs >= 0.0, "SimTime cannot be negative");
        assert!(secs.is_finite(), "SimTime must be finite");
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = (secs * 1_000_000_000.0).round() as u64;
        Self { nanos }
    }

    /// Create time from nanoseconds.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Get time as seconds (f64).
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }

    /// Get time as nanoseconds.
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Add a duration in nanoseconds.
    #[must_use]
    pub const fn add_nanos(self, nanos: u64) -> Self {
        Self {
            nanos: self.nanos + nanos,
        }
    }
}

impl std::ops::Add for SimTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            nanos: self.nanos + rhs.nanos,
        }
    }
}

impl std::ops::Sub for SimTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            nanos: self.nanos.saturating_sub(rhs.nanos),
        }
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

/// Decision returned by a step callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    /// Keep stepping.
    Continue,
    /// Stop once every callback of this step has been polled.
    Stop,
}

impl StepControl {
    /// `Continue` when `keep_going` is true.
    #[must_use]
    pub const fn from_continue(keep_going: bool) -> Self {
        if keep_going {
            Self::Continue
        } else {
            Self::Stop
        }
    }
}

/// Callback polled once before every physics step.
pub trait StepCallback<W: PhysicsWorld> {
    /// Observe the world at `time`.
    ///
    /// # Errors
    ///
    /// Errors abort the simulation and propagate to the caller.
    fn on_step(&mut self, time: SimTime, world: &W) -> ChainResult<StepControl>;
}

/// Run the world for at most `duration`, polling `callbacks` before each step.
///
/// Every callback is polled at each step even if an earlier one asked to
/// stop. Returns the simulated time at exit.
///
/// # Errors
///
/// Returns an error if the timestep is invalid, a callback fails, or the
/// world fails to step.
pub fn simulate<W: PhysicsWorld>(
    world: &mut W,
    duration: f64,
    timestep: f64,
    callbacks: &mut [&mut dyn StepCallback<W>],
) -> ChainResult<SimTime> {
    let mut clock = SimClock::new(timestep)?;
    let end = SimTime::from_secs(duration.max(0.0));
    let dt = clock.dt();

    while clock.current_time() <= end {
        let now = clock.current_time();
        let mut stop = false;
        for callback in callbacks.iter_mut() {
            if callback.on_step(now, world)? == StepControl::Stop {
                stop = true;
            }
        }
        if stop {
            trace!(time = %now, steps = clock.step_count(), "simulation stopped by callback");
            break;
        }
        world.step(dt)?;
        clock.tick();
    }

    Ok(clock.current_time())
}
