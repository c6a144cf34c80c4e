//! Simulation clock.
//!
//! Fixed-timestep clock driving the step loop in [`crate::engine::simulate`].
//! Time is kept in integer nanoseconds so that repeated ticks of a
//! non-representable timestep (e.g. 1/500 s) do not accumulate drift and
//! the causal graph sees identical timestamps on every replay.

use serde::{Deserialize, Serialize};

use crate::engine::SimTime;
use crate::error::{ChainError, ChainResult};

/// Simulation clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimClock {
    /// Current simulation time.
    current: SimTime,
    /// Timestep duration in nanoseconds.
    timestep_nanos: u64,
    /// Number of steps taken.
    step_count: u64,
}

impl SimClock {
    /// Create a new clock with the given timestep in seconds.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the timestep is not a positive,
    /// finite number of at least one nanosecond.
    pub fn new(timestep_secs: f64) -> ChainResult<Self> {
        if !timestep_secs.is_finite() || timestep_secs <= 0.0 {
            return Err(ChainError::config(format!(
                "timestep must be positive and finite, got {timestep_secs}"
            )));
        }
        let timestep = SimTime::from_secs(timestep_secs);
        if timestep == SimTime::ZERO {
            return Err(ChainError::config(format!(
                "timestep {timestep_secs} is below clock resolution"
            )));
        }

        Ok(Self::from_nanos(timestep.as_nanos()))
    }

    /// Create a new clock with timestep in nanoseconds.
    #[must_use]
    pub const fn from_nanos(timestep_nanos: u64) -> Self {
        Self {
            current: SimTime::ZERO,
            timestep_nanos,
            step_count: 0,
        }
    }

    /// Get current simulation time.
    #[must_use]
    pub const fn current_time(&self) -> SimTime {
        self.current
    }

    /// Timestep in seconds.
    #[must_use]
    pub fn dt(&self) -> f64 {
        self.timestep_nanos as f64 / 1_000_000_000.0
    }

    /// Timestep in nanoseconds.
    #[must_use]
    pub const fn timestep_nanos(&self) -> u64 {
        self.timestep_nanos
    }

    /// Number of steps taken.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Advance clock by one timestep and return the new time.
    #[allow(clippy::missing_const_for_fn)]
    pub fn tick(&mut self) -> SimTime {
        self.current = self.current.add_nanos(self.timestep_nanos);
        self.step_count += 1;
        self.current
    }

    /// Advance clock by `n` timesteps and return the new time.
    pub fn tick_n(&mut self, n: u64) -> SimTime {
        for _ in 0..n {
            self.tick();
        }
        self.current
    }

    /// Reset clock to time zero.
    #[allow(clippy::missing_const_for_fn)]
    pub fn reset(&mut self) {
        self.current = SimTime::ZERO;
        self.step_count = 0;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        // 1/500 s, the usual rigid-body step for chain-reaction scenes
        Self::from_nanos(2_000_000)
    }
}
