//! # chainsim
//!
//! Causal chain simulation and robustness analysis for physical scenes.
//!
//! A scenario is a set of scene objects with a design space over their
//! transforms and a causal graph of expected events. The crate provides:
//! - A causal event graph state machine that labels each run
//! - Adaptive search for successful samples of the design space
//! - Active learning of SVM success boundaries, per run or per event
//! - Attribution of events to the design dimensions that drive them
//! - Robustness maximization by SQP (local) or CMA-ES (global)
//!
//! ## Example
//!
//! ```rust
//! use chainsim::prelude::*;
//!
//! let config = ChainConfig::builder()
//!     .seed(42)
//!     .cores(2)
//!     .build();
//! let mut rng = SimRng::new(config.reproducibility.seed);
//! let pool = config.worker_pool();
//! assert_eq!(pool.num_workers(), 2);
//! let _ = rng.gen_f64();
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::suspicious_operation_groupings,  // False positive for variance = E[X²] - E[X]²
    clippy::suboptimal_flops,
    clippy::imprecise_flops,   // Numerical code choices are intentional
    clippy::no_effect_underscore_binding,
    clippy::too_many_lines,
    clippy::missing_const_for_fn,  // Many functions can't be const in stable Rust
    clippy::needless_range_loop,   // Sometimes range loops are clearer
    clippy::manual_midpoint,
)]

pub mod causal;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod optimize;
pub mod physics;
pub mod robustness;
pub mod scene;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::causal::{CausalGraph, CausalGraphTraverser, EventKind, EventState, Verdict};
    pub use crate::config::{ChainConfig, ChainConfigBuilder};
    pub use crate::engine::rng::SimRng;
    pub use crate::engine::{SimTime, WorkerPool};
    pub use crate::error::{ChainError, ChainResult};
    pub use crate::optimize::{
        maximize_robustness_global, maximize_robustness_local, OptimizationResult,
        OptimizerSettings,
    };
    pub use crate::physics::{PhysicsWorld, SphereWorldFactory};
    pub use crate::robustness::{
        find_successful_samples_adaptive, learn_active, learn_factorized,
        map_events_to_dimensions, BoundaryEstimator, Label, LabelOracle, SimulationOracle,
        SimulationSettings,
    };
    pub use crate::scene::{Scenario, ScenarioDescription, WorldFactory};
}

/// Re-export for public API
pub use error::{ChainError, ChainResult};

/// Crate version, suffixed with the git commit when built from a checkout.
pub const BUILD_ID: &str = env!("CHAINSIM_BUILD_ID");
