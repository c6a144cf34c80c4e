//! CLI command handlers.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::output::{
    print_help, print_version, render_config_summary, render_pipeline_report,
    render_scenario_summary, CenterCheck,
};
use super::{Args, Command};
use crate::config::ChainConfig;
use crate::engine::SimRng;
use crate::error::{ChainError, ChainResult};
use crate::optimize::{
    maximize_robustness_global, maximize_robustness_local, select_warm_start, OptimizationResult,
};
use crate::physics::SphereWorldFactory;
use crate::robustness::{
    find_successful_samples_adaptive, learn_active, learn_factorized, BoundaryEstimator,
    LabelCache, Label, LabelOracle, Sample, SimulationOracle,
};
use crate::scene::Scenario;

/// Estimator name used when no event depends on the design.
const GLOBAL: &str = "<global>";

/// Main CLI entry point.
///
/// Dispatches to the appropriate command handler based on parsed arguments.
#[must_use]
pub fn run_cli(args: Args) -> ExitCode {
    match args.command {
        Command::Validate {
            scenario_path,
            config_path,
        } => validate_scenario(&scenario_path, config_path.as_deref()),
        Command::Optimize {
            scenario_path,
            config_path,
            cache_path,
            global,
        } => optimize_scenario(
            &scenario_path,
            config_path.as_deref(),
            cache_path.as_deref(),
            global,
        ),
        Command::Config { config_path } => validate_config(&config_path),
        Command::Help => {
            print_help();
            ExitCode::SUCCESS
        }
        Command::Version => {
            print_version();
            ExitCode::SUCCESS
        }
    }
}

/// Load a scenario and instantiate it at the center of its design space.
///
/// # Errors
///
/// Returns an error if the scenario cannot be loaded or resolved. A center
/// that fails to instantiate is reported in the [`CenterCheck`] instead.
pub fn check_scenario(
    path: &Path,
    config: &ChainConfig,
) -> ChainResult<(Scenario<SphereWorldFactory>, CenterCheck)> {
    let scenario =
        Scenario::load(path, SphereWorldFactory::new())?.with_max_wait(config.max_wait_time());
    let center = vec![0.5; scenario.dims()];
    let instantiated = match scenario.instantiate_from_sample(&center) {
        Ok(_) => true,
        Err(e) => {
            info!(error = %e, "center sample failed to instantiate");
            false
        }
    };
    let physically_valid = instantiated && scenario.check_physically_valid_sample(&center)?;
    debug!(dims = scenario.dims(), instantiated, physically_valid, "scenario checked");
    Ok((
        scenario,
        CenterCheck {
            instantiated,
            physically_valid,
        },
    ))
}

/// Load an optional configuration, falling back to defaults.
fn load_config(config_path: Option<&Path>) -> Option<ChainConfig> {
    match config_path.map(ChainConfig::load).transpose() {
        Ok(config) => Some(config.unwrap_or_default()),
        Err(e) => {
            eprintln!("✗ Configuration error: {e}");
            None
        }
    }
}

/// Validate a scenario file, optionally under a pipeline configuration.
#[must_use]
pub fn validate_scenario(path: &Path, config_path: Option<&Path>) -> ExitCode {
    println!("Validating scenario: {}\n", path.display());

    let Some(config) = load_config(config_path) else {
        return ExitCode::from(1);
    };

    match check_scenario(path, &config) {
        Ok((scenario, center)) => {
            print!("{}", render_scenario_summary(&scenario, center));
            if center.instantiated {
                println!("\n✓ Scenario validation PASSED");
                ExitCode::SUCCESS
            } else {
                println!("\n✗ Scenario validation FAILED");
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("✗ Scenario validation FAILED: {e}");
            ExitCode::from(1)
        }
    }
}

/// Load and validate a pipeline configuration.
#[must_use]
pub fn validate_config(path: &Path) -> ExitCode {
    println!("Validating configuration: {}\n", path.display());

    match ChainConfig::load(path) {
        Ok(config) => {
            print!("{}", render_config_summary(&config));
            println!("\n✓ Configuration validation PASSED");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation FAILED: {e}");
            ExitCode::from(1)
        }
    }
}

/// Result of a full robustness run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Free parameter names, in sample order.
    pub parameters: Vec<String>,
    /// Labeled samples collected by the adaptive search.
    pub n_samples: usize,
    /// Successful samples among them.
    pub n_successes: usize,
    /// Learned estimators: event name, dimensions and final CV accuracy.
    pub estimators: Vec<(String, Vec<usize>, f64)>,
    /// Most robust successful sample.
    pub warm_start: Sample,
    /// Local refinement from the warm start.
    pub local: OptimizationResult,
    /// CMA-ES search from the warm start, if requested.
    pub global: Option<OptimizationResult>,
    /// Label of the best point.
    pub label: Label,
}

impl PipelineReport {
    /// Global result if one was computed, the local one otherwise.
    #[must_use]
    pub fn best(&self) -> &OptimizationResult {
        self.global.as_ref().unwrap_or(&self.local)
    }
}

/// Sample, learn per-event boundaries and maximize robustness.
///
/// Falls back to a single global boundary when no event is attributed to
/// any dimension.
///
/// # Errors
///
/// Propagates sampling, learning and optimization errors. Fails when no
/// successful sample was found.
pub fn run_pipeline(
    scenario: &Scenario<SphereWorldFactory>,
    config: &ChainConfig,
    global: bool,
    cache: Option<Arc<LabelCache>>,
) -> ChainResult<PipelineReport> {
    let mut oracle = SimulationOracle::new(scenario, config.simulation_settings());
    if let Some(cache) = cache {
        oracle = oracle.with_cache(cache);
    }
    let pool = config.worker_pool();
    let mut rng = SimRng::new(config.reproducibility.seed);
    let learning = config.active_learning_settings();

    let set =
        find_successful_samples_adaptive(&oracle, &config.sampling_settings(), &mut rng, &pool)?;
    let successes: Vec<Sample> = set
        .samples
        .iter()
        .zip(&set.labels)
        .filter(|(_, label)| label.is_success())
        .map(|(sample, _)| sample.clone())
        .collect();
    if successes.is_empty() {
        return Err(ChainError::learning("no successful sample found"));
    }

    let mut learned: Vec<(String, BoundaryEstimator, f64)> = learn_factorized(
        &oracle,
        &set,
        &config.attribution_settings(),
        &learning,
        &mut rng,
        &pool,
    )?
    .into_iter()
    .map(|(event, (estimator, trace))| (event, estimator, trace.final_score().unwrap_or(0.0)))
    .collect();
    if learned.is_empty() {
        info!("no event depends on the design, learning the global boundary");
        let (estimator, trace) = learn_active(
            &oracle,
            &set.samples,
            &set.success_labels(),
            &learning,
            &mut rng,
            &pool,
        )?;
        learned.push((
            GLOBAL.to_string(),
            estimator,
            trace.final_score().unwrap_or(0.0),
        ));
    }

    let estimators: Vec<&BoundaryEstimator> = learned.iter().map(|(_, e, _)| e).collect();
    let warm_start = select_warm_start(&estimators, &successes)?
        .ok_or_else(|| ChainError::optimization("no warm start"))?;
    let optimizer = config.optimizer_settings();
    let local = maximize_robustness_local(&oracle, &estimators, &warm_start, &optimizer)?;
    let global = if global {
        Some(maximize_robustness_global(
            &oracle,
            &estimators,
            &warm_start,
            &optimizer,
            &mut rng,
            &pool,
        )?)
    } else {
        None
    };

    let best = global.as_ref().unwrap_or(&local);
    let label = oracle.label(&best.x)?;
    info!(?label, fun = best.fun, "robustness pipeline done");

    Ok(PipelineReport {
        parameters: scenario.design_space().free_parameter_names(),
        n_samples: set.len(),
        n_successes: successes.len(),
        estimators: learned
            .iter()
            .map(|(event, estimator, score)| (event.clone(), estimator.dims().to_vec(), *score))
            .collect(),
        warm_start,
        local,
        global,
        label,
    })
}

/// Read a label cache snapshot, starting empty if it is missing or unusable.
#[must_use]
pub fn load_label_cache(path: &Path) -> LabelCache {
    if !path.exists() {
        return LabelCache::new();
    }
    match LabelCache::load(path) {
        Ok(cache) => {
            info!(entries = cache.len(), path = %path.display(), "label cache restored");
            cache
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "discarding label cache");
            LabelCache::new()
        }
    }
}

/// Run the robustness pipeline on a scenario file.
#[must_use]
pub fn optimize_scenario(
    path: &Path,
    config_path: Option<&Path>,
    cache_path: Option<&Path>,
    global: bool,
) -> ExitCode {
    println!("Optimizing scenario: {}\n", path.display());

    let Some(config) = load_config(config_path) else {
        return ExitCode::from(1);
    };
    let scenario = match check_scenario(path, &config) {
        Ok((scenario, center)) if center.instantiated => scenario,
        Ok(_) => {
            eprintln!("✗ Scenario cannot be instantiated");
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("✗ Scenario error: {e}");
            return ExitCode::from(1);
        }
    };

    let cache = cache_path.map(|p| Arc::new(load_label_cache(p)));
    let report = match run_pipeline(&scenario, &config, global, cache.clone()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("✗ Optimization FAILED: {e}");
            return ExitCode::from(1);
        }
    };
    print!("{}", render_pipeline_report(&report));

    if let (Some(cache), Some(p)) = (cache, cache_path) {
        info!(hits = cache.hits(), misses = cache.misses(), "label cache usage");
        if let Err(e) = cache.save(p, 3) {
            eprintln!("✗ Could not write label cache: {e}");
            return ExitCode::from(1);
        }
    }

    if report.label.is_success() {
        println!("\n✓ Optimum succeeds");
        ExitCode::SUCCESS
    } else {
        println!("\n✗ Optimum does not succeed ({:?})", report.label);
        ExitCode::from(1)
    }
}
