//! CLI output formatting.
//!
//! Reports are rendered to strings first so tests can inspect them.

use std::fmt::Write;

use super::commands::PipelineReport;
use crate::config::ChainConfig;
use crate::optimize::OptimizationResult;
use crate::physics::sphere::SphereWorldFactory;
use crate::scene::Scenario;
use crate::BUILD_ID;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Print version information.
pub fn print_version() {
    println!("chainsim {BUILD_ID}");
}

/// Print help message.
pub fn print_help() {
    println!(
        r"chainsim - Causal chain simulation and robustness analysis

USAGE:
    chainsim <COMMAND> [OPTIONS]

COMMANDS:
    validate <scenario.json|yaml>  Load a scenario, resolve its events and
                                   instantiate it at the design-space center
        -c, --config <file.yaml>   Apply a pipeline configuration

    optimize <scenario.json|yaml>  Sample, learn the success boundaries and
                                   maximize robustness
        -c, --config <file.yaml>   Apply a pipeline configuration
        --cache <file.bin>         Reuse and update a label cache snapshot
        -g, --global               Also run the CMA-ES search

    config <config.yaml>           Load and validate a pipeline configuration

    help                           Show this help message
    version                        Show version information

EXAMPLES:
    chainsim validate scenarios/domino_run.yaml
    chainsim validate scenarios/domino_run.yaml --config pipeline.yaml
    chainsim optimize scenarios/domino_run.yaml -c pipeline.yaml --global
    chainsim config pipeline.yaml

LOGGING:
    Set RUST_LOG (e.g. RUST_LOG=chainsim=debug) to control log output.
"
    );
}

/// Outcome of instantiating a scenario at the design-space center.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterCheck {
    /// World built and causal graph bound.
    pub instantiated: bool,
    /// No interpenetration at the center.
    pub physically_valid: bool,
}

/// Render a scenario summary.
#[must_use]
pub fn render_scenario_summary(
    scenario: &Scenario<SphereWorldFactory>,
    center: CenterCheck,
) -> String {
    let mut out = String::new();
    let graph = scenario.causal_graph();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Scenario: {}", scenario.identity_hex());
    let _ = writeln!(out, "{RULE}\n");

    let _ = writeln!(out, "Objects: {}", scenario.objects().len());
    for object in scenario.objects() {
        let _ = writeln!(out, "  • {} ({})", object.name, object.kind);
    }

    let free = scenario.design_space().free_parameter_names();
    let _ = writeln!(out, "\nDesign space: {} free parameters", free.len());
    for name in &free {
        let _ = writeln!(out, "  • {name}");
    }

    if graph.is_empty() {
        let _ = writeln!(out, "\nCausal graph: none (every run is labelled failure)");
    } else {
        let _ = writeln!(
            out,
            "\nCausal graph: {} events, root '{}'",
            graph.len(),
            graph.root_name().unwrap_or("?")
        );
        for (parent, child) in graph.edges() {
            let _ = writeln!(out, "  {parent} → {child}");
        }
    }

    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    let _ = writeln!(out, "\nCenter sample:");
    let _ = writeln!(out, "  {} instantiated", mark(center.instantiated));
    let _ = writeln!(out, "  {} physically valid", mark(center.physically_valid));
    out
}

/// Render the effective values of a configuration.
#[must_use]
pub fn render_config_summary(config: &ChainConfig) -> String {
    let mut out = String::new();
    let sampling = config.sampling_settings();
    let learning = config.active_learning_settings();
    let attribution = config.attribution_settings();
    let optimizer = config.optimizer_settings();

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Configuration (schema {})", config.schema_version);
    let _ = writeln!(out, "{RULE}\n");
    let _ = writeln!(out, "Seed:       {}", config.reproducibility.seed);
    let _ = writeln!(out, "Workers:    {}", config.worker_pool().num_workers());
    let _ = writeln!(
        out,
        "Simulation: {} s at dt {} s, max wait {} s",
        config.simulation.duration, config.simulation.timestep, config.simulation.max_wait_time
    );
    let _ = writeln!(
        out,
        "Sampling:   n_succ {}, n_0 {}, n_k {}, k_max {}, sigma {}",
        sampling.n_succ, sampling.n_0, sampling.n_k, sampling.k_max, sampling.sigma
    );
    let _ = writeln!(
        out,
        "Learning:   accuracy {}, n_k {}, k_max {}, strategy {:?}, {} grid points",
        learning.accuracy,
        learning.n_k,
        learning.k_max,
        learning.strategy,
        learning.svc.grid().len()
    );
    let _ = writeln!(
        out,
        "Attribution: invariant above {}, select above {} of best",
        attribution.invar_success_rate, attribution.select_coeff
    );
    let _ = writeln!(
        out,
        "Optimizer:  smin {}, sigma0 {}, max_fevals {}, max_iter {}",
        optimizer.smin_coeff, optimizer.sigma0, optimizer.max_fevals, optimizer.max_iter
    );
    out
}

fn render_result(out: &mut String, title: &str, result: &OptimizationResult, names: &[String]) {
    let _ = writeln!(
        out,
        "\n{title}: energy {:.4}, {} iterations, {} evaluations ({})",
        result.fun, result.nit, result.nfev, result.message
    );
    for (name, value) in names.iter().zip(&result.x) {
        let _ = writeln!(out, "  {name:<16} {value:.4}");
    }
}

/// Render the outcome of a robustness run.
#[must_use]
pub fn render_pipeline_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Robustness optimization");
    let _ = writeln!(out, "{RULE}\n");
    let _ = writeln!(
        out,
        "Samples:    {} labeled, {} successful",
        report.n_samples, report.n_successes
    );

    let _ = writeln!(out, "\nEstimators: {}", report.estimators.len());
    for (event, dims, score) in &report.estimators {
        let names: Vec<&str> = dims
            .iter()
            .filter_map(|&d| report.parameters.get(d).map(String::as_str))
            .collect();
        let _ = writeln!(out, "  • {event} [{}] accuracy {score:.3}", names.join(", "));
    }

    let _ = writeln!(out, "\nWarm start:");
    for (name, value) in report.parameters.iter().zip(&report.warm_start) {
        let _ = writeln!(out, "  {name:<16} {value:.4}");
    }
    render_result(&mut out, "Local", &report.local, &report.parameters);
    if let Some(global) = &report.global {
        render_result(&mut out, "Global", global, &report.parameters);
    }
    let _ = writeln!(out, "\nBest point label: {:?}", report.label);
    out
}
