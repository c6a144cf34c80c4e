//! Command-line interface.
//!
//! All CLI logic lives here rather than in `main.rs` so it can be tested.
//! The entry point is [`run_cli`].

mod args;
mod commands;
mod output;

pub use args::{Args, Command};
pub use commands::{
    check_scenario, load_label_cache, optimize_scenario, run_cli, run_pipeline, validate_config,
    validate_scenario, PipelineReport,
};
pub use output::{
    print_help, print_version, render_config_summary, render_pipeline_report,
    render_scenario_summary, CenterCheck,
};
