//! CLI argument parsing.
//!
//! Parsing works on any iterator of strings so it can be tested without
//! touching the process environment.

use std::path::PathBuf;

/// CLI arguments container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    /// The command to execute.
    pub command: Command,
}

/// Available CLI commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load a scenario and check it end to end
    Validate {
        /// Path to the scenario JSON or YAML file.
        scenario_path: PathBuf,
        /// Optional pipeline configuration.
        config_path: Option<PathBuf>,
    },
    /// Run the robustness pipeline on a scenario
    Optimize {
        /// Path to the scenario JSON or YAML file.
        scenario_path: PathBuf,
        /// Optional pipeline configuration.
        config_path: Option<PathBuf>,
        /// Label cache snapshot, read if present and written afterwards.
        cache_path: Option<PathBuf>,
        /// Follow the local refinement with a CMA-ES search.
        global: bool,
    },
    /// Load and validate a pipeline configuration
    Config {
        /// Path to the configuration YAML file.
        config_path: PathBuf,
    },
    /// Show help
    Help,
    /// Show version
    Version,
}

impl Args {
    /// Parse command-line arguments from an iterator.
    ///
    /// The first item is the program name.
    #[must_use]
    pub fn parse_from<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::parse_from_vec(&args)
    }

    /// Parse command-line arguments from the environment.
    #[must_use]
    pub fn parse() -> Self {
        Self::parse_from(std::env::args())
    }

    fn parse_from_vec(args: &[String]) -> Self {
        if args.len() < 2 {
            return Self {
                command: Command::Help,
            };
        }

        let command = match args[1].as_str() {
            "validate" => Self::parse_validate_command(args),
            "optimize" => Self::parse_optimize_command(args),
            "config" => Self::parse_config_command(args),
            "-h" | "--help" | "help" => Command::Help,
            "-V" | "--version" | "version" => Command::Version,
            unknown => {
                eprintln!("Unknown command: {unknown}");
                Command::Help
            }
        };

        Self { command }
    }

    fn parse_validate_command(args: &[String]) -> Command {
        if args.len() < 3 {
            eprintln!("Error: 'validate' command requires a scenario path");
            return Command::Help;
        }

        let mut config_path = None;
        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.get(i + 1) {
                        config_path = Some(PathBuf::from(path));
                        i += 2;
                    } else {
                        eprintln!("Error: '--config' requires a path");
                        i += 1;
                    }
                }
                other => {
                    eprintln!("Ignoring unexpected argument: {other}");
                    i += 1;
                }
            }
        }

        Command::Validate {
            scenario_path: PathBuf::from(&args[2]),
            config_path,
        }
    }

    fn parse_optimize_command(args: &[String]) -> Command {
        if args.len() < 3 {
            eprintln!("Error: 'optimize' command requires a scenario path");
            return Command::Help;
        }

        let mut config_path = None;
        let mut cache_path = None;
        let mut global = false;
        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                flag @ ("-c" | "--config" | "--cache") => {
                    let Some(path) = args.get(i + 1) else {
                        eprintln!("Error: '{flag}' requires a path");
                        i += 1;
                        continue;
                    };
                    if flag == "--cache" {
                        cache_path = Some(PathBuf::from(path));
                    } else {
                        config_path = Some(PathBuf::from(path));
                    }
                    i += 2;
                }
                "-g" | "--global" => {
                    global = true;
                    i += 1;
                }
                other => {
                    eprintln!("Ignoring unexpected argument: {other}");
                    i += 1;
                }
            }
        }

        Command::Optimize {
            scenario_path: PathBuf::from(&args[2]),
            config_path,
            cache_path,
            global,
        }
    }

    fn parse_config_command(args: &[String]) -> Command {
        if args.len() < 3 {
            eprintln!("Error: 'config' command requires a configuration path");
            return Command::Help;
        }

        Command::Config {
            config_path: PathBuf::from(&args[2]),
        }
    }
}
