// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `chainwatch`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "chainwatch",
    version,
    about = "Trigger ordered chains of Airflow DAGs per task and relay their progress.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Chainwatch.toml` in the current working directory. When the
    /// default file is absent, built-in defaults are used.
    #[arg(long, value_name = "PATH", default_value = "Chainwatch.toml")]
    pub config: String,

    /// Override `[server].bind`, e.g. `0.0.0.0:8000`.
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CHAINWATCH_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config, print it, but don't start the server.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
