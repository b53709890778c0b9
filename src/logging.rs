// src/logging.rs

//! Logging setup for `chainwatch` using `tracing` + `tracing-subscriber`.
//!
//! The filter is chosen in this order:
//! 1. `--log-level` CLI flag
//! 2. `CHAINWATCH_LOG`, any `EnvFilter` directive string
//!    (e.g. `"debug"` or `"chainwatch::tracker=trace,info"`)
//! 3. `info`
//!
//! HTTP client/server internals are capped at `warn` unless the directive
//! string names them explicitly. Logs go to STDERR.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

const NOISY_TARGETS: &str = "hyper=warn,hyper_util=warn,reqwest=warn";

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let directives = filter_directives(cli_level, std::env::var("CHAINWATCH_LOG").ok());
    let filter = EnvFilter::try_new(&directives)
        .or_else(|_| EnvFilter::try_new(filter_directives(None, None)))
        .map_err(|e| anyhow::anyhow!("building log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;

    Ok(())
}

fn filter_directives(cli_level: Option<LogLevel>, env: Option<String>) -> String {
    if let Some(level) = cli_level {
        return format!("{},{NOISY_TARGETS}", level_name(level));
    }

    match env.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        Some(user) => format!("{NOISY_TARGETS},{user}"),
        None => format!("info,{NOISY_TARGETS}"),
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_env() {
        let d = filter_directives(Some(LogLevel::Debug), Some("trace".to_string()));
        assert!(d.starts_with("debug,"));
        assert!(!d.contains("trace"));
    }

    #[test]
    fn env_directives_come_last_so_they_override() {
        let d = filter_directives(None, Some(" reqwest=debug,info ".to_string()));
        assert!(d.ends_with("reqwest=debug,info"));
        assert!(EnvFilter::try_new(&d).is_ok());
    }

    #[test]
    fn defaults_to_info() {
        assert!(filter_directives(None, None).starts_with("info,"));
        assert!(filter_directives(None, Some("  ".to_string())).starts_with("info,"));
    }
}
