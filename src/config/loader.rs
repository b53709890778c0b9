// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** parse durations
/// or check value ranges. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path, apply environment overrides and
/// validate the result.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Applies `AIRFLOW_URL`, `AIRFLOW_USERNAME`, `AIRFLOW_PASSWORD`.
/// - Parses durations and checks ranges.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let raw_config = apply_env_overrides(raw_config);
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Built-in defaults plus environment overrides, used when no config file
/// exists at the default location.
pub fn defaults_with_env() -> Result<ConfigFile> {
    ConfigFile::try_from(apply_env_overrides(RawConfigFile::default()))
}

/// Helper to resolve a default config path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Chainwatch.toml")
}

/// Override Airflow connection settings from the process environment.
pub fn apply_env_overrides(raw: RawConfigFile) -> RawConfigFile {
    apply_env_overrides_from(raw, |key| std::env::var(key).ok())
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_env_overrides_from<F>(mut raw: RawConfigFile, lookup: F) -> RawConfigFile
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("AIRFLOW_URL").filter(|v| !v.is_empty()) {
        raw.airflow.base_url = url;
    }
    if let Some(username) = lookup("AIRFLOW_USERNAME").filter(|v| !v.is_empty()) {
        raw.airflow.username = Some(username);
    }
    if let Some(password) = lookup("AIRFLOW_PASSWORD") {
        raw.airflow.password = Some(password);
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_replace_airflow_connection() {
        let raw = apply_env_overrides_from(RawConfigFile::default(), |key| match key {
            "AIRFLOW_URL" => Some("http://airflow:8080".to_string()),
            "AIRFLOW_USERNAME" => Some("ops".to_string()),
            _ => None,
        });

        assert_eq!(raw.airflow.base_url, "http://airflow:8080");
        assert_eq!(raw.airflow.username.as_deref(), Some("ops"));
        assert_eq!(raw.airflow.password.as_deref(), Some("admin"));
    }

    #[test]
    fn empty_url_override_is_ignored() {
        let raw = apply_env_overrides_from(RawConfigFile::default(), |key| {
            (key == "AIRFLOW_URL").then(String::new)
        });
        assert_eq!(raw.airflow.base_url, "http://localhost:8080");
    }
}
