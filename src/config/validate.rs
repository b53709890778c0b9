// src/config/validate.rs

use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    AirflowAuth, AirflowSettings, ConfigFile, RawAirflowSection, RawConfigFile,
    RawTrackerSection, TrackerOptions,
};
use crate::errors::{ChainwatchError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::ChainwatchError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let airflow = validate_airflow(&raw.airflow)?;
        let tracker = validate_tracker(&raw.tracker)?;
        validate_events(&raw)?;
        validate_chain(&raw)?;

        Ok(ConfigFile {
            server: raw.server,
            airflow,
            tracker,
            events: raw.events,
            chain: raw.chain,
        })
    }
}

fn duration_field(section: &str, key: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| ChainwatchError::ConfigError(format!("[{section}].{key}: {e}")))
}

fn validate_airflow(raw: &RawAirflowSection) -> Result<AirflowSettings> {
    let base_url = raw.base_url.trim().trim_end_matches('/').to_string();
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ChainwatchError::ConfigError(format!(
            "[airflow].base_url must start with http:// or https:// (got '{}')",
            raw.base_url
        )));
    }

    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
    let auth = match (non_empty(&raw.token), non_empty(&raw.username), non_empty(&raw.password)) {
        (Some(token), _, _) => AirflowAuth::Bearer(token),
        (None, Some(username), password) => AirflowAuth::Basic {
            username,
            password: password.unwrap_or_default(),
        },
        (None, None, Some(_)) => {
            return Err(ChainwatchError::ConfigError(
                "[airflow].password is set but [airflow].username is missing".to_string(),
            ));
        }
        _ => AirflowAuth::None,
    };

    let request_timeout = duration_field("airflow", "request_timeout", &raw.request_timeout)?;
    if request_timeout.is_zero() {
        return Err(ChainwatchError::ConfigError(
            "[airflow].request_timeout must be > 0".to_string(),
        ));
    }

    if raw.retry_attempts == 0 {
        return Err(ChainwatchError::ConfigError(
            "[airflow].retry_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    let retry_backoff = duration_field("airflow", "retry_backoff", &raw.retry_backoff)?;

    Ok(AirflowSettings {
        base_url,
        auth,
        request_timeout,
        retry_attempts: raw.retry_attempts,
        retry_backoff,
    })
}

fn validate_tracker(raw: &RawTrackerSection) -> Result<TrackerOptions> {
    let poll_interval = duration_field("tracker", "poll_interval", &raw.poll_interval)?;
    let initial_delay = duration_field("tracker", "initial_delay", &raw.initial_delay)?;
    let run_timeout = duration_field("tracker", "run_timeout", &raw.run_timeout)?;

    if poll_interval.is_zero() {
        return Err(ChainwatchError::ConfigError(
            "[tracker].poll_interval must be > 0".to_string(),
        ));
    }

    if run_timeout < poll_interval {
        return Err(ChainwatchError::ConfigError(format!(
            "[tracker].run_timeout ({}) must not be shorter than poll_interval ({})",
            raw.run_timeout, raw.poll_interval
        )));
    }

    Ok(TrackerOptions {
        poll_interval,
        initial_delay,
        run_timeout,
    })
}

fn validate_events(cfg: &RawConfigFile) -> Result<()> {
    if cfg.events.capacity == 0 {
        return Err(ChainwatchError::ConfigError(
            "[events].capacity must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.events.client_queue == 0 {
        return Err(ChainwatchError::ConfigError(
            "[events].client_queue must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_chain(cfg: &RawConfigFile) -> Result<()> {
    for (idx, dag) in cfg.chain.default_dags.iter().enumerate() {
        if dag.trim().is_empty() {
            return Err(ChainwatchError::ConfigError(format!(
                "[chain].default_dags[{idx}] must not be empty"
            )));
        }
    }
    Ok(())
}
