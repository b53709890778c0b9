// src/config/mod.rs

//! Configuration loading and validation for chainwatch.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk and apply env overrides (`loader.rs`).
//! - Parse durations and check value ranges (`validate.rs`, `duration.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{
    apply_env_overrides, apply_env_overrides_from, default_config_path, defaults_with_env,
    load_and_validate, load_from_path,
};
pub use model::{
    AirflowAuth, AirflowSettings, ChainSection, ConfigFile, EventsSection, RawConfigFile,
    ServerSection, TrackerOptions,
};
