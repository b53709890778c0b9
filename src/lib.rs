// src/lib.rs

pub mod airflow;
pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod relay;
pub mod store;
pub mod tracker;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::airflow::{AirflowApi, AirflowClient};
use crate::api::AppState;
use crate::cli::CliArgs;
use crate::config::{AirflowAuth, ConfigFile, default_config_path, defaults_with_env, load_and_validate};
use crate::events::EventBus;
use crate::relay::Registry;
use crate::store::{MemoryStore, TaskStore};
use crate::tracker::{Tracker, TrackerContext};

/// Fully wired service, ready to be served.
pub struct App {
    pub state: AppState,
    pub events: EventBus,
    relay: JoinHandle<()>,
    relay_cancel: CancellationToken,
}

impl App {
    /// Wire store, bus, tracker, registry and relay around `airflow`.
    ///
    /// Must be called inside a Tokio runtime (the relay loop is spawned).
    pub fn build(cfg: &ConfigFile, airflow: Arc<dyn AirflowApi>) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new(cfg.events.capacity);
        let ctx = TrackerContext::new(airflow, Arc::clone(&store), events.clone());
        let tracker = Arc::new(Tracker::new(ctx, cfg.tracker));
        let registry = Arc::new(Registry::new(cfg.events.client_queue));

        let relay_cancel = CancellationToken::new();
        let relay = relay::spawn_relay(&events, Arc::clone(&registry), relay_cancel.clone());

        let state = AppState {
            tracker,
            store,
            registry,
            default_chain: Arc::new(cfg.chain.default_dags.clone()),
        };

        Self {
            state,
            events,
            relay,
            relay_cancel,
        }
    }

    pub fn router(&self) -> axum::Router {
        api::router(self.state.clone())
    }

    /// Stop every chain poll loop and the relay.
    pub async fn shutdown(self) {
        self.state.tracker.shutdown().await;
        self.relay_cancel.cancel();
        if let Err(err) = self.relay.await {
            warn!(error = %err, "event relay ended abnormally");
        }
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - Airflow client, store, event bus, tracker, relay
/// - the HTTP/WebSocket server
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_config(&config_path)?;

    if let Some(bind) = args.bind.clone() {
        cfg.server.bind = bind;
    }

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let airflow: Arc<dyn AirflowApi> = Arc::new(AirflowClient::new(&cfg.airflow)?);
    let app = App::build(&cfg, airflow);

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    info!(
        bind = %cfg.server.bind,
        airflow = %cfg.airflow.base_url,
        "chainwatch listening"
    );

    axum::serve(listener, app.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("shutting down");
    app.shutdown().await;
    Ok(())
}

/// Load the config file, falling back to defaults when the default path is
/// absent. An explicitly named file must exist.
fn load_config(path: &Path) -> Result<ConfigFile> {
    if path == default_config_path() && !path.exists() {
        info!(path = %path.display(), "no config file found; using defaults");
        return Ok(defaults_with_env()?);
    }
    load_and_validate(path).with_context(|| format!("loading config from {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

fn print_dry_run(cfg: &ConfigFile) {
    println!("chainwatch dry-run");
    println!("  server.bind = {}", cfg.server.bind);
    println!("  airflow.base_url = {}", cfg.airflow.base_url);
    let auth = match &cfg.airflow.auth {
        AirflowAuth::None => "none".to_string(),
        AirflowAuth::Basic { username, .. } => format!("basic ({username})"),
        AirflowAuth::Bearer(_) => "bearer token".to_string(),
    };
    println!("  airflow.auth = {auth}");
    println!("  airflow.request_timeout = {:?}", cfg.airflow.request_timeout);
    println!(
        "  airflow.retry = {} attempts, backoff from {:?}",
        cfg.airflow.retry_attempts, cfg.airflow.retry_backoff
    );
    println!("  tracker.poll_interval = {:?}", cfg.tracker.poll_interval);
    println!("  tracker.initial_delay = {:?}", cfg.tracker.initial_delay);
    println!("  tracker.run_timeout = {:?}", cfg.tracker.run_timeout);
    println!("  events.capacity = {}", cfg.events.capacity);
    println!("  events.client_queue = {}", cfg.events.client_queue);
    println!();

    println!("default chain ({}):", cfg.chain.default_dags.len());
    for (idx, dag) in cfg.chain.default_dags.iter().enumerate() {
        println!("  {}. {dag}", idx + 1);
    }
}
