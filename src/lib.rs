pub mod api;
pub mod channels;
pub mod config;
pub mod db;
pub mod models;
pub mod triage;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::channels::log::LogChannel;
use crate::channels::webhook::WebhookChannel;
use crate::channels::{ChannelError, ChannelRegistry};
use crate::config::{ConfigError, EngineConfig};
use crate::models::enums::ChannelKind;
use crate::triage::{
    AlertStore, RuleConfigError, RuleRegistry, RuleSet, SystemClock, TriageEngine, TriageError,
};

/// Anything that stops the service from coming up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot create data directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Triage(#[from] TriageError),

    #[error(transparent)]
    Rules(#[from] RuleConfigError),

    #[error("Channel setup failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("API server failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

fn load_rules(config: &EngineConfig) -> Result<RuleRegistry, RuleConfigError> {
    match &config.rules_path {
        Some(path) => RuleRegistry::from_file(path),
        None => {
            tracing::warn!("No rules file configured, using the bundled rule set");
            RuleRegistry::new(RuleSet::from_json(config::DEFAULT_RULES_JSON)?)
        }
    }
}

fn build_channels(config: &EngineConfig) -> Result<ChannelRegistry, ChannelError> {
    let mut registry = ChannelRegistry::new();
    for kind in [ChannelKind::Push, ChannelKind::Sms, ChannelKind::Voice] {
        match config.webhooks.iter().find(|(k, _)| *k == kind) {
            Some((_, url)) => {
                tracing::info!(channel = %kind, url = %url, "Webhook channel configured");
                registry.register(Arc::new(WebhookChannel::new(
                    kind,
                    url,
                    config.retry.send_timeout,
                )?));
            }
            None => registry.register(Arc::new(LogChannel::new(kind))),
        }
    }
    Ok(registry)
}

/// Build the engine from `config`, recover persisted timers, start the
/// workers and the API, and run until ctrl-c.
pub async fn run(config: EngineConfig) -> Result<(), StartupError> {
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StartupError::DataDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let store = Arc::new(AlertStore::open(&config.db_path, Arc::new(SystemClock))?);
    let rules = Arc::new(load_rules(&config)?);
    tracing::info!(
        db = %config.db_path.display(),
        rules_version = rules.version(),
        "Store and rules loaded"
    );

    let channels = build_channels(&config)?;
    let engine = Arc::new(
        TriageEngine::new(store, rules, channels, config.retry.clone())
            .with_replay_window(config.replay_window),
    );

    let recovered = engine.recover()?;
    tracing::info!(recovered, "Recovered open alerts");

    let workers = engine.spawn_workers(config.dispatch_workers, config.intake_capacity);
    let server = api::start_api_server(Arc::clone(&engine), config.bind).await?;
    tracing::info!(addr = %server.addr, "Accepting requests");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");

    server.stop().await;
    workers.join().await;
    Ok(())
}
