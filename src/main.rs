//! GLPI Agent - inventory and network discovery agent daemon.
//!
//! Contacts GLPI servers or writes to local directories on a randomized
//! schedule, and runs network discovery jobs with a bounded probe pool.

mod client;
mod config;
mod daemon;
mod db;
mod event;
mod netdiscovery;
mod probe;
mod target;
mod task;
mod web;

use crate::config::AgentConfig;
use daemon::Daemon;
use db::Store;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = AgentConfig::load()?;

    // RUST_LOG wins over the configured debug level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(cfg.log_directive())?,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    if let Some(source) = &cfg.source {
        tracing::info!("Using configuration from {}", source.display());
    }
    if cfg.server.is_empty() && cfg.local.is_empty() {
        return Err(crate::config::ConfigError::NoTarget.into());
    }

    std::fs::create_dir_all(&cfg.vardir)?;
    let db_path = cfg.vardir.join("agent.db");
    tracing::info!("Using state database at {}", db_path.display());
    let store = Store::new(&db_path)?;

    let mut daemon = Daemon::new(cfg, store)?;
    #[cfg(unix)]
    let _signals = daemon::forward_signals(daemon.commands())?;

    daemon.init().await?;
    daemon.run().await;

    Ok(())
}
