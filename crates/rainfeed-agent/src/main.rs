//! # Rainfeed Agent
//!
//! Subscribes to gauge snapshots and keeps per-section records up to date.
//! Configuration comes from `RAINFEED_*` environment variables, see
//! [`AgentConfig::from_env`].

use anyhow::{Context, Result};
use rainfeed_agent::{load_catalogue, Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Rainfeed Agent");

    let config = AgentConfig::from_env()?;
    let sections = load_catalogue(&config.catalogue_path).with_context(|| {
        format!(
            "Failed to load catalogue {}",
            config.catalogue_path.display()
        )
    })?;

    tracing::info!(
        sections = sections.len(),
        topic = %config.bus.topic,
        group = %config.bus.group,
        dry_run = config.is_dry_run(),
        "Agent initialized"
    );

    let agent = Agent::connect(config, sections).await?;
    agent.run().await
}
