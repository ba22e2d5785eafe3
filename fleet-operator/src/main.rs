//! The fleet operator.

mod agent;
#[cfg(test)]
mod agent_test;
mod app;
mod config;
#[cfg(test)]
mod config_test;
mod controller;
mod error;
mod leadership;
#[cfg(test)]
mod leadership_test;
mod relations;
#[cfg(test)]
mod relations_test;
mod server;
#[cfg(test)]
mod server_test;
mod sink;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
                .compact(),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        unit_id = %cfg.unit_id,
        role = %cfg.role,
        state_dir = %cfg.state_dir,
        http_port = %cfg.http_port,
        "starting fleet operator",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await.context("error joining app task").and_then(|res| res) {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
