//! # confcascade
//!
//! Entry point for the configuration cascade controller.
//!
//! ## Commands
//!
//! - `run` loads a snapshot into an in-memory cluster, feeds an add
//!   notification for every configuration resource, and drains the work
//!   queue through the worker pool. Every patch sent is printed.
//! - `check` lists the dependents whose recorded reference is stale
//!   without patching anything.
//!
//! ## Shutdown
//!
//! Ctrl+C stops the controller: in-flight reconciliations are cancelled and
//! workers exit without taking more keys.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod snapshot;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use confcascade_core::ControllerConfig;
use confcascade_reconciler::{
    is_stale, Controller, DependencyResolver, Notification, Reconciler,
};
use itertools::Itertools;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Commands};
use crate::snapshot::Snapshot;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { snapshot, config } => run(&snapshot, config.as_deref()).await,
        Commands::Check { snapshot, config } => check(&snapshot, config.as_deref()).await,
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config.validate().context("Invalid controller configuration")?;
    Ok(config)
}

async fn run(snapshot_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let start_time = Instant::now();
    let config = load_config(config_path)?;
    let snapshot = Snapshot::load(snapshot_path)?;
    let configurations = snapshot.configurations.clone();
    let cluster = snapshot
        .into_cluster(&config.reference.field_path)
        .await
        .context("Failed to load snapshot into the cluster")?;

    let reconciler = Arc::new(Reconciler::for_api(cluster.clone(), &config));
    let controller =
        Controller::new(reconciler, config).context("Failed to create controller")?;

    let filter = controller.filter();
    let enqueued = configurations
        .into_iter()
        .filter(|resource| filter.on_notify(&Notification::Added(resource.clone())))
        .count();
    info!(enqueued, "Initial notifications delivered");

    let handle = controller.handle();
    handle.drain();
    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if wait_for_shutdown().await {
                handle.stop();
            }
        })
    };

    controller.run().await;
    stopper.abort();

    if handle.is_stopped() {
        warn!("Interrupted before the queue drained");
    }

    let patches = cluster.patches().await;
    patches.iter().for_each(|key| println!("patched {key}"));
    info!(
        patched = patches.len(),
        elapsed = ?start_time.elapsed(),
        "Cascade complete"
    );

    let dropped = controller.dropped_keys();
    if dropped > 0 {
        anyhow::bail!("{dropped} configuration resource(s) could not be reconciled");
    }
    Ok(())
}

async fn check(snapshot_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let snapshot = Snapshot::load(snapshot_path)?;
    let configurations = snapshot.configurations.clone();
    let cluster = snapshot
        .into_cluster(&config.reference.field_path)
        .await
        .context("Failed to load snapshot into the cluster")?;

    let resolver = DependencyResolver::new(cluster, &config.reference);
    let mut stale_total = 0usize;

    for resource in &configurations {
        let resolution = resolver
            .resolve(resource)
            .await
            .with_context(|| format!("Failed to resolve dependents of {}", resource.metadata.name))?;

        for (dependent, reason) in &resolution.malformed {
            warn!(dependent = %dependent, reason = %reason, "Malformed reference");
        }

        let stale = resolution
            .referencing
            .iter()
            .filter(|referencing| is_stale(&referencing.reference, resource))
            .collect_vec();

        for referencing in &stale {
            println!(
                "{}\t{}\trecorded={}\tcurrent={}",
                referencing.key,
                referencing.reference.configuration_name,
                referencing
                    .reference
                    .recorded_version
                    .as_deref()
                    .unwrap_or("<none>"),
                resource.version(),
            );
        }
        stale_total = stale_total.saturating_add(stale.len());
    }

    info!(stale = stale_total, "Check complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C). Returns `false` if the signal cannot be watched.
async fn wait_for_shutdown() -> bool {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, stopping controller");
            true
        }
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            false
        }
    }
}
