//! Tripwatch -- scheduled smoke tests against trip-planner deployments.
//!
//! This crate provides the configuration model, schedule parsing, the suite
//! registry and executor, the task scheduler, and the orchestrator that ties
//! them together.

pub mod config;
pub mod orchestrator;
pub mod scheduler;
pub mod suite;
pub mod suites;
pub mod validate;

use std::future::Future;
use std::path::Path;

use anyhow::Result;

use crate::config::SmokeConfig;
use crate::orchestrator::Orchestrator;

/// Load the configuration from `path` if given, otherwise from the usual
/// locations.
pub fn load_config(path: Option<&Path>) -> Result<SmokeConfig> {
    match path {
        Some(path) => Ok(SmokeConfig::load(path)?),
        None => Ok(SmokeConfig::load_or_default()),
    }
}

/// Start the daemon with an already loaded `config`: schedule every
/// configured suite and run until Ctrl-C. On Unix, SIGHUP reloads the
/// configuration from `config_path` (or the usual locations).
pub async fn serve(config: SmokeConfig, config_path: Option<&Path>) -> Result<()> {
    serve_until(config, config_path, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C, stopping");
        }
    })
    .await
}

/// Like [`serve`], stopping when `shutdown` completes.
pub async fn serve_until<F>(config: SmokeConfig, config_path: Option<&Path>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let orchestrator = Orchestrator::new(config, suites::builtin_registry());

    // An invalid configuration is reported and the daemon keeps running with
    // nothing scheduled, so a fixed file can be picked up by a reload.
    match orchestrator.initialize() {
        Ok(summary) => tracing::info!(
            scheduled = summary.scheduled,
            disabled = summary.disabled,
            skipped = summary.skipped,
            "Tripwatch running"
        ),
        Err(e) => tracing::error!(error = %e, "Tripwatch running with no scheduled suites"),
    }

    wait_for_shutdown(&orchestrator, config_path, shutdown).await?;

    tracing::info!("shutting down");
    if !orchestrator.shutdown().await {
        tracing::warn!("in-flight suite runs did not finish before the shutdown timeout");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown<F>(orchestrator: &Orchestrator, config_path: Option<&Path>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = hangup.recv() => reload(orchestrator, config_path),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown<F>(_orchestrator: &Orchestrator, _config_path: Option<&Path>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    shutdown.await;
    Ok(())
}

#[cfg(unix)]
fn reload(orchestrator: &Orchestrator, config_path: Option<&Path>) {
    tracing::info!("SIGHUP received, reloading configuration");
    let candidate = match load_config(config_path) {
        Ok(candidate) => candidate,
        Err(e) => {
            tracing::error!(error = %e, "reload failed, keeping current configuration");
            return;
        }
    };
    match orchestrator.replace_config(candidate) {
        Ok(summary) => tracing::info!(scheduled = summary.scheduled, "configuration reloaded"),
        Err(e) => tracing::error!(error = %e, "reload rejected"),
    }
}
