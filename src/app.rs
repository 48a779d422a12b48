use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;
use tracing::info;

use crate::config::{DaemonConfig, CONFIG_PATH_ENV};
use crate::logging::init_logging;
use crate::service::{Collaborators, TelemetryService};
use crate::storage::FileSnapshotStore;

/// Daemon entrypoint: load configuration, bring the service up, restore
/// persisted state, then persist again and stop once a termination signal
/// arrives.
pub fn run() -> Result<()> {
    let config = match env::var_os(CONFIG_PATH_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            DaemonConfig::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?
        }
        None => DaemonConfig::default(),
    };
    // Only fails when a subscriber is already installed.
    let _ = init_logging(&config.logging);

    let store = FileSnapshotStore::open(&config.storage_dir).with_context(|| {
        format!("opening snapshot store at {}", config.storage_dir.display())
    })?;
    let service = TelemetryService::start(&config, Collaborators::in_memory(Arc::new(store)))
        .context("starting telemetry service")?;

    let runtime = TokioBuilder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for termination signal")?;

    info!("termination signal received");
    service.terminate();
    service.shutdown();
    Ok(())
}
