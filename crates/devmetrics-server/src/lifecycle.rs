//! Startup restore, periodic backup and the shutdown flush.

use crate::config::ServerConfig;
use crate::service::MetricsService;
use crate::store::Integrity;
use anyhow::{Context, Result};
use devmetrics_common::codec::RsaDecryptor;
use devmetrics_common::sign::Signer;
use devmetrics_storage::file::FileBackend;
use devmetrics_storage::sqlite::SqliteBackend;
use devmetrics_storage::{Persistence, SnapshotBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Opens every configured backend. A database that cannot be opened is
/// logged and left out, so the server still runs (and `/ping` fails).
pub fn build_persistence(config: &ServerConfig) -> Persistence {
    let mut backends: Vec<Arc<dyn SnapshotBackend>> = Vec::new();
    if let Some(dsn) = &config.database_dsn {
        match SqliteBackend::open(dsn) {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(e) => tracing::error!(error = %e, "Failed to open database backend"),
        }
    }
    if let Some(path) = &config.store_file {
        backends.push(Arc::new(FileBackend::new(path)));
    }
    Persistence::new(backends)
}

pub fn load_decryptor(config: &ServerConfig) -> Result<Option<RsaDecryptor>> {
    config
        .crypto_key
        .as_ref()
        .map(|path| {
            RsaDecryptor::load(path)
                .with_context(|| format!("Failed to load crypto key '{}'", path.display()))
        })
        .transpose()
}

/// Builds the core service the bindings share.
pub fn build_service(config: &ServerConfig) -> Result<MetricsService> {
    let integrity = Integrity::new(Signer::new(config.key.as_deref()), config.require_hash);
    Ok(MetricsService::new(integrity, build_persistence(config))
        .with_decryptor(load_decryptor(config)?)
        .with_trusted_subnet(config.trusted_subnet)
        .with_sync_write(config.store_interval.is_zero()))
}

/// Loads the persisted snapshot when restore is enabled.
pub fn restore_on_start(service: &MetricsService, config: &ServerConfig) -> usize {
    if !config.restore {
        tracing::info!("Restore disabled, starting with an empty store");
        return 0;
    }
    let restored = service.restore();
    tracing::info!(restored, "Store restored from snapshot");
    restored
}

/// Spawns the periodic backup task. Returns `None` for a zero interval,
/// where every ingestion persists synchronously instead. Writes run on the
/// blocking pool.
pub fn spawn_backup(
    service: Arc<MetricsService>,
    every: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Backup loop stopped");
                    break;
                }
                _ = tick.tick() => {
                    service.flush_blocking().await;
                    tracing::debug!(metrics = service.store().len(), "Periodic backup done");
                }
            }
        }
    }))
}

/// Final flush on shutdown, taken under the store lock.
pub fn shutdown_flush(service: &MetricsService) {
    service.flush();
    tracing::info!(metrics = service.store().len(), "Final snapshot written");
}
