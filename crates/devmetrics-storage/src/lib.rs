//! Snapshot persistence for the metric store.
//!
//! A [`SnapshotBackend`] writes and reads whole snapshots (every metric the
//! server currently holds). Two backends ship here: [`file::FileBackend`]
//! keeps a JSON array on disk and [`sqlite::SqliteBackend`] keeps one row per
//! metric. [`Persistence`] fans out over whichever are configured.

pub mod error;
pub mod file;
pub mod gateway;
pub mod sqlite;

#[cfg(test)]
mod tests;

pub use error::{Result, StorageError};
pub use gateway::Persistence;

use devmetrics_common::types::MetricRecord;

/// Durable home for store snapshots.
///
/// Implementations must be `Send + Sync`: the periodic backup task, the
/// shutdown flush and the synchronous write path can all call [`write`]
/// concurrently, and each backend serializes access internally.
///
/// # Examples
///
/// ```no_run
/// use devmetrics_storage::SnapshotBackend;
/// use devmetrics_storage::file::FileBackend;
///
/// let backend = FileBackend::new("/tmp/devops-metrics-db.json");
/// backend.write(&[]).unwrap();
/// assert!(backend.read().unwrap().is_empty());
/// assert!(backend.ping().is_err());
/// ```
///
/// [`write`]: SnapshotBackend::write
pub trait SnapshotBackend: Send + Sync {
    /// Short backend name for logging (`"file"`, `"sqlite"`).
    fn name(&self) -> &'static str;

    /// Persists `snapshot`, replacing what the backend held for those metrics.
    fn write(&self, snapshot: &[MetricRecord]) -> Result<()>;

    /// Reads back the last persisted snapshot.
    fn read(&self) -> Result<Vec<MetricRecord>>;

    /// Liveness check. Backends without a connection to check return
    /// [`StorageError::PingUnsupported`].
    fn ping(&self) -> Result<()> {
        Err(StorageError::PingUnsupported {
            backend: self.name(),
        })
    }
}
