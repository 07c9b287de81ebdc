use crate::SnapshotBackend;
use devmetrics_common::types::MetricRecord;
use std::sync::Arc;

/// Fans snapshot writes out to every configured backend.
///
/// Durability is best effort: a failing backend is logged and skipped, and
/// the caller never sees the error.
#[derive(Clone, Default)]
pub struct Persistence {
    backends: Vec<Arc<dyn SnapshotBackend>>,
}

impl Persistence {
    pub fn new(backends: Vec<Arc<dyn SnapshotBackend>>) -> Self {
        Self { backends }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Writes `snapshot` to every backend, logging failures.
    pub fn write_all(&self, snapshot: &[MetricRecord]) {
        for backend in &self.backends {
            match backend.write(snapshot) {
                Ok(()) => {
                    tracing::debug!(backend = backend.name(), count = snapshot.len(), "Snapshot persisted")
                }
                Err(e) => {
                    tracing::error!(backend = backend.name(), error = %e, "Failed to persist snapshot")
                }
            }
        }
    }

    /// Collects every readable backend's snapshot. Unreadable backends are
    /// logged and contribute nothing.
    pub fn restore(&self) -> Vec<MetricRecord> {
        let mut out = Vec::new();
        for backend in &self.backends {
            match backend.read() {
                Ok(records) => {
                    tracing::info!(backend = backend.name(), count = records.len(), "Snapshot read");
                    out.extend(records);
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "Failed to read snapshot, skipping backend")
                }
            }
        }
        out
    }

    /// True when some backend answers its liveness check.
    pub fn ping(&self) -> bool {
        self.backends.iter().any(|b| match b.ping() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(backend = b.name(), error = %e, "Ping failed");
                false
            }
        })
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("backends", &self.backend_names())
            .finish()
    }
}
