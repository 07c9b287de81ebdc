use crate::error::{Result, StorageError};
use crate::SnapshotBackend;
use devmetrics_common::types::MetricRecord;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Keeps the snapshot as a JSON array in a single file, overwritten whole
/// on every write.
pub struct FileBackend {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, snapshot: &[MetricRecord]) -> Result<()> {
        let data = serde_json::to_vec(snapshot)?;
        let _guard = self.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        // Write next to the target, then rename, so readers never see a
        // half-written array.
        let tmp = self.temp_path();
        std::fs::write(&tmp, &data).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        tracing::debug!(path = %self.path.display(), count = snapshot.len(), "Snapshot written");
        Ok(())
    }

    fn read(&self) -> Result<Vec<MetricRecord>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }
}
