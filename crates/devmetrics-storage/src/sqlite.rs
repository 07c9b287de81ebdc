use crate::error::{Result, StorageError};
use crate::SnapshotBackend;
use devmetrics_common::types::MetricRecord;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const METRICS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    id TEXT NOT NULL,
    mtype TEXT NOT NULL,
    value REAL,
    delta INTEGER,
    hash TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (id, mtype)
);
";

const UPSERT: &str = "
INSERT INTO metrics (id, mtype, value, delta, hash)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT (id, mtype) DO UPDATE SET
    value = excluded.value,
    delta = excluded.delta,
    hash = excluded.hash
";

/// One row per metric name and type, upserted on every write.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens the database named by `dsn`: a file path, optionally prefixed
    /// with `sqlite://`, or `:memory:`.
    pub fn open(dsn: &str) -> Result<Self> {
        let target = dsn.trim();
        let target = target.strip_prefix("sqlite://").unwrap_or(target);
        let conn = if target == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(target)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            Connection::open(target)?
        };
        if target != ":memory:" {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        conn.execute_batch(METRICS_SCHEMA)?;
        tracing::info!(dsn = %target, "SQLite snapshot backend ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write(&self, snapshot: &[MetricRecord]) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for rec in snapshot {
                stmt.execute(params![rec.id, rec.mtype, rec.value, rec.delta, rec.hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read(&self) -> Result<Vec<MetricRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT id, mtype, value, delta, hash FROM metrics")?;
        let rows = stmt.query_map([], |row| {
            Ok(MetricRecord {
                id: row.get(0)?,
                mtype: row.get(1)?,
                value: row.get(2)?,
                delta: row.get(3)?,
                hash: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            let rec = row?;
            if let Err(e) = rec.to_value() {
                return Err(StorageError::CorruptRow {
                    id: rec.id,
                    reason: e.to_string(),
                });
            }
            out.push(rec);
        }
        Ok(out)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
