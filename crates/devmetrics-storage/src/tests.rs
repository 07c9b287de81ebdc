use crate::file::FileBackend;
use crate::sqlite::SqliteBackend;
use crate::{Persistence, SnapshotBackend, StorageError};
use devmetrics_common::sign::Signer;
use devmetrics_common::types::{MetricRecord, MetricValue};
use std::sync::Arc;
use tempfile::TempDir;

fn setup_file() -> (TempDir, FileBackend) {
    let dir = TempDir::new().unwrap();
    let backend = FileBackend::new(dir.path().join("nested").join("metrics.json"));
    (dir, backend)
}

fn setup_sqlite() -> (TempDir, SqliteBackend) {
    let dir = TempDir::new().unwrap();
    let dsn = format!("sqlite://{}", dir.path().join("metrics.db").display());
    let backend = SqliteBackend::open(&dsn).unwrap();
    (dir, backend)
}

fn snapshot(values: &[(&str, MetricValue)]) -> Vec<MetricRecord> {
    let signer = Signer::new(Some("k"));
    values
        .iter()
        .map(|(name, v)| v.to_record(name, &signer))
        .collect()
}

fn sorted(mut records: Vec<MetricRecord>) -> Vec<MetricRecord> {
    records.sort_by(|a, b| (&a.id, &a.mtype).cmp(&(&b.id, &b.mtype)));
    records
}

#[test]
fn file_write_then_read() {
    let (_dir, backend) = setup_file();
    let snap = snapshot(&[
        ("Alloc", MetricValue::Gauge(12.5)),
        ("PollCount", MetricValue::Counter(42)),
    ]);
    backend.write(&snap).unwrap();
    assert_eq!(sorted(backend.read().unwrap()), sorted(snap));
}

#[test]
fn file_write_overwrites_wholesale() {
    let (_dir, backend) = setup_file();
    backend
        .write(&snapshot(&[("Old", MetricValue::Gauge(1.0))]))
        .unwrap();
    let newer = snapshot(&[("New", MetricValue::Counter(2))]);
    backend.write(&newer).unwrap();
    assert_eq!(backend.read().unwrap(), newer);

    let raw = std::fs::read_to_string(backend.path()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(parsed.is_array());
}

#[test]
fn file_missing_reads_empty_and_ping_unsupported() {
    let (_dir, backend) = setup_file();
    assert!(backend.read().unwrap().is_empty());
    assert!(matches!(
        backend.ping(),
        Err(StorageError::PingUnsupported { backend: "file" })
    ));
}

#[test]
fn file_corrupt_content_is_error() {
    let (_dir, backend) = setup_file();
    std::fs::create_dir_all(backend.path().parent().unwrap()).unwrap();
    std::fs::write(backend.path(), "{not json").unwrap();
    assert!(matches!(backend.read(), Err(StorageError::Json(_))));
}

#[test]
fn sqlite_upserts_per_metric() {
    let (_dir, backend) = setup_sqlite();
    backend
        .write(&snapshot(&[
            ("Alloc", MetricValue::Gauge(1.0)),
            ("PollCount", MetricValue::Counter(5)),
        ]))
        .unwrap();
    backend
        .write(&snapshot(&[("PollCount", MetricValue::Counter(9))]))
        .unwrap();

    let expected = snapshot(&[
        ("Alloc", MetricValue::Gauge(1.0)),
        ("PollCount", MetricValue::Counter(9)),
    ]);
    assert_eq!(sorted(backend.read().unwrap()), sorted(expected));
}

#[test]
fn sqlite_same_name_different_type_are_distinct_rows() {
    let backend = SqliteBackend::open(":memory:").unwrap();
    backend
        .write(&snapshot(&[
            ("Dual", MetricValue::Gauge(1.0)),
            ("Dual", MetricValue::Counter(1)),
        ]))
        .unwrap();
    assert_eq!(backend.read().unwrap().len(), 2);
}

#[test]
fn sqlite_ping_answers() {
    let (_dir, backend) = setup_sqlite();
    backend.ping().unwrap();
}

#[test]
fn sqlite_reopen_keeps_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("m.db");
    let dsn = path.display().to_string();
    SqliteBackend::open(&dsn)
        .unwrap()
        .write(&snapshot(&[("Alloc", MetricValue::Gauge(3.25))]))
        .unwrap();
    let reopened = SqliteBackend::open(&dsn).unwrap();
    let rows = reopened.read().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, Some(3.25));
}

struct FailingBackend;

impl SnapshotBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn write(&self, _snapshot: &[MetricRecord]) -> crate::Result<()> {
        Err(StorageError::PingUnsupported { backend: "failing" })
    }

    fn read(&self) -> crate::Result<Vec<MetricRecord>> {
        Err(StorageError::PingUnsupported { backend: "failing" })
    }
}

#[test]
fn gateway_skips_failing_backends() {
    let (_dir, file) = setup_file();
    let file = Arc::new(file);
    let gateway = Persistence::new(vec![Arc::new(FailingBackend), file.clone()]);

    let snap = snapshot(&[("Alloc", MetricValue::Gauge(7.0))]);
    gateway.write_all(&snap);
    assert_eq!(file.read().unwrap(), snap);
    assert_eq!(gateway.restore(), snap);
    assert!(!gateway.ping());
}

#[test]
fn gateway_ping_needs_a_database() {
    assert!(!Persistence::default().ping());

    let (_fdir, file) = setup_file();
    let (_sdir, sqlite) = setup_sqlite();
    let gateway = Persistence::new(vec![Arc::new(file), Arc::new(sqlite)]);
    assert!(gateway.ping());
    assert_eq!(gateway.backend_names(), vec!["file", "sqlite"]);
}
