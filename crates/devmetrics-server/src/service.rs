use crate::store::{Integrity, MetricStore};
use devmetrics_common::codec::{self, EnvelopeHeaders, RsaDecryptor};
use devmetrics_common::error::{MetricError, Result};
use devmetrics_common::types::{MetricRecord, MetricValue};
use devmetrics_storage::Persistence;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;

/// The ingestion and query operations shared by the HTTP and gRPC
/// bindings.
///
/// One instance is built at startup and handed to both bindings; neither
/// binding touches the store directly.
pub struct MetricsService {
    store: MetricStore,
    integrity: Integrity,
    decryptor: Option<Arc<RsaDecryptor>>,
    persistence: Persistence,
    trusted_subnet: Option<IpNetwork>,
    sync_write: bool,
}

impl MetricsService {
    pub fn new(integrity: Integrity, persistence: Persistence) -> Self {
        Self {
            store: MetricStore::new(),
            integrity,
            decryptor: None,
            persistence,
            trusted_subnet: None,
            sync_write: false,
        }
    }

    pub fn with_decryptor(mut self, decryptor: Option<RsaDecryptor>) -> Self {
        self.decryptor = decryptor.map(Arc::new);
        self
    }

    pub fn with_trusted_subnet(mut self, subnet: Option<IpNetwork>) -> Self {
        self.trusted_subnet = subnet;
        self
    }

    /// Persist after every successful ingestion instead of relying on the
    /// periodic backup.
    pub fn with_sync_write(mut self, sync_write: bool) -> Self {
        self.sync_write = sync_write;
        self
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Checks the claimed origin (`X-Real-IP`) against the trusted subnet.
    /// Without a configured subnet every origin is accepted.
    pub fn check_origin(&self, real_ip: Option<&str>) -> Result<()> {
        let Some(subnet) = self.trusted_subnet else {
            return Ok(());
        };
        let claimed = real_ip.map(str::trim).unwrap_or_default();
        match claimed.parse::<IpAddr>() {
            Ok(ip) if subnet.contains(ip) => Ok(()),
            _ => Err(MetricError::IpNotAllowed(claimed.to_string())),
        }
    }

    pub fn update(&self, type_tag: &str, name: &str, value_text: &str) -> Result<MetricValue> {
        self.store.ingest_one(type_tag, name, value_text)
    }

    /// Ingests one enveloped JSON record and returns the stored value as a
    /// signed record.
    pub fn update_json(&self, body: &[u8], headers: &EnvelopeHeaders) -> Result<MetricRecord> {
        let record = codec::decode_record(body, headers, self.decryptor.as_deref())?;
        let value = self.store.ingest_record(&record, &self.integrity)?;
        Ok(value.to_record(&record.id, &self.integrity.signer))
    }

    /// Ingests an enveloped JSON array. Returns the number of distinct
    /// metrics touched.
    pub fn updates_json(&self, body: &[u8], headers: &EnvelopeHeaders) -> Result<usize> {
        let records = codec::decode_batch(body, headers, self.decryptor.as_deref())?;
        let count = self.store.ingest_batch(&records, &self.integrity)?;
        tracing::debug!(records = records.len(), metrics = count, "Batch ingested");
        Ok(count)
    }

    /// Display text of a stored value.
    pub fn value(&self, type_tag: &str, name: &str) -> Result<String> {
        Ok(self.store.get(type_tag, name)?.to_string())
    }

    /// Answers an enveloped `{id, type}` query with the signed record.
    pub fn value_json(&self, body: &[u8], headers: &EnvelopeHeaders) -> Result<MetricRecord> {
        let query = codec::decode_record(body, headers, self.decryptor.as_deref())?;
        let value = self.store.get(&query.mtype, &query.id)?;
        Ok(value.to_record(&query.id, &self.integrity.signer))
    }

    /// Succeeds only when a database backend answers.
    pub fn ping(&self) -> Result<()> {
        if self.persistence.ping() {
            Ok(())
        } else {
            Err(MetricError::Unavailable(
                "no database backend answered".to_string(),
            ))
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.store.list_all()
    }

    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.store.snapshot(&self.integrity.signer)
    }

    /// Loads every readable backend's snapshot into the store.
    pub fn restore(&self) -> usize {
        let records = self.persistence.restore();
        self.store.restore(&records)
    }

    /// Called by the bindings after a successful ingestion. In sync-write
    /// mode the fresh snapshot is written before the response goes out.
    pub async fn persist_after_ingest(self: &Arc<Self>) {
        if self.sync_write {
            self.flush_blocking().await;
        }
    }

    /// [`flush`](Self::flush) on the blocking pool, so file and database
    /// I/O stays off the async workers.
    pub async fn flush_blocking(self: &Arc<Self>) {
        let service = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || service.flush()).await {
            tracing::error!(error = %e, "Snapshot task failed");
        }
    }

    /// Writes the current snapshot to every backend while holding the
    /// store lock.
    pub fn flush(&self) {
        if self.persistence.is_empty() {
            return;
        }
        self.store
            .with_locked_snapshot(&self.integrity.signer, |snapshot| {
                self.persistence.write_all(snapshot)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmetrics_common::error::ErrorKind;
    use devmetrics_common::sign::Signer;
    use devmetrics_storage::file::FileBackend;
    use devmetrics_storage::SnapshotBackend;

    fn plain() -> EnvelopeHeaders {
        EnvelopeHeaders::default()
    }

    #[test]
    fn test_origin_filter() {
        let open = MetricsService::new(Integrity::default(), Persistence::default());
        open.check_origin(None).unwrap();

        let guarded = MetricsService::new(Integrity::default(), Persistence::default())
            .with_trusted_subnet(Some("192.168.1.0/24".parse().unwrap()));
        guarded.check_origin(Some("192.168.1.17")).unwrap();
        for bad in [None, Some(""), Some("10.0.0.1"), Some("not-an-ip")] {
            let err = guarded.check_origin(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IpNotAllowed, "{bad:?}");
        }
    }

    #[test]
    fn test_update_json_echoes_signed_record() {
        let signer = Signer::new(Some("k"));
        let svc = MetricsService::new(Integrity::new(signer.clone(), false), Persistence::default());
        let body = serde_json::to_vec(&MetricValue::Counter(4).to_record("PollCount", &signer)).unwrap();
        svc.update_json(&body, &plain()).unwrap();
        let echoed = svc.update_json(&body, &plain()).unwrap();
        assert_eq!(echoed.delta, Some(8));
        assert!(signer.verify(&echoed));
    }

    #[test]
    fn test_value_json_not_found() {
        let svc = MetricsService::new(Integrity::default(), Persistence::default());
        let err = svc
            .value_json(br#"{"id":"nope","type":"gauge"}"#, &plain())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_ping_without_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file: Arc<dyn SnapshotBackend> = Arc::new(FileBackend::new(dir.path().join("m.json")));
        let svc = MetricsService::new(Integrity::default(), Persistence::new(vec![file]));
        assert_eq!(svc.ping().unwrap_err().kind(), ErrorKind::InternalServer);
    }

    #[tokio::test]
    async fn test_sync_write_persists_each_update() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(FileBackend::new(dir.path().join("m.json")));
        let svc = Arc::new(
            MetricsService::new(
                Integrity::default(),
                Persistence::new(vec![file.clone() as Arc<dyn SnapshotBackend>]),
            )
            .with_sync_write(true),
        );

        svc.update("counter", "PollCount", "3").unwrap();
        svc.persist_after_ingest().await;
        let stored = file.read().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delta, Some(3));

        svc.update("gauge", "Alloc", "1.5").unwrap();
        svc.persist_after_ingest().await;
        assert_eq!(file.read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persist_after_ingest_is_noop_with_interval() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(FileBackend::new(dir.path().join("m.json")));
        let svc = Arc::new(MetricsService::new(
            Integrity::default(),
            Persistence::new(vec![file.clone() as Arc<dyn SnapshotBackend>]),
        ));
        svc.update("counter", "PollCount", "1").unwrap();
        svc.persist_after_ingest().await;
        assert!(!file.path().exists());

        svc.flush_blocking().await;
        assert_eq!(file.read().unwrap().len(), 1);
    }
}
