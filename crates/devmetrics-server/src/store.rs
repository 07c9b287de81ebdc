use devmetrics_common::error::{MetricError, Result};
use devmetrics_common::sign::Signer;
use devmetrics_common::types::{MetricKind, MetricRecord, MetricValue};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// How strictly incoming record hashes are checked.
#[derive(Debug, Clone, Default)]
pub struct Integrity {
    pub signer: Signer,
    /// Reject records with an empty hash instead of letting them through.
    pub require_hash: bool,
}

impl Integrity {
    pub fn new(signer: Signer, require_hash: bool) -> Self {
        Self {
            signer,
            require_hash,
        }
    }

    /// Without a configured key there is no shared secret to check against,
    /// so only the empty-hash policy applies.
    pub fn check(&self, record: &MetricRecord) -> Result<()> {
        if record.hash.is_empty() {
            if self.require_hash {
                return Err(MetricError::MissingHash {
                    id: record.id.clone(),
                });
            }
            return Ok(());
        }
        if self.signer.is_keyed() && !self.signer.verify(record) {
            return Err(MetricError::HashMismatch {
                id: record.id.clone(),
            });
        }
        Ok(())
    }
}

/// Latest value of every metric, keyed by name.
///
/// All access goes through one lock; a name stays bound to the kind it was
/// first ingested with.
#[derive(Debug, Default)]
pub struct MetricStore {
    metrics: Mutex<HashMap<String, MetricValue>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the metric map, recovering from a poisoned Mutex if necessary.
    fn lock_metrics(&self) -> MutexGuard<'_, HashMap<String, MetricValue>> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn merge_into(
        map: &HashMap<String, MetricValue>,
        name: &str,
        incoming: MetricValue,
    ) -> Result<MetricValue> {
        match map.get(name) {
            None => Ok(incoming),
            Some(current) => current
                .merge(incoming)
                .ok_or_else(|| MetricError::TypeConflict {
                    id: name.to_string(),
                    stored: current.type_tag(),
                    incoming: incoming.type_tag(),
                }),
        }
    }

    /// Parses and merges a single value given as text. Returns the value
    /// stored after the merge.
    pub fn ingest_one(&self, type_tag: &str, name: &str, value_text: &str) -> Result<MetricValue> {
        let incoming = MetricValue::parse(type_tag, value_text)?;
        self.ingest_value(name, incoming)
    }

    pub fn ingest_value(&self, name: &str, incoming: MetricValue) -> Result<MetricValue> {
        let mut metrics = self.lock_metrics();
        let merged = Self::merge_into(&metrics, name, incoming)?;
        metrics.insert(name.to_string(), merged);
        Ok(merged)
    }

    /// Verifies and merges one JSON record.
    pub fn ingest_record(&self, record: &MetricRecord, integrity: &Integrity) -> Result<MetricValue> {
        let incoming = record.to_value()?;
        integrity.check(record)?;
        self.ingest_value(&record.id, incoming)
    }

    /// Verifies every record, then merges them all.
    ///
    /// The batch is applied atomically: any invalid record, bad hash or type
    /// conflict (also against earlier records of the same batch) rejects the
    /// whole batch and leaves the store untouched.
    pub fn ingest_batch(&self, records: &[MetricRecord], integrity: &Integrity) -> Result<usize> {
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let value = record.to_value()?;
            integrity.check(record)?;
            values.push((record.id.as_str(), value));
        }

        let mut metrics = self.lock_metrics();
        let mut staged: HashMap<String, MetricValue> = HashMap::new();
        for (name, incoming) in values {
            let merged = match staged.get(name) {
                Some(_) => Self::merge_into(&staged, name, incoming)?,
                None => Self::merge_into(&metrics, name, incoming)?,
            };
            staged.insert(name.to_string(), merged);
        }
        let count = staged.len();
        metrics.extend(staged);
        Ok(count)
    }

    /// Looks up `name` as a metric of kind `type_tag`.
    pub fn get(&self, type_tag: &str, name: &str) -> Result<MetricValue> {
        let not_found = || MetricError::NotFound {
            id: name.to_string(),
            kind: type_tag.to_string(),
        };
        let kind: MetricKind = type_tag.parse().map_err(|_| not_found())?;
        let metrics = self.lock_metrics();
        match metrics.get(name) {
            Some(value) if value.kind() == kind => Ok(*value),
            _ => Err(not_found()),
        }
    }

    /// `"name = value"` lines in no particular order.
    pub fn list_all(&self) -> Vec<String> {
        self.lock_metrics()
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_metrics().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(metrics: &HashMap<String, MetricValue>, signer: &Signer) -> Vec<MetricRecord> {
        metrics
            .iter()
            .map(|(name, value)| value.to_record(name, signer))
            .collect()
    }

    /// Every metric as a freshly signed record.
    pub fn snapshot(&self, signer: &Signer) -> Vec<MetricRecord> {
        Self::records(&self.lock_metrics(), signer)
    }

    /// Runs `persist` on a snapshot while still holding the store lock, so
    /// no ingestion can slip in between the snapshot and the write.
    pub fn with_locked_snapshot<F>(&self, signer: &Signer, persist: F)
    where
        F: FnOnce(&[MetricRecord]),
    {
        let metrics = self.lock_metrics();
        let snapshot = Self::records(&metrics, signer);
        persist(&snapshot);
    }

    /// Replaces the store content with `records`.
    ///
    /// Records that no longer parse are skipped. When several backends
    /// return the same name, the later record wins. Returns the number of
    /// metrics loaded.
    pub fn restore(&self, records: &[MetricRecord]) -> usize {
        let mut restored = HashMap::with_capacity(records.len());
        for record in records {
            match record.to_value() {
                Ok(value) => {
                    restored.insert(record.id.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "Skipping unreadable snapshot record")
                }
            }
        }
        let count = restored.len();
        *self.lock_metrics() = restored;
        count
    }
}
