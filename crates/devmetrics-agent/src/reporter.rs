use crate::transport::Transport;
use devmetrics_collector::GaugeSample;
use devmetrics_common::codec::{self, RsaEncryptor};
use devmetrics_common::sign::Signer;
use devmetrics_common::types::{MetricRecord, MetricValue};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Records per outgoing chunk.
pub const BATCH_SIZE: usize = 10;

pub const POLL_COUNT: &str = "PollCount";

#[derive(Debug, Default)]
struct Readings {
    gauges: BTreeMap<String, f64>,
    /// Polls since start.
    poll_count: i64,
    /// Part of `poll_count` the server has acknowledged.
    reported: i64,
}

/// Latest gauge readings plus the poll counter, shared by the sampling
/// loops and the reporter.
#[derive(Debug, Default)]
pub struct MetricSet {
    readings: Mutex<Readings>,
}

/// A point-in-time copy of the metric set, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub gauges: Vec<(String, f64)>,
    /// Polls not yet acknowledged by the server.
    pub poll_delta: i64,
    watermark: i64,
}

impl Snapshot {
    /// Every value as a record: gauges first, `PollCount` last.
    pub fn records(&self, signer: &Signer) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .gauges
            .iter()
            .map(|(name, v)| MetricValue::Gauge(*v).to_record(name, signer))
            .collect();
        records.push(MetricValue::Counter(self.poll_delta).to_record(POLL_COUNT, signer));
        records
    }
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_readings(&self) -> MutexGuard<'_, Readings> {
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores finite samples, replacing earlier readings of the same name.
    pub fn record_gauges(&self, samples: impl IntoIterator<Item = GaugeSample>) {
        let mut readings = self.lock_readings();
        for sample in samples {
            if sample.value.is_finite() {
                readings.gauges.insert(sample.name, sample.value);
            } else {
                tracing::debug!(name = %sample.name, "Dropping non-finite sample");
            }
        }
    }

    /// Counts one poll and returns the running total.
    pub fn count_poll(&self) -> i64 {
        let mut readings = self.lock_readings();
        readings.poll_count = readings.poll_count.saturating_add(1);
        readings.poll_count
    }

    pub fn poll_count(&self) -> i64 {
        self.lock_readings().poll_count
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.lock_readings().gauges.get(name).copied()
    }

    pub fn snapshot(&self) -> Snapshot {
        let readings = self.lock_readings();
        Snapshot {
            gauges: readings
                .gauges
                .iter()
                .map(|(name, v)| (name.clone(), *v))
                .collect(),
            poll_delta: readings.poll_count - readings.reported,
            watermark: readings.poll_count,
        }
    }

    /// Marks the polls covered by `snapshot` as delivered.
    pub fn acknowledge(&self, snapshot: &Snapshot) {
        let mut readings = self.lock_readings();
        readings.reported = readings.reported.max(snapshot.watermark);
    }
}

/// Outcome of one report cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReportSummary {
    pub chunks: usize,
    pub failed: usize,
    pub records: usize,
}

/// Signs, encodes and sends snapshots of a [`MetricSet`].
pub struct Reporter {
    signer: Signer,
    encryptor: Option<RsaEncryptor>,
    transport: Box<dyn Transport>,
}

impl Reporter {
    pub fn new(signer: Signer, encryptor: Option<RsaEncryptor>, transport: Box<dyn Transport>) -> Self {
        Self {
            signer,
            encryptor,
            transport,
        }
    }

    /// Sends the current snapshot in chunks of [`BATCH_SIZE`].
    ///
    /// Chunks are independent: a failed chunk is logged and the rest are
    /// still sent. The poll counter is acknowledged only when the chunk
    /// carrying it is accepted, so the next cycle resends the missed polls.
    pub async fn report(&self, metrics: &MetricSet) -> ReportSummary {
        let snapshot = metrics.snapshot();
        let records = snapshot.records(&self.signer);
        let mut summary = ReportSummary {
            records: records.len(),
            ..Default::default()
        };
        let chunk_count = records.len().div_ceil(BATCH_SIZE);

        for (index, chunk) in records.chunks(BATCH_SIZE).enumerate() {
            summary.chunks += 1;
            let carries_poll_count = index + 1 == chunk_count;
            let sent = match codec::encode_batch(chunk, self.encryptor.as_ref()) {
                Ok(envelope) => self.transport.send(&envelope).await,
                Err(e) => Err(anyhow::Error::new(e)),
            };
            match sent {
                Ok(()) => {
                    if carries_poll_count {
                        metrics.acknowledge(&snapshot);
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        transport = self.transport.name(),
                        chunk = index,
                        records = chunk.len(),
                        error = %e,
                        "Failed to send metrics chunk"
                    );
                }
            }
        }

        tracing::debug!(
            chunks = summary.chunks,
            failed = summary.failed,
            records = summary.records,
            poll_delta = snapshot.poll_delta,
            "Report cycle done"
        );
        summary
    }
}
