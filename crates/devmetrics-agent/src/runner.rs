//! The agent's periodic tasks. Each loop stops as soon as the shared
//! cancellation token fires; the final report is sent by the caller.

use crate::reporter::{MetricSet, Reporter};
use devmetrics_collector::Collector;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

fn collect_into(metrics: &MetricSet, collector: &mut dyn Collector) {
    match collector.collect() {
        Ok(samples) => {
            tracing::debug!(collector = collector.name(), count = samples.len(), "Collected samples");
            metrics.record_gauges(samples);
        }
        Err(e) => tracing::warn!(collector = collector.name(), error = %e, "Collection failed"),
    }
}

/// Samples `collector` every `every` and counts each poll.
pub async fn sampling_loop(
    metrics: Arc<MetricSet>,
    mut collector: Box<dyn Collector>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                collect_into(&metrics, collector.as_mut());
                metrics.count_poll();
            }
        }
    }
    tracing::debug!(polls = metrics.poll_count(), "Sampling loop stopped");
}

/// Samples host statistics every `every` without touching the poll count.
pub async fn scan_loop(
    metrics: Arc<MetricSet>,
    mut collector: Box<dyn Collector>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => collect_into(&metrics, collector.as_mut()),
        }
    }
    tracing::debug!(collector = collector.name(), "Scan loop stopped");
}

/// Sends a report every `every`. The first report goes out one interval
/// after start.
pub async fn report_loop(
    metrics: Arc<MetricSet>,
    reporter: Arc<Reporter>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let summary = reporter.report(&metrics).await;
                if summary.failed > 0 {
                    tracing::warn!(failed = summary.failed, chunks = summary.chunks, "Report cycle incomplete");
                }
            }
        }
    }
    tracing::debug!("Report loop stopped");
}
