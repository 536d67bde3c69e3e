//! Archival metrics.
//!
//! Emission is best-effort: registration problems are logged and the
//! collectors keep working unregistered, and no method here returns an error.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Collectors for the export/upload/drop cycle of one or more queues.
#[derive(Debug, Clone)]
pub struct ArchivalMetrics {
    backup_failed: IntCounterVec,
    table_dump: HistogramVec,
    file_upload: HistogramVec,
    total_dump: HistogramVec,
    pre_drop_datasets: IntGaugeVec,
}

impl ArchivalMetrics {
    /// Build the collectors and register them on `registry`.
    pub fn register(registry: &Registry) -> Self {
        let metrics = Self::unregistered();
        let collectors: [Box<dyn prometheus::core::Collector>; 5] = [
            Box::new(metrics.backup_failed.clone()),
            Box::new(metrics.table_dump.clone()),
            Box::new(metrics.file_upload.clone()),
            Box::new(metrics.total_dump.clone()),
            Box::new(metrics.pre_drop_datasets.clone()),
        ];
        for collector in collectors {
            if let Err(err) = registry.register(collector) {
                ::tracing::warn!(error = %err, "failed to register archival collector");
            }
        }
        metrics
    }

    /// Collectors that are not attached to any registry.
    pub fn unregistered() -> Self {
        Self {
            backup_failed: IntCounterVec::new(
                Opts::new("backup_ds_failed", "Failed dataset archival attempts"),
                &["queue", "provider"],
            )
            .expect("static counter options are valid"),
            table_dump: HistogramVec::new(
                HistogramOpts::new(
                    "table_dump_duration_seconds",
                    "Time spent exporting one table to a local artifact",
                ),
                &["queue"],
            )
            .expect("static histogram options are valid"),
            file_upload: HistogramVec::new(
                HistogramOpts::new(
                    "file_upload_duration_seconds",
                    "Time spent uploading one artifact, retries included",
                ),
                &["queue"],
            )
            .expect("static histogram options are valid"),
            total_dump: HistogramVec::new(
                HistogramOpts::new(
                    "total_table_dump_duration_seconds",
                    "Export plus upload time for one artifact",
                ),
                &["queue"],
            )
            .expect("static histogram options are valid"),
            pre_drop_datasets: IntGaugeVec::new(
                Opts::new(
                    "pre_drop_datasets",
                    "Non-current datasets waiting for archival",
                ),
                &["queue"],
            )
            .expect("static gauge options are valid"),
        }
    }

    pub fn backup_failed(&self, queue: &str, provider: &str) {
        if let Ok(counter) = self
            .backup_failed
            .get_metric_with_label_values(&[queue, provider])
        {
            counter.inc();
        }
    }

    pub fn observe_table_dump(&self, queue: &str, elapsed: Duration) {
        observe(&self.table_dump, queue, elapsed);
    }

    pub fn observe_file_upload(&self, queue: &str, elapsed: Duration) {
        observe(&self.file_upload, queue, elapsed);
    }

    pub fn observe_total_dump(&self, queue: &str, elapsed: Duration) {
        observe(&self.total_dump, queue, elapsed);
    }

    pub fn set_pre_drop_datasets(&self, queue: &str, count: usize) {
        if let Ok(gauge) = self.pre_drop_datasets.get_metric_with_label_values(&[queue]) {
            gauge.set(count as i64);
        }
    }

    /// Current failure count for a `(queue, provider)` pair.
    pub fn backup_failures(&self, queue: &str, provider: &str) -> u64 {
        self.backup_failed
            .get_metric_with_label_values(&[queue, provider])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    /// Number of upload observations recorded for `queue`.
    pub fn upload_samples(&self, queue: &str) -> u64 {
        self.file_upload
            .get_metric_with_label_values(&[queue])
            .map(|h| h.get_sample_count())
            .unwrap_or(0)
    }
}

impl Default for ArchivalMetrics {
    fn default() -> Self {
        Self::unregistered()
    }
}

fn observe(histogram: &HistogramVec, queue: &str, elapsed: Duration) {
    if let Ok(h) = histogram.get_metric_with_label_values(&[queue]) {
        h.observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_tagged_by_queue_and_provider() {
        let metrics = ArchivalMetrics::unregistered();
        metrics.backup_failed("rt", "S3");
        metrics.backup_failed("rt", "S3");
        metrics.backup_failed("batch_rt", "GCS");

        assert_eq!(metrics.backup_failures("rt", "S3"), 2);
        assert_eq!(metrics.backup_failures("batch_rt", "GCS"), 1);
        assert_eq!(metrics.backup_failures("rt", "GCS"), 0);
    }

    #[test]
    fn registering_twice_does_not_panic() {
        let registry = Registry::new();
        let first = ArchivalMetrics::register(&registry);
        let second = ArchivalMetrics::register(&registry);

        first.observe_file_upload("rt", Duration::from_millis(5));
        second.observe_file_upload("rt", Duration::from_millis(5));

        assert_eq!(first.upload_samples("rt"), 1);
        assert!(!registry.gather().is_empty());
    }
}
