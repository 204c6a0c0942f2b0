//! Metrics collection for StyleFlow
//!
//! This module provides Prometheus metrics for observability. Batch
//! failures are visible here (and in the logs) rather than in the dispatch
//! loop's control flow.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for StyleFlow
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub pipeline: PipelineMetrics,
    pub scheduler: SchedulerMetrics,
    pub worker: WorkerMetrics,
}

/// Dispatch-loop metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Files returned by discovery
    pub files_discovered_total: IntCounter,

    /// Batches handed to the execution backend
    pub batches_submitted_total: IntCounter,

    /// Batches that completed successfully
    pub batches_completed_total: IntCounter,

    /// Batches that completed with an error
    pub batches_failed_total: IntCounter,

    /// Submissions currently in flight
    pub outstanding_batches: IntGauge,
}

/// Scheduler-side metrics
#[derive(Clone)]
pub struct SchedulerMetrics {
    /// Workers currently registered
    pub workers_connected: IntGauge,

    /// Workers that acknowledged retirement
    pub workers_retired_total: IntCounter,

    /// Model broadcasts performed
    pub broadcasts_total: IntCounter,

    /// Submissions failed because their worker disconnected
    pub worker_lost_batches_total: IntCounter,
}

/// Worker-side metrics
#[derive(Clone)]
pub struct WorkerMetrics {
    /// Images written to the output location
    pub images_processed_total: IntCounter,

    /// Inputs that failed to decode
    pub decode_failures_total: IntCounter,

    /// End-to-end batch processing duration
    pub batch_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Pipeline metrics
        let files_discovered_total = IntCounter::new(
            "pipeline_files_discovered_total",
            "Total number of files returned by discovery",
        )
        .unwrap();

        let batches_submitted_total = IntCounter::new(
            "pipeline_batches_submitted_total",
            "Total number of batches submitted to the backend",
        )
        .unwrap();

        let batches_completed_total = IntCounter::new(
            "pipeline_batches_completed_total",
            "Total number of batches that completed successfully",
        )
        .unwrap();

        let batches_failed_total = IntCounter::new(
            "pipeline_batches_failed_total",
            "Total number of batches that completed with an error",
        )
        .unwrap();

        let outstanding_batches = IntGauge::new(
            "pipeline_outstanding_batches",
            "Current number of in-flight batch submissions",
        )
        .unwrap();

        // Scheduler metrics
        let workers_connected = IntGauge::new(
            "scheduler_workers_connected",
            "Current number of registered workers",
        )
        .unwrap();

        let workers_retired_total = IntCounter::new(
            "scheduler_workers_retired_total",
            "Total number of workers that acknowledged retirement",
        )
        .unwrap();

        let broadcasts_total = IntCounter::new(
            "scheduler_broadcasts_total",
            "Total number of model broadcasts",
        )
        .unwrap();

        let worker_lost_batches_total = IntCounter::new(
            "scheduler_worker_lost_batches_total",
            "Total submissions failed because their worker disconnected",
        )
        .unwrap();

        // Worker metrics
        let images_processed_total = IntCounter::new(
            "worker_images_processed_total",
            "Total number of images written to the output location",
        )
        .unwrap();

        let decode_failures_total = IntCounter::new(
            "worker_decode_failures_total",
            "Total number of inputs that failed to decode",
        )
        .unwrap();

        let batch_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_batch_duration_seconds",
                "End-to-end batch processing duration in seconds",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(files_discovered_total.clone())).unwrap();
        registry.register(Box::new(batches_submitted_total.clone())).unwrap();
        registry.register(Box::new(batches_completed_total.clone())).unwrap();
        registry.register(Box::new(batches_failed_total.clone())).unwrap();
        registry.register(Box::new(outstanding_batches.clone())).unwrap();

        registry.register(Box::new(workers_connected.clone())).unwrap();
        registry.register(Box::new(workers_retired_total.clone())).unwrap();
        registry.register(Box::new(broadcasts_total.clone())).unwrap();
        registry.register(Box::new(worker_lost_batches_total.clone())).unwrap();

        registry.register(Box::new(images_processed_total.clone())).unwrap();
        registry.register(Box::new(decode_failures_total.clone())).unwrap();
        registry.register(Box::new(batch_duration.clone())).unwrap();

        let pipeline = PipelineMetrics {
            files_discovered_total,
            batches_submitted_total,
            batches_completed_total,
            batches_failed_total,
            outstanding_batches,
        };

        let scheduler = SchedulerMetrics {
            workers_connected,
            workers_retired_total,
            broadcasts_total,
            worker_lost_batches_total,
        };

        let worker = WorkerMetrics {
            images_processed_total,
            decode_failures_total,
            batch_duration,
        };

        MetricsRegistry {
            registry,
            pipeline,
            scheduler,
            worker,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
