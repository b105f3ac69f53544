//! Metric registration for the client.
//!
//! Per-service instruments carry a `service` attribute; the handful of
//! globals (retry queue, failover, refresher health) have no attributes.

use metric::{Attributes, DurationCounter, Metric, U64Counter, U64Gauge};

/// Data points accepted into a write queue.
pub(crate) const ENQUEUED: &str = "stratus_client_enqueued";
/// Data points rejected because a write queue was full.
pub(crate) const ENQUEUE_DROPPED: &str = "stratus_client_enqueue_dropped";
/// Data points delivered to the service.
pub(crate) const PUT: &str = "stratus_client_put";
/// Data points permanently dropped on the write path.
pub(crate) const PUT_DROPPED: &str = "stratus_client_put_dropped";
/// Data points handed to the retry queue.
pub(crate) const PUT_RETRY: &str = "stratus_client_put_retry";
/// Accumulated time spent in `perform_put`, for a per-put average.
pub(crate) const PUT_DURATION: &str = "stratus_client_put_duration";
/// Data points currently buffered in a write queue.
pub(crate) const QUEUE_SIZE: &str = "stratus_client_queue_size";
/// Data points currently held by the retry queue.
pub(crate) const RETRY_QUEUE_SIZE: &str = "stratus_client_retry_queue_size";
/// Batches that could not be handed to the retry queue.
pub(crate) const RETRY_QUEUE_WRITE_FAILURES: &str = "stratus_client_retry_queue_write_failures";
/// Reads that moved on to another service.
pub(crate) const READ_FAILOVER: &str = "stratus_client_read_failover";
/// Directory entries that failed read-service validation or connection.
pub(crate) const BAD_READ_SERVICES: &str = "stratus_client_bad_read_services";
/// Keys redirected to another service because of recorded data gaps.
pub(crate) const REDIRECT_FOR_MISSING_DATA: &str = "stratus_client_redirect_for_missing_data";

/// Every instrument the client records, registered once at construction.
#[derive(Debug, Clone)]
pub(crate) struct ClientMetrics {
    pub enqueued: Metric<U64Counter>,
    pub enqueue_dropped: Metric<U64Counter>,
    pub put: Metric<U64Counter>,
    pub put_dropped: Metric<U64Counter>,
    pub put_retry: Metric<U64Counter>,
    pub put_duration: Metric<DurationCounter>,
    pub queue_size: Metric<U64Gauge>,
    pub retry_queue_size: U64Gauge,
    pub retry_queue_write_failures: U64Counter,
    pub read_failover: U64Counter,
    pub bad_read_services: U64Counter,
    pub redirect_for_missing_data: U64Counter,
}

impl ClientMetrics {
    pub(crate) fn new(registry: &metric::Registry) -> Self {
        Self {
            enqueued: registry.register_metric(ENQUEUED, "data points accepted into a write queue"),
            enqueue_dropped: registry
                .register_metric(ENQUEUE_DROPPED, "data points rejected by a full write queue"),
            put: registry.register_metric(PUT, "data points delivered to the service"),
            put_dropped: registry
                .register_metric(PUT_DROPPED, "data points permanently dropped on the write path"),
            put_retry: registry
                .register_metric(PUT_RETRY, "data points handed to the retry queue"),
            put_duration: registry
                .register_metric(PUT_DURATION, "accumulated time spent sending put requests"),
            queue_size: registry
                .register_metric(QUEUE_SIZE, "data points buffered in a write queue"),
            retry_queue_size: registry
                .register_metric::<U64Gauge>(
                    RETRY_QUEUE_SIZE,
                    "data points held by the retry queue",
                )
                .recorder(Attributes::default()),
            retry_queue_write_failures: registry
                .register_metric::<U64Counter>(
                    RETRY_QUEUE_WRITE_FAILURES,
                    "batches the retry queue could not absorb",
                )
                .recorder(Attributes::default()),
            read_failover: registry
                .register_metric::<U64Counter>(
                    READ_FAILOVER,
                    "reads that moved on to another service",
                )
                .recorder(Attributes::default()),
            bad_read_services: registry
                .register_metric::<U64Counter>(
                    BAD_READ_SERVICES,
                    "directory entries that failed read-service validation",
                )
                .recorder(Attributes::default()),
            redirect_for_missing_data: registry
                .register_metric::<U64Counter>(
                    REDIRECT_FOR_MISSING_DATA,
                    "keys redirected to another service due to data gaps",
                )
                .recorder(Attributes::default()),
        }
    }
}

/// The per-service recorders one write client records through, resolved once
/// at construction to amortize attribute lookups.
#[derive(Debug, Clone)]
pub(crate) struct ServiceMetrics {
    pub enqueued: U64Counter,
    pub enqueue_dropped: U64Counter,
    pub put: U64Counter,
    pub put_dropped: U64Counter,
    pub put_retry: U64Counter,
    pub put_duration: DurationCounter,
    pub queue_size: U64Gauge,
}

impl ServiceMetrics {
    pub(crate) fn new(metrics: &ClientMetrics, service: &str) -> Self {
        let attributes = [("service", service.to_string())];
        Self {
            enqueued: metrics.enqueued.recorder(attributes.clone()),
            enqueue_dropped: metrics.enqueue_dropped.recorder(attributes.clone()),
            put: metrics.put.recorder(attributes.clone()),
            put_dropped: metrics.put_dropped.recorder(attributes.clone()),
            put_retry: metrics.put_retry.recorder(attributes.clone()),
            put_duration: metrics.put_duration.recorder(attributes.clone()),
            queue_size: metrics.queue_size.recorder(attributes),
        }
    }
}
