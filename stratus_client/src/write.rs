//! The write pipeline: one buffered client per write service, drained by
//! long-lived worker tasks.
//!
//! Workers batch queued points into per-host put requests, transmit them, and
//! hand any dropped points to the retry pipeline. A worker only ever exits on
//! its queue's shutdown sentinel; every other failure is logged and the loop
//! continues.

use std::sync::Arc;

use data_types::DataPoint;
use tracing::warn;

use crate::config::ClientConfig;
use crate::metrics::{ClientMetrics, ServiceMetrics};
use crate::network::{NetworkClient, PutRequestMap};
use crate::queue::PointBatchQueue;
use crate::retry::RetryState;

/// A drain also stops once this many points were locally dropped, bounding
/// the retry batch a single loop iteration can produce.
pub(crate) const MAX_RETRY_BATCH_SIZE: usize = 10_000;

/// One write service's buffered client: the network handle, its bounded
/// queue, and the per-service recorders.
#[derive(Debug)]
pub(crate) struct WriteClient {
    pub(crate) client: Arc<dyn NetworkClient>,
    pub(crate) queue: PointBatchQueue,
    pub(crate) metrics: ServiceMetrics,
}

impl WriteClient {
    pub(crate) fn new(
        client: Arc<dyn NetworkClient>,
        queue_capacity: usize,
        size_ratio: usize,
        metrics: &ClientMetrics,
    ) -> Self {
        let service_metrics = ServiceMetrics::new(metrics, client.service_name());
        Self {
            client,
            queue: PointBatchQueue::new(queue_capacity, size_ratio),
            metrics: service_metrics,
        }
    }
}

/// One write worker; `writer_threads_per_service` of these share each queue.
pub(crate) async fn write_loop(
    write_client: Arc<WriteClient>,
    retry: Arc<RetryState>,
    config: ClientConfig,
) {
    let service = write_client.client.service_name().to_string();

    let mut keep_running = true;
    while keep_running {
        let mut requests = PutRequestMap::default();
        let mut locally_dropped: Vec<DataPoint> = Vec::new();

        let (still_running, drained) = write_client
            .queue
            .pop(|point| {
                let placement = write_client
                    .client
                    .add_data_point_to_request(&point, &mut requests);
                if placement.dropped {
                    locally_dropped.push(point);
                }
                placement.accept_more && locally_dropped.len() < MAX_RETRY_BATCH_SIZE
            })
            .await;

        if !still_running {
            warn!(service = %service, "shutting down write worker");
            keep_running = false;
        }
        if drained == 0 {
            continue;
        }

        // Send whatever was drained, even on the shutdown iteration.
        let server_dropped =
            put_with_stats(&*write_client.client, drained, requests, &write_client.metrics).await;

        let mut dropped = locally_dropped;
        dropped.extend(server_dropped);

        if !dropped.is_empty() {
            // Re-send after a delay, giving a down server time to come back.
            let count = dropped.len();
            let deadline = retry.now() + config.retry_delay;
            if retry.try_enqueue(Arc::clone(&write_client.client), dropped, deadline) {
                write_client.metrics.put_retry.inc(count as u64);
            } else {
                log_dropped_points(
                    &service,
                    count,
                    "retry queue is full",
                    &write_client.metrics,
                );
                retry.record_write_failure();
            }
        }

        let queue_size = write_client.queue.size();
        write_client.metrics.queue_size.set(queue_size as u64);

        // Near-empty queue: wait a bit so the next drain sends a bigger
        // batch. Deliberate throughput-for-latency tuning.
        if queue_size < config.min_queue_size {
            tokio::time::sleep(config.sleep_per_put).await;
        }
    }
}

/// Send one put request map, timing it and crediting delivered points.
pub(crate) async fn put_with_stats(
    client: &dyn NetworkClient,
    points: usize,
    requests: PutRequestMap,
    metrics: &ServiceMetrics,
) -> Vec<DataPoint> {
    let started = tokio::time::Instant::now();
    let dropped = client.perform_put(requests).await;
    metrics.put_duration.add(started.elapsed());
    metrics.put.inc(points.saturating_sub(dropped.len()) as u64);
    dropped
}

/// Record points leaving the pipeline for good.
pub(crate) fn log_dropped_points(
    service: &str,
    count: usize,
    reason: &str,
    metrics: &ServiceMetrics,
) {
    warn!(service = %service, count, reason, "dropping data points");
    metrics.put_dropped.inc(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::network::mock::MockNetworkClient;
    use crate::time::{MockProvider, Time};

    use data_types::Key;
    use metric::Attributes;

    fn point(name: &str, unix_time: i64) -> DataPoint {
        DataPoint::new(Key::new(name, 1), unix_time, 1.0)
    }

    struct Fixture {
        registry: metric::Registry,
        metrics: Arc<ClientMetrics>,
        retry: Arc<RetryState>,
        config: ClientConfig,
    }

    fn fixture() -> Fixture {
        let registry = metric::Registry::new();
        let metrics = Arc::new(ClientMetrics::new(&registry));
        let time = Arc::new(MockProvider::new(Time::from_timestamp(1_000)));
        let retry = Arc::new(RetryState::new(10_000, time as _, &metrics));
        let config = ClientConfig {
            writer_threads_per_service: 1,
            queue_capacity: 10_000,
            min_queue_size: 0,
            ..Default::default()
        };
        Fixture {
            registry,
            metrics,
            retry,
            config,
        }
    }

    fn counter(registry: &metric::Registry, name: &'static str, service: &str) -> u64 {
        registry
            .get_instrument::<metric::U64Counter>(name)
            .and_then(|m| {
                m.get_observer(
                    &Attributes::from([("service", service.to_string())]),
                    |o| o.fetch(),
                )
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn worker_sends_drained_points_in_one_request() {
        let fixture = fixture();
        let mock = Arc::new(MockNetworkClient::new("svc1"));
        let write_client = Arc::new(WriteClient::new(
            Arc::new(Arc::clone(&mock)) as _,
            fixture.config.queue_capacity,
            fixture.config.queue_capacity_size_ratio,
            &fixture.metrics,
        ));

        assert!(write_client.queue.push(vec![point("a", 0), point("a", 60)]));
        write_client.queue.flush(1);

        write_loop(
            Arc::clone(&write_client),
            Arc::clone(&fixture.retry),
            fixture.config.clone(),
        )
        .await;

        let calls = mock.put_calls();
        assert_eq!(calls.len(), 1, "both points must travel in one request");
        assert_eq!(mock.put_points().len(), 2);
        assert_eq!(counter(&fixture.registry, crate::metrics::PUT, "svc1"), 2);
    }

    #[tokio::test]
    async fn server_drops_are_queued_for_retry() {
        let fixture = fixture();
        let mock = Arc::new(
            MockNetworkClient::new("svc1").with_put_results([vec![point("a", 0)]]),
        );
        let write_client = Arc::new(WriteClient::new(
            Arc::new(Arc::clone(&mock)) as _,
            fixture.config.queue_capacity,
            fixture.config.queue_capacity_size_ratio,
            &fixture.metrics,
        ));

        assert!(write_client.queue.push(vec![point("a", 0)]));
        write_client.queue.flush(1);

        write_loop(
            Arc::clone(&write_client),
            Arc::clone(&fixture.retry),
            fixture.config.clone(),
        )
        .await;

        assert_eq!(fixture.retry.pending_points(), 1);
        assert_eq!(
            counter(&fixture.registry, crate::metrics::PUT_RETRY, "svc1"),
            1
        );
    }

    #[tokio::test]
    async fn locally_dropped_points_are_queued_for_retry_too() {
        let fixture = fixture();
        let mock = Arc::new(MockNetworkClient::new("svc1").with_dropped_keys(["bad"]));
        let write_client = Arc::new(WriteClient::new(
            Arc::new(Arc::clone(&mock)) as _,
            fixture.config.queue_capacity,
            fixture.config.queue_capacity_size_ratio,
            &fixture.metrics,
        ));

        assert!(write_client.queue.push(vec![point("bad", 0), point("good", 0)]));
        write_client.queue.flush(1);

        write_loop(
            Arc::clone(&write_client),
            Arc::clone(&fixture.retry),
            fixture.config.clone(),
        )
        .await;

        // The good point went out, the bad one is pending retry.
        assert_eq!(mock.put_points().len(), 1);
        assert_eq!(fixture.retry.pending_points(), 1);
    }

    #[tokio::test]
    async fn full_retry_queue_drops_permanently() {
        let registry = metric::Registry::new();
        let metrics = Arc::new(ClientMetrics::new(&registry));
        let time = Arc::new(MockProvider::new(Time::from_timestamp(1_000)));
        // Capacity 1: any non-empty batch trips the gate.
        let retry = Arc::new(RetryState::new(1, time as _, &metrics));
        let config = ClientConfig {
            min_queue_size: 0,
            queue_capacity: 10_000,
            ..Default::default()
        };

        let mock = Arc::new(
            MockNetworkClient::new("svc1").with_put_results([vec![point("a", 0)]]),
        );
        let write_client = Arc::new(WriteClient::new(
            Arc::new(Arc::clone(&mock)) as _,
            config.queue_capacity,
            config.queue_capacity_size_ratio,
            &metrics,
        ));

        assert!(write_client.queue.push(vec![point("a", 0)]));
        write_client.queue.flush(1);

        write_loop(Arc::clone(&write_client), Arc::clone(&retry), config).await;

        assert_eq!(retry.pending_points(), 0);
        assert_eq!(counter(&registry, crate::metrics::PUT_DROPPED, "svc1"), 1);
        let failures = registry
            .get_instrument::<metric::U64Counter>(crate::metrics::RETRY_QUEUE_WRITE_FAILURES)
            .and_then(|m| m.get_observer(&Attributes::default(), |o| o.fetch()))
            .unwrap_or(0);
        assert_eq!(failures, 1);
    }
}
