//! The delayed-retry pipeline for failed writes.
//!
//! Every write service shares one bounded retry queue. Workers block on the
//! queue, honor each operation's deadline, age out operations that waited too
//! long, and re-send exactly once; drops from a retry are never re-queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use data_types::DataPoint;
use metric::{U64Counter, U64Gauge};
use tracing::info;

use crate::metrics::{ClientMetrics, ServiceMetrics};
use crate::network::{NetworkClient, PutRequestMap};
use crate::queue::{BoundedQueue, MIN_QUEUE_SLOTS};
use crate::time::{Time, TimeProvider};
use crate::write::{log_dropped_points, put_with_stats};

/// Operations whose deadline passed by more than this are dropped unsent.
pub(crate) const RETRY_THRESHOLD: Duration = Duration::from_secs(30);

/// Retry batches are small, so the queue needs few slots per point of
/// capacity.
const RETRY_QUEUE_SIZE_RATIO: usize = 100;

/// A deferred re-send of dropped data points.
///
/// An operation with an empty point vector is the worker shutdown sentinel.
#[derive(Debug)]
pub(crate) struct RetryOperation {
    client: Option<Arc<dyn NetworkClient>>,
    points: Vec<DataPoint>,
    deadline: Time,
}

impl RetryOperation {
    fn sentinel() -> Self {
        Self {
            client: None,
            points: vec![],
            deadline: Time::from_timestamp(0),
        }
    }
}

/// The shared retry queue plus the live-point accounting around it.
///
/// `pending_points` counts every data point in queued operations and in
/// operations currently being processed; the `retry_queue_size` gauge mirrors
/// it on every enqueue and dequeue.
#[derive(Debug)]
pub(crate) struct RetryState {
    queue: BoundedQueue<RetryOperation>,
    pending_points: AtomicUsize,
    capacity: usize,
    time: Arc<dyn TimeProvider>,
    queue_size: U64Gauge,
    write_failures: U64Counter,
}

impl RetryState {
    pub(crate) fn new(
        capacity: usize,
        time: Arc<dyn TimeProvider>,
        metrics: &ClientMetrics,
    ) -> Self {
        let slots = (capacity / RETRY_QUEUE_SIZE_RATIO).max(MIN_QUEUE_SLOTS);
        Self {
            queue: BoundedQueue::new(slots),
            pending_points: AtomicUsize::new(0),
            capacity,
            time,
            queue_size: metrics.retry_queue_size.clone(),
            write_failures: metrics.retry_queue_write_failures.clone(),
        }
    }

    pub(crate) fn now(&self) -> Time {
        self.time.now()
    }

    /// Data points queued or currently being retried.
    pub(crate) fn pending_points(&self) -> usize {
        self.pending_points.load(Ordering::Relaxed)
    }

    /// Admit a failed batch for a later re-send.
    ///
    /// `false` when the point-capacity gate or the queue itself rejects it;
    /// the batch is then lost and the caller logs it.
    pub(crate) fn try_enqueue(
        &self,
        client: Arc<dyn NetworkClient>,
        points: Vec<DataPoint>,
        deadline: Time,
    ) -> bool {
        let count = points.len();
        if self.pending_points.load(Ordering::Relaxed) + count >= self.capacity {
            return false;
        }
        let op = RetryOperation {
            client: Some(client),
            points,
            deadline,
        };
        if !self.queue.try_push(op) {
            return false;
        }
        let pending = self.pending_points.fetch_add(count, Ordering::Relaxed) + count;
        self.queue_size.set(pending as u64);
        true
    }

    /// Record a batch the queue could not absorb.
    pub(crate) fn record_write_failure(&self) {
        self.write_failures.inc(1);
    }

    /// Post one shutdown sentinel per worker.
    ///
    /// Sentinels bypass the slot bound: a full queue must not strand a
    /// worker at shutdown.
    pub(crate) fn post_shutdown_sentinels(&self, workers: usize) {
        for _ in 0..workers {
            self.queue.force_push(RetryOperation::sentinel());
        }
    }
}

/// One retry worker. Several run concurrently over the shared queue.
pub(crate) async fn retry_loop(state: Arc<RetryState>, metrics: Arc<ClientMetrics>) {
    loop {
        let op = state.queue.pop().await;
        let count = op.points.len();
        let pending = state.pending_points.fetch_sub(count, Ordering::Relaxed) - count;
        state.queue_size.set(pending as u64);

        if op.points.is_empty() {
            info!("shutting down retry worker");
            break;
        }
        let client = op
            .client
            .expect("non-sentinel retry operations always carry a client");
        let service_metrics = ServiceMetrics::new(&metrics, client.service_name());

        let now = state.now();
        if op.deadline + RETRY_THRESHOLD < now {
            log_dropped_points(
                client.service_name(),
                count,
                "data points are too old",
                &service_metrics,
            );
            continue;
        }

        if let Some(wait) = op.deadline.checked_duration_since(now) {
            // The queue is FIFO with a constant delay, so sleeping at the
            // head cannot starve an operation that is due earlier.
            tokio::time::sleep(wait).await;
        }

        let mut requests = PutRequestMap::default();
        let mut rebuild_dropped = 0_usize;
        for point in &op.points {
            if client
                .add_data_point_to_request(point, &mut requests)
                .dropped
            {
                rebuild_dropped += 1;
            }
        }

        let sent = count - rebuild_dropped;
        let server_dropped = put_with_stats(&*client, sent, requests, &service_metrics).await;

        let total_dropped = rebuild_dropped + server_dropped.len();
        if total_dropped > 0 {
            // No recursive retry: a failed retry is final.
            log_dropped_points(
                client.service_name(),
                total_dropped,
                "retry send failed",
                &service_metrics,
            );
        }
    }
}
