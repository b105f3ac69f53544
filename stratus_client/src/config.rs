//! Configuration for [`StratusClient`](crate::StratusClient) instances.

use std::time::Duration;

/// Tunables for one client instance.
///
/// In production a process is either a reader or a writer, never both:
/// [`writer_threads_per_service`](Self::writer_threads_per_service) selects
/// which side is initialized.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of write worker tasks started per write service.
    ///
    /// `0` makes this a reader client: no write queues or workers are
    /// created, and the read-service refresher runs instead.
    pub writer_threads_per_service: usize,

    /// Data points buffered per write queue.
    pub queue_capacity: usize,

    /// Divisor yielding the queue slot count,
    /// `max(queue_capacity / queue_capacity_size_ratio, 10)`.
    ///
    /// The queue stores whole batches, so the slot count is far smaller than
    /// the point capacity.
    pub queue_capacity_size_ratio: usize,

    /// Write workers throttle when the queue holds fewer points than this,
    /// trading latency for bigger batches under low load.
    pub min_queue_size: usize,

    /// How long a write worker sleeps after a put when the queue is
    /// near-empty.
    pub sleep_per_put: Duration,

    /// Maximum data points admitted to the retry queue across all services.
    pub retry_queue_capacity: usize,

    /// Delay before a failed batch is re-sent. Keeping this under one minute
    /// lets retried points still land inside their minute bucket.
    pub retry_delay: Duration,

    /// Number of retry worker tasks sharing the retry queue.
    pub retry_thread_count: usize,

    /// Cadence of the read-service refresher; `None` disables periodic
    /// refreshes (the set is still resolved once at startup).
    pub read_services_update_interval: Option<Duration>,

    /// Fan whole-shard scans out to every read service instead of only the
    /// first.
    pub parallel_scan_shard: bool,

    /// Strict reads: transient failures that survive every replica error the
    /// whole call instead of returning partial data.
    pub strict_reads: bool,

    /// Compare the copies returned by different services and log keys whose
    /// data disagrees.
    pub compare_reads: bool,

    /// Allowed relative error between copies when comparing reads.
    pub compare_epsilon: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            writer_threads_per_service: 0,
            queue_capacity: 1,
            queue_capacity_size_ratio: 500,
            min_queue_size: 100,
            sleep_per_put: Duration::from_millis(100),
            retry_queue_capacity: 10_000,
            retry_delay: Duration::from_secs(55),
            retry_thread_count: 4,
            read_services_update_interval: Some(Duration::from_secs(15)),
            parallel_scan_shard: false,
            strict_reads: false,
            compare_reads: false,
            compare_epsilon: 0.1,
        }
    }
}
