//! Bounded queues feeding the write pipeline.
//!
//! Producers never block: a full queue rejects the push and the caller
//! decides (drop + metric). Consumers are async tasks; the semaphore carries
//! exactly one permit per queued item, so wakeups cannot be lost across
//! multiple consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use data_types::DataPoint;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Queues never shrink below this many slots regardless of configuration.
pub(crate) const MIN_QUEUE_SLOTS: usize = 10;

/// A slot-bounded MPMC queue with non-blocking push and async pop.
#[derive(Debug)]
pub(crate) struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Semaphore,
    slots: usize,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(slots)),
            ready: Semaphore::new(0),
            slots,
        }
    }

    /// Enqueue `item`, unless all slots are taken.
    pub(crate) fn try_push(&self, item: T) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.slots {
                return false;
            }
            items.push_back(item);
        }
        self.ready.add_permits(1);
        true
    }

    /// Enqueue `item` past the slot bound.
    ///
    /// Shutdown sentinels go through here: a full queue must not be able to
    /// strand a consumer.
    pub(crate) fn force_push(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.add_permits(1);
    }

    /// Wait for an item.
    pub(crate) async fn pop(&self) -> T {
        let permit = self
            .ready
            .acquire()
            .await
            .expect("queue semaphore is never closed");
        permit.forget();
        self.items
            .lock()
            .pop_front()
            .expect("semaphore permit issued without a queued item")
    }

    /// Take an item only if one is already queued.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        Some(
            self.items
                .lock()
                .pop_front()
                .expect("semaphore permit issued without a queued item"),
        )
    }
}

/// The write queue: batches of data points, bounded in batch slots, with the
/// live data-point count tracked for throttling and the queue-size gauge.
///
/// The slot count is `max(capacity / size_ratio, 10)`; the queue stores
/// whole batches, so far fewer slots than points are needed.
#[derive(Debug)]
pub(crate) struct PointBatchQueue {
    batches: BoundedQueue<Vec<DataPoint>>,
    points: AtomicUsize,
}

impl PointBatchQueue {
    pub(crate) fn new(capacity: usize, size_ratio: usize) -> Self {
        let slots = (capacity / size_ratio.max(1)).max(MIN_QUEUE_SLOTS);
        Self {
            batches: BoundedQueue::new(slots),
            points: AtomicUsize::new(0),
        }
    }

    /// Enqueue a batch; `false` if the queue is full. Empty batches are
    /// reserved for shutdown sentinels and must not be pushed here.
    pub(crate) fn push(&self, points: Vec<DataPoint>) -> bool {
        debug_assert!(!points.is_empty());
        let count = points.len();
        if self.batches.try_push(points) {
            self.points.fetch_add(count, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Post one shutdown sentinel per consumer and wake them.
    pub(crate) fn flush(&self, consumers: usize) {
        for _ in 0..consumers {
            self.batches.force_push(Vec::new());
        }
    }

    /// Live data points currently queued.
    pub(crate) fn size(&self) -> usize {
        self.points.load(Ordering::Relaxed)
    }

    /// Drain queued batches through `visitor`, one data point at a time.
    ///
    /// Blocks for the first batch, then keeps draining already-queued batches
    /// until the visitor asks to stop or the queue runs dry. A batch is
    /// consumed whole: once dequeued, all its points visit even if the
    /// visitor declines more mid-batch (the visitor decides only whether
    /// *further batches* join the drain).
    ///
    /// Returns `(keep_running, points_drained)`; `keep_running` is `false`
    /// when a shutdown sentinel was consumed, after which the points drained
    /// so far must still be sent.
    pub(crate) async fn pop(
        &self,
        mut visitor: impl FnMut(DataPoint) -> bool,
    ) -> (bool, usize) {
        let mut drained = 0;
        let mut batch = self.batches.pop().await;

        loop {
            if batch.is_empty() {
                // Shutdown sentinel.
                return (false, drained);
            }

            self.points.fetch_sub(batch.len(), Ordering::Relaxed);
            drained += batch.len();

            let mut accept_more = true;
            for point in batch {
                if !visitor(point) {
                    accept_more = false;
                }
            }
            if !accept_more {
                break;
            }

            match self.batches.try_pop() {
                Some(next) => batch = next,
                None => break,
            }
        }

        (true, drained)
    }
}
