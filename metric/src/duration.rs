use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{MetricObserver, Observation};

#[derive(Debug, Default)]
struct State {
    total_nanos: AtomicU64,
    count: AtomicU64,
}

/// An accumulated duration plus the number of contributions, from which an
/// exporter derives an average.
#[derive(Debug, Clone, Default)]
pub struct DurationCounter {
    state: Arc<State>,
}

impl DurationCounter {
    /// Add one observed `duration`.
    ///
    /// Durations longer than ~584 years saturate the nanosecond total.
    pub fn add(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.state.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.state.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the accumulated total.
    pub fn fetch_total(&self) -> Duration {
        Duration::from_nanos(self.state.total_nanos.load(Ordering::Relaxed))
    }

    /// Read the number of contributions.
    pub fn fetch_count(&self) -> u64 {
        self.state.count.load(Ordering::Relaxed)
    }
}

impl MetricObserver for DurationCounter {
    type Recorder = Self;

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::DurationCounter {
            total: self.fetch_total(),
            count: self.fetch_count(),
        }
    }
}
