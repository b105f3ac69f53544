use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{MetricObserver, Observation};

/// A value that can be set, raised and lowered.
///
/// If the same attribute set is recorded from multiple locations the reported
/// value oscillates between them; give each location its own attributes.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Overwrite the gauge with `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Raise the gauge by `delta`, wrapping on overflow.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Lower the gauge by `delta`, wrapping on underflow.
    pub fn dec(&self, delta: u64) {
        self.state.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    type Recorder = Self;

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_moves_both_ways() {
        let gauge = U64Gauge::default();

        gauge.set(345);
        assert_eq!(gauge.fetch(), 345);

        gauge.inc(5);
        gauge.dec(100);
        assert_eq!(gauge.fetch(), 250);
        assert_eq!(gauge.observe(), Observation::U64Gauge(250));
    }
}
