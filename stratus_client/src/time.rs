//! Clock abstraction so deadline arithmetic is testable.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// A UTC timestamp produced by a [`TimeProvider`].
///
/// Opaque by design: code under test obtains instants only through a
/// provider, so tests can pin the clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Make a `Time` from non-leap seconds since the unix epoch.
    pub fn from_timestamp(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().expect("seconds out of range"))
    }

    /// Seconds since the unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// The duration from `other` to `self`, or `None` if `self` is earlier.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        self.0.signed_duration_since(other.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + chrono::Duration::from_std(rhs).expect("duration out of range"))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A clock source. No monotonicity guarantees are made.
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

/// The wall clock.
#[derive(Debug, Default)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a wall-clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A pinned clock for tests, advanced explicitly.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider pinned to `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Pin the clock to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the clock by `duration`, returning the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}
