//! A small metric abstraction for instrumenting the stratus client.
//!
//! Metric recording is decoupled from metric export: a [`Registry`] holds
//! named instruments, each instrument maintains one observer per set of
//! [`Attributes`], and recording happens through cheap cloneable handles
//! returned by [`Metric::recorder`]. Tests (and exporters) read values back
//! through [`Registry::get_instrument`] and [`Metric::get_observer`] without
//! any export pipeline in between.
//!
//! Metric names are `&'static str` so every metric emitted by the codebase
//! can be found with grep.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

mod counter;
mod duration;
mod gauge;

pub use counter::U64Counter;
pub use duration::DurationCounter;
pub use gauge::U64Gauge;

/// A set of key/value pairs distinguishing observers of one [`Metric`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Set `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize, T> From<[(&'static str, T); N]> for Attributes
where
    T: Into<Cow<'static, str>>,
{
    fn from(pairs: [(&'static str, T); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
        )
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|&(k, v)| (k, Cow::Borrowed(v)))
                .collect(),
        )
    }
}

/// A point-in-time value read out of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A monotonic count.
    U64Counter(u64),
    /// A value that can move both ways.
    U64Gauge(u64),
    /// An accumulated duration and the number of contributions to it.
    DurationCounter {
        /// Sum of all recorded durations.
        total: Duration,
        /// Number of recorded durations.
        count: u64,
    },
}

/// Types that record one kind of observation and hand out recorder handles.
pub trait MetricObserver: Debug + Default + Send + Sync + 'static {
    /// The handle used to record values; typically `Self`.
    type Recorder;

    /// Return a new recording handle sharing this observer's state.
    fn recorder(&self) -> Self::Recorder;

    /// Read the current value.
    fn observe(&self) -> Observation;
}

/// A named instrument holding one observer of type `T` per attribute set.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

// Manual impl: cloning shares observer state and must not require `T: Clone`.
impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The instrument description.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return a recorder for the observer registered under `attributes`,
    /// creating it on first use.
    ///
    /// The returned handle can be cached to amortize the attribute lookup.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .recorder()
    }

    /// Read the observer registered under `attributes`, if any.
    pub fn get_observer<R>(&self, attributes: &Attributes, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.observers.lock().get(attributes).map(f)
    }

    /// Snapshot every observer's current value.
    pub fn observations(&self) -> Vec<(Attributes, Observation)> {
        self.observers
            .lock()
            .iter()
            .map(|(attributes, observer)| (attributes.clone(), observer.observe()))
            .collect()
    }
}

/// Object-safe view of a [`Metric`] held by the [`Registry`].
trait Instrument: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn instrument_observations(&self) -> Vec<(Attributes, Observation)>;
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn instrument_observations(&self) -> Vec<(Attributes, Observation)> {
        self.observations()
    }
}

/// A registry of named instruments.
///
/// Registering the same name twice returns the existing instrument; asking
/// for it with a different observer type panics, as that is always an
/// instrumentation bug.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Arc<dyn Instrument>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the instrument `name` with observers of type `T`.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let instrument = Arc::clone(
            instruments
                .entry(name)
                .or_insert_with(|| Arc::new(Metric::<T>::new(name, description))),
        );
        instrument
            .as_any()
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {name} registered with a different observer type"))
            .clone()
    }

    /// Fetch the previously registered instrument `name`, if its observer
    /// type matches `T`.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.as_any().downcast_ref::<Metric<T>>().cloned())
    }

    /// Snapshot every observation of every instrument, keyed by name.
    ///
    /// Names iterate in lexical order, making output stable for assertions
    /// and exporters.
    pub fn observations(&self) -> Vec<(&'static str, Vec<(Attributes, Observation)>)> {
        self.instruments
            .lock()
            .iter()
            .map(|(name, instrument)| (*name, instrument.instrument_observations()))
            .collect()
    }
}
