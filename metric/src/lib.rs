//! A lock-cheap metric registry: named instruments, each fanning out to
//! per-attribute-set observers that callers capture once and update without
//! further registry involvement.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{
    any::Any,
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

/// A sorted set of key/value attributes qualifying one observer of a metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl Attributes {
    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(v: &[(&'static str, &'static str); N]) -> Self {
        Self(v.iter().map(|(k, v)| (*k, (*v).to_string())).collect())
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(v: &[(&'static str, &'static str)]) -> Self {
        Self(v.iter().map(|(k, v)| (*k, (*v).to_string())).collect())
    }
}

/// Something a [`Metric`] can hand out per attribute set.
pub trait MetricObserver: Debug + Clone + Default + Send + Sync + 'static {}

/// A monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicU64>);

impl U64Gauge {
    /// Set to `value`.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Increment by `delta`.
    pub fn inc(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrement by `delta`, saturating at zero.
    pub fn dec(&self, delta: u64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(delta);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    /// Current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A registered instrument: one name and description, many observers keyed
/// by [`Attributes`].
#[derive(Debug, Clone)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Arc::new(Mutex::new(BTreeMap::new())),
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

    /// Return the observer for `attributes`, creating it on first use.
    ///
    /// The returned handle shares state with the instrument; callers keep it
    /// and record without touching the registry again.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let attributes = attributes.into();
        self.observers
            .lock()
            .entry(attributes)
            .or_default()
            .clone()
    }

    /// Return the observer previously created for `attributes`, if any.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// Type-erased registry entry.
trait Instrument: Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The process-wide (or test-local) home of all instruments.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch the existing) instrument called `name`.
    ///
    /// # Panics
    ///
    /// If `name` was previously registered with a different observer type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        entry
            .as_any()
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric {} registered with a different type", name))
            .clone()
    }

    /// Look up an instrument by name, e.g. `Metric<U64Counter>`, for test
    /// assertions and export.
    pub fn get_instrument<T: Any + Clone>(&self, name: &str) -> Option<T> {
        let instruments = self.instruments.lock();
        instruments
            .get(name)
            .and_then(|i| i.as_any().downcast_ref::<T>())
            .cloned()
    }
}
