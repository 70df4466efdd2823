//! A small in-process metric registry.
//!
//! Instruments are registered by name and fan out into per-attribute-set
//! recorders. Observers can be fetched back out by tests to assert on emitted
//! values without scraping an exporter.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A set of key-value attributes identifying one recorder of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, String>);

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(v: &'a [(&'static str, &'static str); N]) -> Self {
        Self(
            v.iter()
                .map(|(k, v)| (*k, (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(v: &[(&'static str, &'static str)]) -> Self {
        Self(
            v.iter()
                .map(|(k, v)| (*k, (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }
}

/// An observer that can be cloned out of a [`Metric`] and written to.
pub trait MetricObserver: Debug + Clone + Default + Send + Sync + 'static {}

/// A monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter(Arc<AtomicU64>);

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge holding the last recorded value.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge(Arc<AtomicU64>);

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named instrument fanning out into one observer per attribute set.
#[derive(Debug, Clone)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instrument help text.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns the recorder for the given attribute set, creating it on first
    /// use. Recorders are cheap clones sharing the underlying value.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        let mut observers = self.observers.lock();
        observers.entry(attributes.into()).or_default().clone()
    }

    /// Returns the observer for the given attribute set, if any recorder was
    /// created for it.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// Registry of named instruments.
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instruments = self.instruments.lock();
        f.debug_struct("Registry")
            .field("instruments", &instruments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) an instrument with the given name.
    ///
    /// # Panics
    ///
    /// Panics if the name was previously registered with a different observer
    /// type.
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
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric '{name}' registered with a different type"))
            .clone()
    }

    /// Look up a previously registered instrument.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|m| m.downcast_ref::<Metric<T>>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_fan_out() {
        let registry = Registry::new();
        let metric: Metric<U64Counter> =
            registry.register_metric("ingest_records", "records ingested");

        let ok = metric.recorder(&[("outcome", "ok")]);
        let failed = metric.recorder(&[("outcome", "failed")]);
        ok.inc(2);
        ok.inc(1);
        failed.inc(5);

        let found: Metric<U64Counter> = registry.get_instrument("ingest_records").unwrap();
        assert_eq!(
            found
                .get_observer(&Attributes::from(&[("outcome", "ok")]))
                .unwrap()
                .fetch(),
            3
        );
        assert_eq!(
            found
                .get_observer(&Attributes::from(&[("outcome", "failed")]))
                .unwrap()
                .fetch(),
            5
        );
        assert!(found
            .get_observer(&Attributes::from(&[("outcome", "other")]))
            .is_none());
    }

    #[test]
    fn re_registration_returns_same_instrument() {
        let registry = Registry::new();
        let a: Metric<U64Counter> = registry.register_metric("m", "m");
        let b: Metric<U64Counter> = registry.register_metric("m", "m");
        a.recorder(&[("x", "1")]).inc(7);
        assert_eq!(b.recorder(&[("x", "1")]).fetch(), 7);
    }

    #[test]
    fn gauge_overwrites() {
        let registry = Registry::new();
        let metric: Metric<U64Gauge> = registry.register_metric("lag", "replication lag");
        let g = metric.recorder(&[("role", "follower")]);
        g.set(10);
        g.set(3);
        assert_eq!(g.fetch(), 3);
    }
}
