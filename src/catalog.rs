//! Metric contracts and an in-process metric registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::zones::ZoneContext;
use crate::{MetricMap, MetricValue, RidePayload};

/// A computable ride metric.
pub trait Metric {
    /// Compute the metric for a ride.
    ///
    /// `computed` holds every metric already resolved in this computation,
    /// including all of this metric's declared dependencies.
    fn compute(&self, ride: &RidePayload, zones: &ZoneContext<'_>, computed: &MetricMap)
        -> MetricValue;
}

/// Query contract of a metric catalog.
pub trait MetricCatalog: Send + Sync {
    /// All metric names the catalog knows.
    fn names(&self) -> BTreeSet<String>;

    /// Declared dependencies of a metric, in declaration order.
    fn dependencies_of(&self, name: &str) -> Vec<String>;

    /// Create a computable instance of a metric.
    fn instantiate(&self, name: &str) -> Option<Box<dyn Metric>>;
}

type MetricFactory = Box<dyn Fn() -> Box<dyn Metric> + Send + Sync>;
type ComputeFn = dyn Fn(&RidePayload, &ZoneContext<'_>, &MetricMap) -> MetricValue + Send + Sync;

struct Entry {
    dependencies: Vec<String>,
    factory: Option<MetricFactory>,
}

/// Metric backed by a shared closure.
struct FnMetric(Arc<ComputeFn>);

impl Metric for FnMetric {
    fn compute(
        &self,
        ride: &RidePayload,
        zones: &ZoneContext<'_>,
        computed: &MetricMap,
    ) -> MetricValue {
        (self.0)(ride, zones, computed)
    }
}

/// In-process metric catalog.
///
/// Registering a name twice replaces the earlier entry.
#[derive(Default)]
pub struct MetricRegistry {
    entries: BTreeMap<String, Entry>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric with a factory producing fresh instances.
    pub fn register<F>(&mut self, name: &str, dependencies: &[&str], factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Metric> + Send + Sync + 'static,
    {
        self.insert(name, dependencies, Some(Box::new(factory)))
    }

    /// Register a metric type instantiated through `Default`.
    pub fn register_type<M>(&mut self, name: &str, dependencies: &[&str]) -> &mut Self
    where
        M: Metric + Default + 'static,
    {
        self.register(name, dependencies, || -> Box<dyn Metric> { Box::new(M::default()) })
    }

    /// Register a metric computed by a closure.
    pub fn register_fn<F>(&mut self, name: &str, dependencies: &[&str], compute: F) -> &mut Self
    where
        F: Fn(&RidePayload, &ZoneContext<'_>, &MetricMap) -> MetricValue + Send + Sync + 'static,
    {
        let compute: Arc<ComputeFn> = Arc::new(compute);
        self.register(name, dependencies, move || -> Box<dyn Metric> {
            Box::new(FnMetric(compute.clone()))
        })
    }

    /// Declare a metric without an implementation.
    ///
    /// Other metrics may depend on it; it can only ever be satisfied by a ride
    /// override.
    pub fn declare(&mut self, name: &str, dependencies: &[&str]) -> &mut Self {
        self.insert(name, dependencies, None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn insert(
        &mut self,
        name: &str,
        dependencies: &[&str],
        factory: Option<MetricFactory>,
    ) -> &mut Self {
        self.entries.insert(
            name.to_string(),
            Entry {
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                factory,
            },
        );
        self
    }
}

impl MetricCatalog for MetricRegistry {
    fn names(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|e| e.dependencies.clone())
            .unwrap_or_default()
    }

    fn instantiate(&self, name: &str) -> Option<Box<dyn Metric>> {
        self.entries
            .get(name)
            .and_then(|e| e.factory.as_ref())
            .map(|factory| factory())
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, e)| (k, &e.dependencies)))
            .finish()
    }
}
