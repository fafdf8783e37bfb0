//! # Metric Engine
//!
//! Resolves and computes the full metric set of one ride.
//!
//! ## Algorithm
//!
//! Resolution is a topological pass over the declared dependency graph,
//! computed once per invocation:
//!
//! 1. Depth-first visit of every catalog metric with in-progress marking.
//!    Reaching an in-progress metric again closes a cycle; every metric on
//!    that cycle is unresolvable. A dependency the catalog does not declare is
//!    missing. Anything depending on an unresolvable metric is unresolvable.
//! 2. Resolvable metrics are ordered by dependency depth, then by name.
//! 3. Each metric is evaluated exactly once in that order: a ride override is
//!    used verbatim, otherwise the catalog instantiates the metric and it
//!    computes against the payload, the zone context and the results so far.
//!
//! An override replaces the computation, not the dependency chain: an
//! overridden metric is only applied once all of its declared dependencies
//! are present, and an override on a cycle member does not break the cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::catalog::MetricCatalog;
use crate::error::{RideMetricsError, Unresolved};
use crate::zones::ZoneContext;
use crate::{MetricMap, RidePayload};

/// A metric excluded from a result set, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedMetric {
    pub name: String,
    pub reason: Unresolved,
}

impl UnresolvedMetric {
    pub fn to_error(&self) -> RideMetricsError {
        RideMetricsError::UnresolvableDependency {
            metric: self.name.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one full computation.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub metrics: MetricMap,
    /// Metrics excluded from `metrics`, sorted by name
    pub unresolved: Vec<UnresolvedMetric>,
}

impl Resolution {
    /// Unresolved metrics as errors.
    pub fn errors(&self) -> Vec<RideMetricsError> {
        self.unresolved.iter().map(UnresolvedMetric::to_error).collect()
    }
}

/// Evaluation order for one ride.
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    /// Resolvable metrics, dependencies first
    pub order: Vec<String>,
    pub unresolved: Vec<UnresolvedMetric>,
    dependencies: HashMap<String, Vec<String>>,
}

/// Visit state of a metric during planning.
#[derive(Debug, Clone, Copy)]
enum Mark {
    InProgress,
    Resolved(usize),
    Failed,
}

struct Planner {
    overridden: usize,
    names: BTreeSet<String>,
    dependencies: HashMap<String, Vec<String>>,
    marks: HashMap<String, Mark>,
    stack: Vec<String>,
    reasons: BTreeMap<String, Unresolved>,
}

impl Planner {
    fn new(catalog: &dyn MetricCatalog, ride: &RidePayload) -> Self {
        let names = catalog.names();
        let overridden = names
            .iter()
            .filter(|name| ride.override_for(name).is_some())
            .count();
        let dependencies = names
            .iter()
            .map(|name| (name.clone(), catalog.dependencies_of(name)))
            .collect();

        Self {
            overridden,
            names,
            dependencies,
            marks: HashMap::new(),
            stack: Vec::new(),
            reasons: BTreeMap::new(),
        }
    }

    fn run(mut self) -> ResolutionPlan {
        let names: Vec<String> = self.names.iter().cloned().collect();
        let mut depths: Vec<(usize, String)> = Vec::with_capacity(names.len());
        for name in names {
            if let Some(depth) = self.visit(&name) {
                depths.push((depth, name));
            }
        }
        depths.sort();

        debug!(
            "[MetricEngine] Planned {} metrics ({} unresolvable, {} overridden)",
            depths.len(),
            self.reasons.len(),
            self.overridden
        );

        ResolutionPlan {
            order: depths.into_iter().map(|(_, name)| name).collect(),
            unresolved: self
                .reasons
                .into_iter()
                .map(|(name, reason)| UnresolvedMetric { name, reason })
                .collect(),
            dependencies: self.dependencies,
        }
    }

    /// Depth of a metric in the dependency graph, or `None` if unresolvable.
    fn visit(&mut self, name: &str) -> Option<usize> {
        match self.marks.get(name) {
            Some(Mark::Resolved(depth)) => return Some(*depth),
            Some(Mark::Failed) => return None,
            Some(Mark::InProgress) => {
                // Everything on the stack from `name` upward closes the cycle
                if let Some(pos) = self.stack.iter().position(|n| n == name) {
                    for member in &self.stack[pos..] {
                        self.reasons
                            .entry(member.clone())
                            .or_insert(Unresolved::Cycle);
                    }
                }
                return None;
            }
            None => {}
        }

        self.marks.insert(name.to_string(), Mark::InProgress);
        self.stack.push(name.to_string());

        // Visit every dependency so each cycle through this metric gets found
        let deps = self.dependencies.get(name).cloned().unwrap_or_default();
        let mut depth = 0;
        let mut failure = None;
        for dep in deps {
            if !self.names.contains(&dep) {
                failure.get_or_insert(Unresolved::MissingDependency(dep));
                continue;
            }
            match self.visit(&dep) {
                Some(d) => depth = depth.max(d + 1),
                None => {
                    failure.get_or_insert(Unresolved::DependsOnUnresolved(dep));
                }
            }
        }

        self.stack.pop();
        match failure {
            None => {
                self.marks.insert(name.to_string(), Mark::Resolved(depth));
                Some(depth)
            }
            Some(reason) => {
                self.marks.insert(name.to_string(), Mark::Failed);
                self.reasons.entry(name.to_string()).or_insert(reason);
                None
            }
        }
    }
}

/// Computes every catalog metric for a ride.
pub struct MetricEngine<'a> {
    catalog: &'a dyn MetricCatalog,
}

impl<'a> MetricEngine<'a> {
    pub fn new(catalog: &'a dyn MetricCatalog) -> Self {
        Self { catalog }
    }

    /// Work out the evaluation order for a ride without computing anything.
    pub fn plan(&self, ride: &RidePayload) -> ResolutionPlan {
        Planner::new(self.catalog, ride).run()
    }

    /// Resolve and compute all metrics.
    pub fn compute_all(&self, ride: &RidePayload, zones: &ZoneContext<'_>) -> Resolution {
        let plan = self.plan(ride);
        let mut metrics = MetricMap::with_capacity(plan.order.len());
        let mut unresolved = plan.unresolved;

        for name in plan.order {
            let deps = plan.dependencies.get(&name).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(dep) = deps.iter().find(|d| !metrics.contains_key(d.as_str())) {
                unresolved.push(UnresolvedMetric {
                    name,
                    reason: Unresolved::DependsOnUnresolved(dep.clone()),
                });
                continue;
            }

            let value = match ride.override_for(&name) {
                Some(value) => value.clone(),
                None => match self.catalog.instantiate(&name) {
                    Some(metric) => metric.compute(ride, zones, &metrics),
                    None => {
                        unresolved.push(UnresolvedMetric {
                            name,
                            reason: Unresolved::NotInstantiable,
                        });
                        continue;
                    }
                },
            };
            metrics.insert(name, value);
        }

        unresolved.sort_by(|a, b| a.name.cmp(&b.name));
        for u in &unresolved {
            warn!("[MetricEngine] Metric '{}' unresolvable: {}", u.name, u.reason);
        }

        Resolution { metrics, unresolved }
    }
}
