//! Unified error handling for the ride-metrics library.
//!
//! Loader and catalog failures are captured where they happen and translated
//! into one of these kinds. None of them is fatal to the surrounding
//! application: a ride whose payload cannot be loaded reports empty statistics,
//! an unresolvable metric is dropped from the result set with a diagnostic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a metric could not be placed into a computed result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Unresolved {
    /// The metric is part of a dependency cycle
    Cycle,
    /// The metric declares a dependency the catalog does not know
    MissingDependency(String),
    /// One of the metric's dependencies is itself unresolvable
    DependsOnUnresolved(String),
    /// The catalog declared the metric but could not instantiate it
    NotInstantiable,
}

impl std::fmt::Display for Unresolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unresolved::Cycle => write!(f, "dependency cycle"),
            Unresolved::MissingDependency(dep) => write!(f, "missing dependency '{}'", dep),
            Unresolved::DependsOnUnresolved(dep) => {
                write!(f, "depends on unresolvable metric '{}'", dep)
            }
            Unresolved::NotInstantiable => write!(f, "catalog could not instantiate metric"),
        }
    }
}

/// Unified error type for ride-metrics operations.
#[derive(Debug, Clone, Error)]
pub enum RideMetricsError {
    /// Raw ride data could not be loaded (missing file, parse failure)
    #[error("Ride '{location}' unavailable: {}", .details.join("; "))]
    PayloadUnavailable {
        location: String,
        details: Vec<String>,
    },
    /// A metric's dependency chain cannot be satisfied
    #[error("Metric '{metric}' unresolvable: {reason}")]
    UnresolvableDependency { metric: String, reason: Unresolved },
    /// Zone query outside the active range
    #[error("Zone index {index} out of range ({num_zones} zones)")]
    ZoneIndexOutOfRange { index: usize, num_zones: usize },
    /// Zone or library configuration could not be parsed
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias for ride-metrics operations.
pub type Result<T> = std::result::Result<T, RideMetricsError>;

/// Extension trait for converting Option to RideMetricsError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a zone-index error.
    fn ok_or_zone_out_of_range(self, index: usize, num_zones: usize) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_zone_out_of_range(self, index: usize, num_zones: usize) -> Result<T> {
        self.ok_or(RideMetricsError::ZoneIndexOutOfRange { index, num_zones })
    }
}
