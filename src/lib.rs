//! # Ride Metrics
//!
//! Per-ride derived statistics for endurance-training analysis.
//!
//! This library provides:
//! - Dependency-ordered resolution of a catalog of named metrics
//! - Memoization of computed metrics, invalidated by zone-configuration changes
//! - Time-in-zone binning of power samples
//! - Lazy loading and explicit eviction of raw ride payloads
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel time-in-zone binning with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::NaiveDate;
//! use ride_metrics::{
//!     standard_catalog, LoadError, PowerZones, RideLocation, RidePayload, RideRecord,
//!     ZoneConfig, ZoneRange,
//! };
//!
//! let zones = Arc::new(PowerZones::new(ZoneConfig {
//!     ranges: vec![ZoneRange::coggan(250.0)],
//! }));
//! let loader = Arc::new(|_: &RideLocation| -> Result<RidePayload, LoadError> {
//!     Ok(RidePayload::from_watts(1.0, &[180.0; 600]))
//! });
//!
//! let start = NaiveDate::from_ymd_opt(2024, 5, 1)
//!     .unwrap()
//!     .and_hms_opt(7, 30, 0)
//!     .unwrap();
//! let mut ride = RideRecord::new(
//!     RideLocation::new("rides", "2024_05_01_07_30_00.json"),
//!     start,
//!     zones,
//!     standard_catalog(),
//!     loader,
//! );
//!
//! let avg = ride.metric_value("average_power").unwrap();
//! assert!((avg.value - 180.0).abs() < 1e-9);
//! assert_eq!(ride.num_zones(), 7);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, RideMetricsError, Unresolved};

// Zone tables, zone context and time-in-zone binning
pub mod zones;
#[cfg(feature = "parallel")]
pub use zones::bin_time_in_zone_parallel;
pub use zones::{
    bin_time_in_zone, PowerZones, RangeId, ZoneConfig, ZoneContext, ZoneRange, ZoneTable,
};

// Lazy payload lifecycle
pub mod cache;
pub use cache::{JsonRideLoader, LoadError, RideCache, RideLoader};

// Metric contracts and the in-process registry
pub mod catalog;
pub use catalog::{Metric, MetricCatalog, MetricRegistry};

// Standard metric set
pub mod builtin;
pub use builtin::standard_catalog;

// Dependency-ordered metric resolution
pub mod engine;
pub use engine::{MetricEngine, Resolution, UnresolvedMetric};

// Per-ride aggregate with memoized results
pub mod record;
pub use record::{Refresh, RideRecord};

// Collection of rides with bounded resident payloads
pub mod library;
pub use library::{LibraryConfig, RideLibrary};

// ============================================================================
// Core Types
// ============================================================================

/// One recorded sample of a ride.
///
/// A negative `watts` value means the sample carries no power data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RideSample {
    /// Seconds since the start of the ride
    pub secs: f64,
    /// Power in watts, negative when absent
    pub watts: f64,
}

impl RideSample {
    pub fn new(secs: f64, watts: f64) -> Self {
        Self { secs, watts }
    }

    /// Whether the sample carries a power reading.
    pub fn has_power(&self) -> bool {
        self.watts >= 0.0
    }
}

/// Raw ride data as produced by a ride-file loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RidePayload {
    /// Uniform recording interval in seconds
    pub rec_int_secs: f64,
    pub samples: Vec<RideSample>,
    /// User- or file-supplied values replacing computed metrics
    #[serde(default)]
    pub metric_overrides: HashMap<String, MetricValue>,
}

impl RidePayload {
    pub fn new(rec_int_secs: f64, samples: Vec<RideSample>) -> Self {
        Self {
            rec_int_secs,
            samples,
            metric_overrides: HashMap::new(),
        }
    }

    /// Build a payload from a power series recorded at a uniform interval.
    pub fn from_watts(rec_int_secs: f64, watts: &[f64]) -> Self {
        let samples = watts
            .iter()
            .enumerate()
            .map(|(i, &w)| RideSample::new(i as f64 * rec_int_secs, w))
            .collect();
        Self::new(rec_int_secs, samples)
    }

    /// Attach an override for a metric.
    pub fn with_override(mut self, name: &str, value: MetricValue) -> Self {
        self.metric_overrides.insert(name.to_string(), value);
        self
    }

    /// The override source for this ride.
    pub fn override_for(&self, name: &str) -> Option<&MetricValue> {
        self.metric_overrides.get(name)
    }

    /// Total recorded duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 * self.rec_int_secs
    }
}

/// Where a ride's raw file lives. Opaque to the computation core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RideLocation {
    pub dir: PathBuf,
    pub file_name: String,
}

impl RideLocation {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
        }
    }

    /// Full path of the ride file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

impl fmt::Display for RideLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Value of a computed (or overridden) metric.
///
/// `value` is the headline number; `fields` holds any derived values the
/// metric exposes alongside it (sample counts, per-zone seconds, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
}

impl MetricValue {
    /// A metric value with no derived fields.
    pub fn scalar(value: f64) -> Self {
        Self {
            value,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Metric results keyed by metric name.
pub type MetricMap = HashMap<String, MetricValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_watts_spacing() {
        let payload = RidePayload::from_watts(2.0, &[100.0, -1.0, 300.0]);
        assert_eq!(payload.samples.len(), 3);
        assert_eq!(payload.samples[2].secs, 4.0);
        assert!(!payload.samples[1].has_power());
        assert_eq!(payload.duration_secs(), 6.0);
    }

    #[test]
    fn test_overrides() {
        let payload = RidePayload::from_watts(1.0, &[100.0])
            .with_override("average_power", MetricValue::scalar(250.0));
        assert_eq!(payload.override_for("average_power").unwrap().value, 250.0);
        assert!(payload.override_for("total_work").is_none());
    }

    #[test]
    fn test_location_path() {
        let loc = RideLocation::new("/data/rides", "2024_05_01.json");
        assert_eq!(loc.path(), PathBuf::from("/data/rides/2024_05_01.json"));
        assert_eq!(loc.to_string(), "/data/rides/2024_05_01.json");
    }

    #[test]
    fn test_metric_value_fields_json() {
        let plain = serde_json::to_string(&MetricValue::scalar(1.5)).unwrap();
        assert_eq!(plain, r#"{"value":1.5}"#);

        let v = MetricValue::scalar(2.0).with_field("count", 10.0);
        assert_eq!(v.field("count"), Some(10.0));
        let back: MetricValue = serde_json::from_str(&serde_json::to_string(&v).unwrap()).unwrap();
        assert_eq!(back, v);
    }
}
