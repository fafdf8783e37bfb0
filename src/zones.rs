//! Power zone tables and time-in-zone binning.
//!
//! A zone table is a date-scoped set of zone ranges: each range applies to the
//! rides recorded between its start and end dates and splits power into
//! ascending buckets. The table carries a modification time so that cached
//! per-ride results can tell whether they predate the last configuration edit.
//!
//! ## Example
//! ```rust
//! use ride_metrics::zones::{bin_time_in_zone, PowerZones, ZoneConfig, ZoneRange, ZoneTable};
//! use ride_metrics::RidePayload;
//! use chrono::NaiveDate;
//!
//! let zones = PowerZones::new(ZoneConfig {
//!     ranges: vec![ZoneRange::with_bounds(250.0, vec![0.0, 100.0, 200.0])],
//! });
//! let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
//! let range = zones.range_for_date(date);
//!
//! let payload = RidePayload::from_watts(1.0, &[50.0, 150.0, 150.0, 250.0]);
//! let bins = bin_time_in_zone(&payload, &zones, range);
//! assert_eq!(bins, vec![1.0, 2.0, 1.0]);
//! ```

use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{Result, RideMetricsError};
use crate::RidePayload;

/// Identifier of a zone range within a zone table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeId(pub usize);

/// Query contract of a zone configuration source.
///
/// Implementations are read-only from the point of view of the metric core
/// and may be shared by many rides at once.
pub trait ZoneTable: Send + Sync {
    /// The range that applies to a ride recorded on `date`, if any.
    fn range_for_date(&self, date: NaiveDate) -> Option<RangeId>;

    /// Number of zones in a range.
    fn zone_count(&self, range: RangeId) -> usize;

    /// Zone a power value falls into within a range.
    fn zone_index(&self, range: RangeId, watts: f64) -> Option<usize>;

    /// When the table was last edited.
    fn modification_time(&self) -> DateTime<Utc>;

    /// Critical power of a range, for intensity-relative metrics.
    fn critical_power(&self, _range: RangeId) -> Option<f64> {
        None
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// One date-scoped zone range.
///
/// Zone `i` covers `[zone_starts[i], zone_starts[i + 1])`; the last zone has no
/// upper bound. A power value below the first bound is unzoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRange {
    /// First day the range applies to (inclusive), open when absent
    #[serde(default)]
    pub start: Option<NaiveDate>,
    /// First day the range no longer applies to (exclusive), open when absent
    #[serde(default)]
    pub end: Option<NaiveDate>,
    /// Critical power in watts
    pub critical_power: f64,
    /// Lower bound of each zone in watts, ascending
    pub zone_starts: Vec<f64>,
}

impl ZoneRange {
    /// Standard Coggan zone lower bounds as fractions of critical power
    pub const COGGAN_FRACTIONS: [f64; 7] = [0.0, 0.55, 0.75, 0.90, 1.05, 1.20, 1.50];

    /// Create an open-ended range with the standard seven Coggan zones.
    pub fn coggan(critical_power: f64) -> Self {
        let zone_starts = Self::COGGAN_FRACTIONS
            .iter()
            .map(|f| (critical_power * f).round())
            .collect();
        Self::with_bounds(critical_power, zone_starts)
    }

    /// Create an open-ended range with custom zone lower bounds.
    pub fn with_bounds(critical_power: f64, zone_starts: Vec<f64>) -> Self {
        Self {
            start: None,
            end: None,
            critical_power,
            zone_starts,
        }
    }

    /// Restrict the range to `[start, end)`.
    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Whether the range applies to a ride recorded on `date`.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date < e)
    }

    /// Zone a power value falls into.
    pub fn zone_for(&self, watts: f64) -> Option<usize> {
        self.zone_starts.iter().rposition(|&lo| watts >= lo)
    }

    fn validate(&self, index: usize) -> Result<()> {
        let invalid = |message: String| RideMetricsError::InvalidConfig {
            message: format!("zone range {}: {}", index, message),
        };

        if self.zone_starts.is_empty() {
            return Err(invalid("no zones".to_string()));
        }
        if !self.zone_starts.iter().all(|w| w.is_finite()) {
            return Err(invalid("non-finite zone bound".to_string()));
        }
        if self.zone_starts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid("zone bounds must be strictly ascending".to_string()));
        }
        if !(self.critical_power.is_finite() && self.critical_power > 0.0) {
            return Err(invalid(format!("critical power {} must be positive", self.critical_power)));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(invalid(format!("start {} is not before end {}", start, end)));
            }
        }
        Ok(())
    }
}

/// Serializable zone configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub ranges: Vec<ZoneRange>,
}

impl ZoneConfig {
    /// Check every range for well-formed bounds.
    pub fn validate(&self) -> Result<()> {
        self.ranges
            .iter()
            .enumerate()
            .try_for_each(|(i, range)| range.validate(i))
    }
}

// ============================================================================
// Power Zones
// ============================================================================

/// Date-scoped power zone table.
///
/// The ranges sit behind a lock so a table shared through `Arc` can still be
/// edited; every edit bumps the modification time.
#[derive(Debug)]
pub struct PowerZones {
    ranges: RwLock<Vec<ZoneRange>>,
    modified: RwLock<DateTime<Utc>>,
}

impl PowerZones {
    /// Create a table from a configuration, stamped with the current time.
    pub fn new(config: ZoneConfig) -> Self {
        Self {
            ranges: RwLock::new(config.ranges),
            modified: RwLock::new(Utc::now()),
        }
    }

    /// Parse and validate a JSON zone configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ZoneConfig =
            serde_json::from_str(json).map_err(|e| RideMetricsError::InvalidConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        info!("[Zones] Loaded {} zone ranges", config.ranges.len());
        Ok(Self::new(config))
    }

    /// Swap in a new configuration and mark the table modified.
    pub fn replace_ranges(&self, config: ZoneConfig) -> Result<()> {
        config.validate()?;
        let count = config.ranges.len();
        *self.ranges.write().unwrap_or_else(PoisonError::into_inner) = config.ranges;
        self.mark_modified();
        info!("[Zones] Replaced zone configuration ({} ranges)", count);
        Ok(())
    }

    /// Mark the table modified now.
    pub fn mark_modified(&self) {
        self.mark_modified_at(Utc::now());
    }

    /// Mark the table modified at a given time.
    pub fn mark_modified_at(&self, when: DateTime<Utc>) {
        *self.modified.write().unwrap_or_else(PoisonError::into_inner) = when;
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ZoneConfig {
        ZoneConfig {
            ranges: self.read_ranges().clone(),
        }
    }

    fn read_ranges(&self) -> RwLockReadGuard<'_, Vec<ZoneRange>> {
        self.ranges.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ZoneTable for PowerZones {
    fn range_for_date(&self, date: NaiveDate) -> Option<RangeId> {
        self.read_ranges()
            .iter()
            .position(|r| r.contains(date))
            .map(RangeId)
    }

    fn zone_count(&self, range: RangeId) -> usize {
        self.read_ranges()
            .get(range.0)
            .map_or(0, |r| r.zone_starts.len())
    }

    fn zone_index(&self, range: RangeId, watts: f64) -> Option<usize> {
        self.read_ranges().get(range.0).and_then(|r| r.zone_for(watts))
    }

    fn modification_time(&self) -> DateTime<Utc> {
        *self.modified.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn critical_power(&self, range: RangeId) -> Option<f64> {
        self.read_ranges().get(range.0).map(|r| r.critical_power)
    }
}

// ============================================================================
// Zone Context
// ============================================================================

/// Zone information handed to metrics while they compute.
#[derive(Clone, Copy)]
pub struct ZoneContext<'a> {
    pub table: &'a dyn ZoneTable,
    /// Range applying to the ride's date
    pub range: Option<RangeId>,
    pub num_zones: usize,
    /// Seconds spent in each zone, freshly binned for this computation
    pub time_in_zone: &'a [f64],
}

impl<'a> ZoneContext<'a> {
    pub fn new(table: &'a dyn ZoneTable, range: Option<RangeId>, time_in_zone: &'a [f64]) -> Self {
        Self {
            table,
            range,
            num_zones: range.map_or(0, |r| table.zone_count(r)),
            time_in_zone,
        }
    }

    /// Critical power of the active range.
    pub fn critical_power(&self) -> Option<f64> {
        self.range.and_then(|r| self.table.critical_power(r))
    }
}

// ============================================================================
// Time-in-zone Binning
// ============================================================================

/// Accumulate seconds spent in each zone of `range`.
///
/// Samples without power are skipped; a zone index outside the range's zone
/// count contributes nothing. Without a range the result is empty.
pub fn bin_time_in_zone(
    payload: &RidePayload,
    table: &dyn ZoneTable,
    range: Option<RangeId>,
) -> Vec<f64> {
    let range = match range {
        Some(r) => r,
        None => return Vec::new(),
    };
    let mut bins = vec![0.0; table.zone_count(range)];
    if bins.is_empty() {
        return bins;
    }

    let delta = payload.rec_int_secs;
    for sample in payload.samples.iter().filter(|s| s.has_power()) {
        if let Some(zone) = table.zone_index(range, sample.watts) {
            if let Some(bin) = bins.get_mut(zone) {
                *bin += delta;
            }
        }
    }
    bins
}

/// Accumulate time in zone using parallel processing.
/// More efficient for long rides (> 10,000 samples).
#[cfg(feature = "parallel")]
pub fn bin_time_in_zone_parallel(
    payload: &RidePayload,
    table: &dyn ZoneTable,
    range: Option<RangeId>,
) -> Vec<f64> {
    if payload.samples.len() < 10_000 {
        return bin_time_in_zone(payload, table, range);
    }
    let range = match range {
        Some(r) => r,
        None => return Vec::new(),
    };
    let num_zones = table.zone_count(range);
    let delta = payload.rec_int_secs;

    payload
        .samples
        .par_iter()
        .filter(|s| s.has_power())
        .fold(
            || vec![0.0; num_zones],
            |mut bins, sample| {
                if let Some(zone) = table.zone_index(range, sample.watts) {
                    if let Some(bin) = bins.get_mut(zone) {
                        *bin += delta;
                    }
                }
                bins
            },
        )
        .reduce(
            || vec![0.0; num_zones],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        )
}
