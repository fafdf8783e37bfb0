//! # Ride Record
//!
//! Per-ride aggregate holding memoized metric results and time-in-zone bins.
//!
//! Both caches share one staleness check: they are fresh while the last
//! successful computation is at least as recent as the zone table's
//! modification time. Every query checks freshness first, so callers never
//! need an explicit recompute. The raw payload can be evicted at any time
//! without touching the cached results.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, info, warn};

use crate::cache::{RideCache, RideLoader};
use crate::catalog::MetricCatalog;
use crate::engine::{MetricEngine, UnresolvedMetric};
use crate::error::{OptionExt, Result};
use crate::zones::{RangeId, ZoneContext, ZoneTable};
use crate::{MetricMap, MetricValue, RideLocation};

#[cfg(not(feature = "parallel"))]
use crate::zones::bin_time_in_zone;
#[cfg(feature = "parallel")]
use crate::zones::bin_time_in_zone_parallel;

/// What [`RideRecord::ensure_fresh`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Cached results were still fresh
    Cached,
    /// Results were recomputed from the payload
    Recomputed,
}

/// One ride and its derived statistics.
pub struct RideRecord {
    start: NaiveDateTime,
    zones: Arc<dyn ZoneTable>,
    catalog: Arc<dyn MetricCatalog>,
    cache: RideCache,

    // User-visible "unsaved changes" flag, owned by the editing layer
    dirty: bool,

    // Derived caches, replaced together on each computation
    metrics: MetricMap,
    time_in_zone: Vec<f64>,
    unresolved: Vec<UnresolvedMetric>,
    last_computed_at: Option<DateTime<Utc>>,
}

impl RideRecord {
    /// Create a record for a discovered ride. Nothing is loaded or computed yet.
    pub fn new(
        location: RideLocation,
        start: NaiveDateTime,
        zones: Arc<dyn ZoneTable>,
        catalog: Arc<dyn MetricCatalog>,
        loader: Arc<dyn RideLoader>,
    ) -> Self {
        Self {
            start,
            zones,
            catalog,
            cache: RideCache::new(location, loader),
            dirty: false,
            metrics: MetricMap::new(),
            time_in_zone: Vec::new(),
            unresolved: Vec::new(),
            last_computed_at: None,
        }
    }

    pub fn location(&self) -> &RideLocation {
        self.cache.location()
    }

    /// When the ride took place.
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Zone range applying to the ride's date.
    pub fn zone_range(&self) -> Option<RangeId> {
        self.zones.range_for_date(self.start.date())
    }

    /// Whether the cached results postdate the last zone-table change.
    pub fn is_fresh(&self) -> bool {
        matches!(self.last_computed_at, Some(t) if t >= self.zones.modification_time())
    }

    /// Recompute metrics and time in zone if the cached results are stale.
    ///
    /// When the payload cannot be loaded the previous results stay in place,
    /// the record stays stale and the next query retries.
    pub fn ensure_fresh(&mut self) -> Result<Refresh> {
        if self.is_fresh() {
            return Ok(Refresh::Cached);
        }

        let started = Utc::now();
        let payload = self.cache.payload()?;
        let range = self.zones.range_for_date(self.start.date());

        #[cfg(feature = "parallel")]
        let bins = bin_time_in_zone_parallel(payload, &*self.zones, range);
        #[cfg(not(feature = "parallel"))]
        let bins = bin_time_in_zone(payload, &*self.zones, range);

        let ctx = ZoneContext::new(&*self.zones, range, &bins);
        let resolution = MetricEngine::new(&*self.catalog).compute_all(payload, &ctx);

        info!(
            "[RideRecord] Computed {} metrics for {} ({} zones, {} unresolvable)",
            resolution.metrics.len(),
            self.cache.location(),
            bins.len(),
            resolution.unresolved.len()
        );

        self.metrics = resolution.metrics;
        self.unresolved = resolution.unresolved;
        self.time_in_zone = bins;
        self.last_computed_at = Some(started);
        Ok(Refresh::Recomputed)
    }

    /// Value of a metric, absent if it could not be computed.
    pub fn metric_value(&mut self, name: &str) -> Option<&MetricValue> {
        self.refresh();
        self.metrics.get(name)
    }

    /// All computed metrics.
    pub fn metrics(&mut self) -> &MetricMap {
        self.refresh();
        &self.metrics
    }

    /// Metrics excluded from the last computation.
    pub fn unresolved(&self) -> &[UnresolvedMetric] {
        &self.unresolved
    }

    /// Number of zones in the ride's range, 0 if no range applies.
    pub fn num_zones(&mut self) -> usize {
        self.refresh();
        self.time_in_zone.len()
    }

    /// Seconds spent in `zone`.
    ///
    /// Callers should stay within `0..num_zones()`; anything else reads as 0.
    pub fn time_in_zone(&mut self, zone: usize) -> f64 {
        match self.try_time_in_zone(zone) {
            Ok(secs) => secs,
            Err(e) => {
                if !self.time_in_zone.is_empty() {
                    warn!("[RideRecord] {} for {}", e, self.cache.location());
                }
                0.0
            }
        }
    }

    /// Seconds spent in `zone`, reporting out-of-range queries.
    ///
    /// Like the other queries this serves the last computed bins when the
    /// payload cannot be reloaded.
    pub fn try_time_in_zone(&mut self, zone: usize) -> Result<f64> {
        self.refresh();
        self.time_in_zone
            .get(zone)
            .copied()
            .ok_or_zone_out_of_range(zone, self.time_in_zone.len())
    }

    /// Release the raw payload. Cached results stay valid.
    pub fn evict_payload(&mut self) -> bool {
        self.cache.evict()
    }

    pub fn is_payload_loaded(&self) -> bool {
        self.cache.is_loaded()
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// When metrics were last computed, `None` if never.
    pub fn last_computed_at(&self) -> Option<DateTime<Utc>> {
        self.last_computed_at
    }

    /// Computed metrics as a JSON object keyed by metric name.
    pub fn metrics_json(&mut self) -> String {
        let sorted: BTreeMap<&String, &MetricValue> = self.metrics().iter().collect();
        serde_json::to_string(&sorted).unwrap_or_else(|_| "{}".to_string())
    }

    fn refresh(&mut self) {
        if let Err(e) = self.ensure_fresh() {
            debug!("[RideRecord] Serving cached results: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LoadError;
    use crate::catalog::MetricRegistry;
    use crate::error::RideMetricsError;
    use crate::zones::{PowerZones, ZoneConfig, ZoneRange};
    use crate::RidePayload;
    use chrono::{Duration, NaiveDate};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubLoader {
        loads: AtomicUsize,
        failing: AtomicBool,
        payload: RidePayload,
    }

    impl StubLoader {
        fn new(payload: RidePayload) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                payload,
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl RideLoader for StubLoader {
        fn load(&self, _: &RideLocation) -> std::result::Result<RidePayload, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(LoadError::new("file vanished"))
            } else {
                Ok(self.payload.clone())
            }
        }
    }

    struct Fixture {
        zones: Arc<PowerZones>,
        loader: Arc<StubLoader>,
        computes: Arc<AtomicUsize>,
        record: RideRecord,
    }

    fn ride_start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn fixture(payload: RidePayload, ranges: Vec<ZoneRange>) -> Fixture {
        let zones = Arc::new(PowerZones::new(ZoneConfig { ranges }));
        let loader = StubLoader::new(payload);
        let computes = Arc::new(AtomicUsize::new(0));

        let mut registry = MetricRegistry::new();
        let counter = computes.clone();
        registry
            .register_fn("A", &[], move |ride, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                MetricValue::scalar(ride.samples.len() as f64)
            })
            .register_fn("B", &["A"], |_, zones, done| {
                MetricValue::scalar(done["A"].value + zones.num_zones as f64)
            });

        let record = RideRecord::new(
            RideLocation::new("rides", "morning.json"),
            ride_start(),
            zones.clone(),
            Arc::new(registry),
            loader.clone(),
        );
        Fixture {
            zones,
            loader,
            computes,
            record,
        }
    }

    fn three_zones() -> Vec<ZoneRange> {
        vec![ZoneRange::with_bounds(250.0, vec![0.0, 100.0, 200.0])]
    }

    fn scenario_payload() -> RidePayload {
        RidePayload::from_watts(
            1.0,
            &[100.0, 150.0, 200.0, 250.0, 300.0, 50.0, 0.0, 400.0, 120.0, 180.0],
        )
    }

    #[test]
    fn test_computes_once_until_zones_change() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert!(f.record.last_computed_at().is_none());

        assert_eq!(f.record.ensure_fresh().unwrap(), Refresh::Recomputed);
        assert_eq!(f.record.ensure_fresh().unwrap(), Refresh::Cached);
        assert_eq!(f.record.metric_value("B").unwrap().value, 13.0);
        assert_eq!(f.loader.loads(), 1);
        assert_eq!(f.computes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zone_change_invalidates() {
        let mut f = fixture(scenario_payload(), three_zones());
        f.record.ensure_fresh().unwrap();
        let first = f.record.last_computed_at().unwrap();

        f.zones.mark_modified_at(first + Duration::milliseconds(1));
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(!f.record.is_fresh());
        assert_eq!(f.record.ensure_fresh().unwrap(), Refresh::Recomputed);
        assert_eq!(f.record.ensure_fresh().unwrap(), Refresh::Cached);
        assert_eq!(f.computes.load(Ordering::SeqCst), 2);
        // Payload stayed resident, so no second load
        assert_eq!(f.loader.loads(), 1);
    }

    #[test]
    fn test_eviction_keeps_results() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert_eq!(f.record.num_zones(), 3);
        assert!(f.record.is_payload_loaded());

        assert!(f.record.evict_payload());
        assert!(!f.record.is_payload_loaded());
        assert!(!f.record.evict_payload());

        assert_eq!(f.record.time_in_zone(1), 4.0);
        assert_eq!(f.record.metric_value("A").unwrap().value, 10.0);
        assert!(!f.record.is_payload_loaded());
        assert_eq!(f.loader.loads(), 1);
    }

    #[test]
    fn test_time_in_zone_bins() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert_eq!(f.record.zone_range(), Some(RangeId(0)));
        let bins: Vec<f64> = (0..f.record.num_zones())
            .map(|z| f.record.time_in_zone(z))
            .collect();
        assert_eq!(bins, vec![2.0, 4.0, 4.0]);
        assert_eq!(bins.iter().sum::<f64>(), 10.0);
    }

    #[test]
    fn test_out_of_range_zone_query() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert_eq!(f.record.time_in_zone(3), 0.0);
        assert!(matches!(
            f.record.try_time_in_zone(3),
            Err(RideMetricsError::ZoneIndexOutOfRange {
                index: 3,
                num_zones: 3
            })
        ));
    }

    #[test]
    fn test_no_zone_range() {
        let later = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let ranges = vec![ZoneRange::coggan(250.0).between(Some(later), None)];
        let mut f = fixture(scenario_payload(), ranges);

        assert_eq!(f.record.zone_range(), None);
        assert_eq!(f.record.num_zones(), 0);
        assert_eq!(f.record.time_in_zone(0), 0.0);
        assert_eq!(f.record.time_in_zone(4), 0.0);
        // Metrics still compute without zones
        assert_eq!(f.record.metric_value("B").unwrap().value, 10.0);
    }

    #[test]
    fn test_unavailable_payload() {
        let mut f = fixture(scenario_payload(), three_zones());
        f.loader.failing.store(true, Ordering::SeqCst);

        assert!(f.record.metric_value("A").is_none());
        assert!(f.record.metric_value("B").is_none());
        assert_eq!(f.record.num_zones(), 0);
        assert_eq!(f.record.time_in_zone(0), 0.0);
        assert!(f.record.last_computed_at().is_none());
        assert!(matches!(
            f.record.ensure_fresh(),
            Err(RideMetricsError::PayloadUnavailable { .. })
        ));

        // Each query retried the load
        assert!(f.loader.loads() >= 5);

        f.loader.failing.store(false, Ordering::SeqCst);
        assert_eq!(f.record.metric_value("A").unwrap().value, 10.0);
    }

    #[test]
    fn test_failed_reload_keeps_previous_results() {
        let mut f = fixture(scenario_payload(), three_zones());
        f.record.ensure_fresh().unwrap();
        let first = f.record.last_computed_at();
        f.record.evict_payload();

        f.loader.failing.store(true, Ordering::SeqCst);
        f.zones.mark_modified_at(first.unwrap() + Duration::milliseconds(1));

        assert!(f.record.ensure_fresh().is_err());
        assert_eq!(f.record.last_computed_at(), first);
        assert_eq!(f.record.metric_value("A").unwrap().value, 10.0);
        assert_eq!(f.record.num_zones(), 3);

        // Bins agree with the zone count and the retained metrics
        assert_eq!(f.record.time_in_zone(1), 4.0);
        assert_eq!(f.record.try_time_in_zone(2).unwrap(), 4.0);
        let total: f64 = (0..f.record.num_zones())
            .map(|z| f.record.time_in_zone(z))
            .sum();
        assert_eq!(total, 10.0);
        assert!(!f.record.is_fresh());
    }

    #[test]
    fn test_dirty_flag_is_plain_state() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert!(!f.record.is_dirty());
        f.record.set_dirty(true);
        assert!(f.record.is_dirty());
        assert_eq!(f.loader.loads(), 0);
        f.record.set_dirty(false);
        assert!(!f.record.is_dirty());
    }

    #[test]
    fn test_metrics_json() {
        let mut f = fixture(scenario_payload(), three_zones());
        assert_eq!(
            f.record.metrics_json(),
            r#"{"A":{"value":10.0},"B":{"value":13.0}}"#
        );
    }
}
