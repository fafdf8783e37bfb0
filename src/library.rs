//! # Ride Library
//!
//! Keyed collection of [`RideRecord`]s sharing one zone table, catalog and
//! loader, with a bound on how many raw payloads stay resident.
//!
//! Every query routed through the library marks the ride most recently used.
//! Once more than `max_resident_payloads` payloads are loaded, the least
//! recently used ride drops its payload. Its computed results stay cached, so
//! later queries only reload when the zone table has changed since.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::NaiveDateTime;
use log::{debug, info};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::cache::RideLoader;
use crate::catalog::MetricCatalog;
use crate::error::{Result, RideMetricsError};
use crate::record::{Refresh, RideRecord};
use crate::zones::ZoneTable;
use crate::{MetricValue, RideLocation};

/// Default number of payloads kept in memory.
pub const DEFAULT_MAX_RESIDENT_PAYLOADS: usize = 32;

/// Library tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Upper bound on simultaneously loaded ride payloads (at least 1)
    pub max_resident_payloads: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            max_resident_payloads: DEFAULT_MAX_RESIDENT_PAYLOADS,
        }
    }
}

impl LibraryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RideMetricsError::InvalidConfig {
            message: e.to_string(),
        })
    }

    fn capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.max_resident_payloads).ok_or_else(|| {
            RideMetricsError::InvalidConfig {
                message: "max_resident_payloads must be at least 1".to_string(),
            }
        })
    }
}

/// Collection of rides with bounded resident payloads.
pub struct RideLibrary {
    zones: Arc<dyn ZoneTable>,
    catalog: Arc<dyn MetricCatalog>,
    loader: Arc<dyn RideLoader>,
    rides: HashMap<String, RideRecord>,
    /// Ride ids whose payload is loaded, most recently used first
    resident: LruCache<String, ()>,
}

impl RideLibrary {
    pub fn new(
        config: LibraryConfig,
        zones: Arc<dyn ZoneTable>,
        catalog: Arc<dyn MetricCatalog>,
        loader: Arc<dyn RideLoader>,
    ) -> Result<Self> {
        let capacity = config.capacity()?;
        Ok(Self {
            zones,
            catalog,
            loader,
            rides: HashMap::new(),
            resident: LruCache::new(capacity),
        })
    }

    /// Register a ride. An existing ride with the same id is replaced.
    pub fn add_ride(&mut self, id: &str, location: RideLocation, start: NaiveDateTime) {
        let record = RideRecord::new(
            location,
            start,
            self.zones.clone(),
            self.catalog.clone(),
            self.loader.clone(),
        );
        if self.rides.insert(id.to_string(), record).is_some() {
            self.resident.pop(id);
            debug!("[RideLibrary] Replaced ride {}", id);
        }
    }

    pub fn remove_ride(&mut self, id: &str) -> Option<RideRecord> {
        self.resident.pop(id);
        self.rides.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RideRecord> {
        self.rides.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rides.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }

    /// Ride ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rides.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of rides whose payload is currently loaded.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Run `f` against a ride, then apply the residency bound.
    ///
    /// Returns `None` for an unknown id.
    pub fn with_ride<R>(&mut self, id: &str, f: impl FnOnce(&mut RideRecord) -> R) -> Option<R> {
        let record = self.rides.get_mut(id)?;
        let result = f(record);
        let loaded = record.is_payload_loaded();
        self.touch(id, loaded);
        Some(result)
    }

    pub fn ensure_fresh(&mut self, id: &str) -> Option<Result<Refresh>> {
        self.with_ride(id, |ride| ride.ensure_fresh())
    }

    pub fn metric_value(&mut self, id: &str, name: &str) -> Option<MetricValue> {
        self.with_ride(id, |ride| ride.metric_value(name).cloned())
            .flatten()
    }

    /// Seconds the ride spent in `zone`, 0 for unknown rides.
    pub fn time_in_zone(&mut self, id: &str, zone: usize) -> f64 {
        self.with_ride(id, |ride| ride.time_in_zone(zone))
            .unwrap_or(0.0)
    }

    pub fn num_zones(&mut self, id: &str) -> usize {
        self.with_ride(id, |ride| ride.num_zones()).unwrap_or(0)
    }

    /// Release one ride's payload.
    pub fn evict_payload(&mut self, id: &str) -> bool {
        self.resident.pop(id);
        self.rides
            .get_mut(id)
            .map(|ride| ride.evict_payload())
            .unwrap_or(false)
    }

    /// Release every resident payload. Returns how many were released.
    pub fn evict_all_payloads(&mut self) -> usize {
        let released = self
            .rides
            .values_mut()
            .map(|ride| ride.evict_payload())
            .filter(|&released| released)
            .count();
        self.resident.clear();
        info!("[RideLibrary] Evicted {} payloads", released);
        released
    }

    fn touch(&mut self, id: &str, loaded: bool) {
        if !loaded {
            self.resident.pop(id);
            return;
        }
        if let Some((displaced, ())) = self.resident.push(id.to_string(), ()) {
            if displaced != id {
                if let Some(ride) = self.rides.get_mut(&displaced) {
                    ride.evict_payload();
                    debug!(
                        "[RideLibrary] Evicted least recently used payload {}",
                        displaced
                    );
                }
            }
        }
    }
}
