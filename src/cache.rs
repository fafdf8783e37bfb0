//! # Ride Cache
//!
//! Lazy load / explicit evict lifecycle of one ride's raw payload.
//!
//! The payload is loaded on first access and kept until [`RideCache::evict`]
//! releases it. A failed load is never cached: the next access retries, since
//! a missing or unreadable file may be a transient condition.

use std::fs;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::error::{Result, RideMetricsError};
use crate::{RideLocation, RidePayload};

/// Failure reported by a ride-file loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .details.join("; "))]
pub struct LoadError {
    pub details: Vec<String>,
}

impl LoadError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            details: vec![detail.into()],
        }
    }
}

/// Produces the raw payload of a ride from its storage location.
pub trait RideLoader: Send + Sync {
    fn load(&self, location: &RideLocation) -> std::result::Result<RidePayload, LoadError>;
}

impl<F> RideLoader for F
where
    F: Fn(&RideLocation) -> std::result::Result<RidePayload, LoadError> + Send + Sync,
{
    fn load(&self, location: &RideLocation) -> std::result::Result<RidePayload, LoadError> {
        self(location)
    }
}

/// Loads payload snapshots stored as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRideLoader;

impl RideLoader for JsonRideLoader {
    fn load(&self, location: &RideLocation) -> std::result::Result<RidePayload, LoadError> {
        let path = location.path();
        let contents = fs::read_to_string(&path)
            .map_err(|e| LoadError::new(format!("failed to read {}: {}", path.display(), e)))?;
        let payload: RidePayload = serde_json::from_str(&contents)
            .map_err(|e| LoadError::new(format!("failed to parse {}: {}", path.display(), e)))?;

        if !(payload.rec_int_secs.is_finite() && payload.rec_int_secs > 0.0) {
            return Err(LoadError::new(format!(
                "{}: recording interval {} must be positive",
                path.display(),
                payload.rec_int_secs
            )));
        }
        Ok(payload)
    }
}

/// Owns the optionally loaded payload of one ride.
pub struct RideCache {
    location: RideLocation,
    loader: Arc<dyn RideLoader>,
    payload: Option<RidePayload>,
}

impl RideCache {
    pub fn new(location: RideLocation, loader: Arc<dyn RideLoader>) -> Self {
        Self {
            location,
            loader,
            payload: None,
        }
    }

    pub fn location(&self) -> &RideLocation {
        &self.location
    }

    /// Get the payload, loading it if absent.
    pub fn payload(&mut self) -> Result<&RidePayload> {
        let payload = match self.payload.take() {
            Some(p) => p,
            None => self.load()?,
        };
        Ok(self.payload.insert(payload))
    }

    /// Release the payload. Safe to call when nothing is loaded.
    ///
    /// Returns whether a payload was released.
    pub fn evict(&mut self) -> bool {
        let released = self.payload.take().is_some();
        if released {
            debug!("[RideCache] Evicted payload for {}", self.location);
        }
        released
    }

    pub fn is_loaded(&self) -> bool {
        self.payload.is_some()
    }

    fn load(&self) -> Result<RidePayload> {
        match self.loader.load(&self.location) {
            Ok(payload) => {
                debug!(
                    "[RideCache] Loaded {} ({} samples)",
                    self.location,
                    payload.samples.len()
                );
                Ok(payload)
            }
            Err(e) => {
                warn!("[RideCache] Failed to load {}: {}", self.location, e);
                Err(RideMetricsError::PayloadUnavailable {
                    location: self.location.to_string(),
                    details: e.details,
                })
            }
        }
    }
}
