//! Standard ride metrics.
//!
//! `skiba_relative_intensity` and `skiba_bike_score` depend on the critical
//! power of the zone range active on the ride's date, so they change whenever
//! the zone configuration does.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::catalog::{Metric, MetricRegistry};
use crate::zones::ZoneContext;
use crate::{MetricMap, MetricValue, RidePayload};

pub const WORKOUT_TIME: &str = "workout_time";
pub const TIME_RIDING: &str = "time_riding";
pub const TOTAL_WORK: &str = "total_work";
pub const AVERAGE_POWER: &str = "average_power";
pub const SKIBA_XPOWER: &str = "skiba_xpower";
pub const SKIBA_RELATIVE_INTENSITY: &str = "skiba_relative_intensity";
pub const SKIBA_BIKE_SCORE: &str = "skiba_bike_score";
pub const TIME_IN_ZONE: &str = "time_in_zone";

/// Process-wide standard catalog, built on first use
static STANDARD: Lazy<Arc<MetricRegistry>> = Lazy::new(|| {
    let mut registry = MetricRegistry::new();
    register_standard(&mut registry);
    Arc::new(registry)
});

/// Shared catalog holding the standard metrics.
pub fn standard_catalog() -> Arc<MetricRegistry> {
    STANDARD.clone()
}

/// Add the standard metrics to a registry.
pub fn register_standard(registry: &mut MetricRegistry) {
    registry
        .register_type::<WorkoutTime>(WORKOUT_TIME, &[])
        .register_type::<TimeRiding>(TIME_RIDING, &[])
        .register_type::<TotalWork>(TOTAL_WORK, &[])
        .register_type::<AveragePower>(AVERAGE_POWER, &[])
        .register_type::<XPower>(SKIBA_XPOWER, &[])
        .register_type::<RelativeIntensity>(SKIBA_RELATIVE_INTENSITY, &[SKIBA_XPOWER])
        .register_type::<BikeScore>(
            SKIBA_BIKE_SCORE,
            &[SKIBA_XPOWER, SKIBA_RELATIVE_INTENSITY, WORKOUT_TIME],
        )
        .register_type::<TimeInZone>(TIME_IN_ZONE, &[]);
}

fn value_of(computed: &MetricMap, name: &str) -> f64 {
    computed.get(name).map_or(0.0, |m| m.value)
}

/// Recorded duration in seconds.
#[derive(Debug, Default)]
pub struct WorkoutTime;

impl Metric for WorkoutTime {
    fn compute(&self, ride: &RidePayload, _: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        MetricValue::scalar(ride.duration_secs())
    }
}

/// Seconds spent pedalling (power above zero).
#[derive(Debug, Default)]
pub struct TimeRiding;

impl Metric for TimeRiding {
    fn compute(&self, ride: &RidePayload, _: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        let pedalling = ride.samples.iter().filter(|s| s.watts > 0.0).count();
        MetricValue::scalar(pedalling as f64 * ride.rec_int_secs)
    }
}

/// Mechanical work in kJ.
#[derive(Debug, Default)]
pub struct TotalWork;

impl Metric for TotalWork {
    fn compute(&self, ride: &RidePayload, _: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        let joules: f64 = ride
            .samples
            .iter()
            .filter(|s| s.has_power())
            .map(|s| s.watts * ride.rec_int_secs)
            .sum();
        MetricValue::scalar(joules / 1000.0)
    }
}

/// Mean power over samples that carry power.
#[derive(Debug, Default)]
pub struct AveragePower;

impl Metric for AveragePower {
    fn compute(&self, ride: &RidePayload, _: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        let (sum, count) = ride
            .samples
            .iter()
            .filter(|s| s.has_power())
            .fold((0.0, 0usize), |(sum, n), s| (sum + s.watts, n + 1));
        let avg = if count == 0 { 0.0 } else { sum / count as f64 };
        MetricValue::scalar(avg).with_field("count", count as f64)
    }
}

/// Skiba xPower: 25 s exponentially weighted power, fourth-power mean.
#[derive(Debug, Default)]
pub struct XPower;

impl XPower {
    const WINDOW_SECS: f64 = 25.0;
    const EPSILON: f64 = 0.1;
    const NEGLIGIBLE: f64 = 0.1;
}

impl Metric for XPower {
    fn compute(&self, ride: &RidePayload, _: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        let delta = ride.rec_int_secs;
        if ride.samples.is_empty() || delta <= 0.0 {
            return MetricValue::scalar(0.0);
        }

        let samples_per_window = Self::WINDOW_SECS / delta;
        let attenuation = samples_per_window / (samples_per_window + delta);
        let sample_weight = delta / (samples_per_window + delta);

        let mut last_secs = 0.0;
        let mut weighted = 0.0f64;
        let mut total = 0.0;
        let mut count = 0usize;

        for sample in &ride.samples {
            // Decay across recording gaps
            while weighted > Self::NEGLIGIBLE && sample.secs > last_secs + delta + Self::EPSILON {
                weighted *= attenuation;
                last_secs += delta;
                total += weighted.powi(4);
                count += 1;
            }
            weighted = weighted * attenuation + sample_weight * sample.watts.max(0.0);
            last_secs = sample.secs;
            total += weighted.powi(4);
            count += 1;
        }

        let xpower = (total / count as f64).powf(0.25);
        MetricValue::scalar(xpower).with_field("secs", count as f64 * delta)
    }
}

/// xPower relative to the critical power of the active zone range.
#[derive(Debug, Default)]
pub struct RelativeIntensity;

impl Metric for RelativeIntensity {
    fn compute(
        &self,
        _: &RidePayload,
        zones: &ZoneContext<'_>,
        computed: &MetricMap,
    ) -> MetricValue {
        let ri = match zones.critical_power() {
            Some(cp) if cp > 0.0 => value_of(computed, SKIBA_XPOWER) / cp,
            _ => 0.0,
        };
        MetricValue::scalar(ri)
    }
}

/// Skiba BikeScore: normalized work scaled by intensity, relative to an hour at CP.
#[derive(Debug, Default)]
pub struct BikeScore;

impl Metric for BikeScore {
    fn compute(
        &self,
        _: &RidePayload,
        zones: &ZoneContext<'_>,
        computed: &MetricMap,
    ) -> MetricValue {
        let score = match zones.critical_power() {
            Some(cp) if cp > 0.0 => {
                let normalized_work =
                    value_of(computed, SKIBA_XPOWER) * value_of(computed, WORKOUT_TIME);
                let raw = normalized_work * value_of(computed, SKIBA_RELATIVE_INTENSITY);
                raw / (cp * 3600.0) * 100.0
            }
            _ => 0.0,
        };
        MetricValue::scalar(score)
    }
}

/// Zoned seconds, with one `zN` field per zone.
#[derive(Debug, Default)]
pub struct TimeInZone;

impl Metric for TimeInZone {
    fn compute(&self, _: &RidePayload, zones: &ZoneContext<'_>, _: &MetricMap) -> MetricValue {
        zones.time_in_zone.iter().enumerate().fold(
            MetricValue::scalar(zones.time_in_zone.iter().sum()),
            |value, (i, secs)| value.with_field(&format!("z{}", i), *secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricCatalog;
    use crate::engine::MetricEngine;
    use crate::zones::{bin_time_in_zone, PowerZones, RangeId, ZoneConfig, ZoneRange, ZoneTable};

    fn compute_all(ride: &RidePayload, zones: &PowerZones, range: Option<RangeId>) -> MetricMap {
        let bins = bin_time_in_zone(ride, zones, range);
        let ctx = ZoneContext::new(zones, range, &bins);
        let catalog = standard_catalog();
        let resolution = MetricEngine::new(&*catalog).compute_all(ride, &ctx);
        assert!(resolution.unresolved.is_empty());
        resolution.metrics
    }

    #[test]
    fn test_standard_catalog_shape() {
        let catalog = standard_catalog();
        assert_eq!(catalog.names().len(), 8);
        assert_eq!(
            catalog.dependencies_of(SKIBA_BIKE_SCORE),
            vec![SKIBA_XPOWER, SKIBA_RELATIVE_INTENSITY, WORKOUT_TIME]
        );
        assert!(Arc::ptr_eq(&catalog, &standard_catalog()));
    }

    #[test]
    fn test_basic_metrics() {
        let zones = PowerZones::new(ZoneConfig::default());
        let ride = RidePayload::from_watts(2.0, &[100.0, 0.0, -1.0, 300.0]);
        let m = compute_all(&ride, &zones, None);

        assert_eq!(m[WORKOUT_TIME].value, 8.0);
        assert_eq!(m[TIME_RIDING].value, 4.0);
        assert!((m[TOTAL_WORK].value - 0.8).abs() < 1e-12);
        assert!((m[AVERAGE_POWER].value - 400.0 / 3.0).abs() < 1e-9);
        assert_eq!(m[AVERAGE_POWER].field("count"), Some(3.0));
    }

    #[test]
    fn test_steady_ride_scores() {
        let zones = PowerZones::new(ZoneConfig {
            ranges: vec![ZoneRange::coggan(250.0)],
        });
        let ride = RidePayload::from_watts(1.0, &vec![200.0; 3600]);
        let m = compute_all(&ride, &zones, Some(RangeId(0)));

        let xp = m[SKIBA_XPOWER].value;
        assert!((xp - 200.0).abs() < 2.0, "xpower {}", xp);
        assert_eq!(m[SKIBA_XPOWER].field("secs"), Some(3600.0));

        let ri = m[SKIBA_RELATIVE_INTENSITY].value;
        assert!((ri - xp / 250.0).abs() < 1e-12);

        let expected = xp * 3600.0 * ri / (250.0 * 3600.0) * 100.0;
        assert!((m[SKIBA_BIKE_SCORE].value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_intensity_without_range_is_zero() {
        let zones = PowerZones::new(ZoneConfig::default());
        let ride = RidePayload::from_watts(1.0, &vec![250.0; 120]);
        let m = compute_all(&ride, &zones, None);

        assert!(m[SKIBA_XPOWER].value > 0.0);
        assert_eq!(m[SKIBA_RELATIVE_INTENSITY].value, 0.0);
        assert_eq!(m[SKIBA_BIKE_SCORE].value, 0.0);
        assert_eq!(m[TIME_IN_ZONE].value, 0.0);
        assert!(m[TIME_IN_ZONE].fields.is_empty());
    }

    #[test]
    fn test_time_in_zone_metric() {
        let zones = PowerZones::new(ZoneConfig {
            ranges: vec![ZoneRange::with_bounds(250.0, vec![0.0, 100.0, 200.0])],
        });
        let range = zones.range_for_date(chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let ride = RidePayload::from_watts(1.0, &[50.0, 150.0, 250.0, 260.0, -1.0]);
        let m = compute_all(&ride, &zones, range);

        let tiz = &m[TIME_IN_ZONE];
        assert_eq!(tiz.value, 4.0);
        assert_eq!(tiz.field("z0"), Some(1.0));
        assert_eq!(tiz.field("z1"), Some(1.0));
        assert_eq!(tiz.field("z2"), Some(2.0));
    }

    #[test]
    fn test_xpower_decays_over_gaps() {
        let zones = PowerZones::new(ZoneConfig::default());
        let steady = RidePayload::from_watts(1.0, &vec![300.0; 60]);
        let mut gapped = steady.clone();
        for s in gapped.samples.iter_mut().skip(30) {
            s.secs += 120.0;
        }

        let xp_steady = compute_all(&steady, &zones, None)[SKIBA_XPOWER].clone();
        let xp_gapped = compute_all(&gapped, &zones, None)[SKIBA_XPOWER].clone();
        assert!(xp_gapped.value < xp_steady.value);
        assert!(xp_gapped.field("secs").unwrap() > xp_steady.field("secs").unwrap());
    }
}
