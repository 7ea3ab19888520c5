//! Haversine distance estimate (fallback when road routing is unavailable).
//!
//! Uses great-circle distance and an assumed driving speed.
//! Less accurate than a road network (ignores roads) but always available.

use tracing::warn;

use crate::geo::Coordinate;

/// Average driving speed assumption for time estimation.
const DEFAULT_SPEED_KMH: f64 = 40.0;

/// Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
pub fn haversine_meters(from: Coordinate, to: Coordinate) -> f64 {
    let lat1_rad = from.lat.to_radians();
    let lat2_rad = to.lat.to_radians();
    let delta_lat = (to.lat - from.lat).to_radians();
    let delta_lng = (to.lng - from.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points.
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * c
}

/// Haversine-based leg estimator.
///
/// Estimates travel time using straight-line distance and an assumed speed.
#[derive(Debug, Clone)]
pub struct HaversineEstimator {
    /// Assumed average driving speed in km/h. Always finite and positive.
    speed_kmh: f64,
}

impl Default for HaversineEstimator {
    fn default() -> Self {
        Self {
            speed_kmh: DEFAULT_SPEED_KMH,
        }
    }
}

impl HaversineEstimator {
    /// Non-finite or non-positive speeds fall back to the 40 km/h default.
    pub fn new(speed_kmh: f64) -> Self {
        if speed_kmh.is_finite() && speed_kmh > 0.0 {
            return Self { speed_kmh };
        }
        warn!(speed_kmh, default = DEFAULT_SPEED_KMH, "unusable fallback speed, using default");
        Self::default()
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    pub fn meters(&self, from: Coordinate, to: Coordinate) -> f64 {
        haversine_meters(from, to)
    }

    /// Convert a distance in meters to travel time in seconds.
    pub fn seconds_for(&self, meters: f64) -> f64 {
        let hours = meters / 1000.0 / self.speed_kmh;
        (hours * 3600.0).round()
    }
}
