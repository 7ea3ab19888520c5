//! Seams to the external services the optimizer depends on.
//!
//! These are intentionally minimal. The HTTP adapters in [`crate::ors`] and
//! [`crate::osrm`] implement them; tests substitute in-memory fakes.

use serde::{Deserialize, Serialize};

use crate::error::{GeocodeError, RoutingError};
use crate::geo::Coordinate;
use crate::polyline::Polyline;

/// Turns a single-line address query into a coordinate.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, query: &str) -> Result<Coordinate, GeocodeError>;
}

/// Computes a road route between two coordinates.
pub trait RoutingService: Send + Sync {
    fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError>;
}

/// A single road leg as returned by a routing service.
///
/// This is also the value stored in the route cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub meters: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Polyline>,
}

impl RouteLeg {
    pub fn new(meters: f64) -> Self {
        Self {
            meters,
            duration_secs: None,
            geometry: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_secs = Some(seconds);
        self
    }

    pub fn with_geometry(mut self, geometry: Polyline) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// A leg fit for the route cache: finite, non-negative distance.
    pub fn is_usable(&self) -> bool {
        self.meters.is_finite() && self.meters >= 0.0
    }
}

impl<T: Geocoder + ?Sized> Geocoder for std::sync::Arc<T> {
    fn geocode(&self, query: &str) -> Result<Coordinate, GeocodeError> {
        (**self).geocode(query)
    }
}

impl<T: RoutingService + ?Sized> RoutingService for std::sync::Arc<T> {
    fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError> {
        (**self).route(from, to)
    }
}
