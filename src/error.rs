//! Error kinds for the resolver, distance, cache and planner layers.
//!
//! Per-stop and per-edge errors are recoverable and absorbed by the layer
//! above them. Only [`PlanError`] and [`CacheIoError`] reach the caller.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The rate limiter could not grant a call slot within the allowed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit exceeded, next slot in {retry_after:?}")]
pub struct RateLimitExceeded {
    pub retry_after: Duration,
}

/// An address could not be turned into a coordinate.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("address is empty after normalization")]
    EmptyAddress,

    #[error("address not found: {address}")]
    NotFound { address: String },

    #[error("geocoder returned an out-of-range coordinate ({lat}, {lng})")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("geocoding service error: {message}")]
    Service { message: String },
}

impl From<reqwest::Error> for GeocodeError {
    fn from(err: reqwest::Error) -> Self {
        GeocodeError::Service {
            message: err.to_string(),
        }
    }
}

/// A routing call failed. Always recoverable through the haversine fallback.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("routing request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("routing provider rejected the call with a rate-limit status")]
    RateLimited,

    #[error("no route between the given coordinates")]
    NoRoute,

    #[error("unexpected routing response: {0}")]
    InvalidResponse(String),

    #[error("routing provider skipped while the outage breaker is open")]
    Unavailable,
}

/// The persistent store could not be read or written.
#[derive(Debug, Error)]
pub enum CacheIoError {
    #[error("cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheIoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheIoError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid or missing configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Request-level failure of a route group.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("route {route_id}: none of the {excluded} stops could be resolved")]
    NoResolvableStops { route_id: String, excluded: usize },
}
