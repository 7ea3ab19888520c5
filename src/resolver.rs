//! GeoPoint resolver: normalized address -> coordinate, cache first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::PersistentCache;
use crate::error::GeocodeError;
use crate::geo::{Coordinate, normalize_address};
use crate::rate_limit::RateLimiter;
use crate::traits::Geocoder;

pub struct GeoResolver<G> {
    geocoder: G,
    cache: Arc<PersistentCache<Coordinate>>,
    limiter: Arc<RateLimiter>,
    max_wait: Duration,
    external_calls: AtomicU64,
}

impl<G: Geocoder> GeoResolver<G> {
    pub fn new(
        geocoder: G,
        cache: Arc<PersistentCache<Coordinate>>,
        limiter: Arc<RateLimiter>,
        max_wait: Duration,
    ) -> Self {
        Self {
            geocoder,
            cache,
            limiter,
            max_wait,
            external_calls: AtomicU64::new(0),
        }
    }

    /// Resolves an address, normalizing it first.
    ///
    /// A cache hit returns without touching the rate limiter. A miss waits
    /// for a rate-limit slot, calls the geocoder and stores the result.
    pub fn resolve(&self, address: &str) -> Result<Coordinate, GeocodeError> {
        let key = normalize_address(address);
        if key.is_empty() {
            return Err(GeocodeError::EmptyAddress);
        }

        if let Some(coordinate) = self.cache.get(&key) {
            debug!(key = %key, "geocode cache hit");
            return Ok(coordinate);
        }

        self.limiter.acquire_within(self.max_wait)?;
        self.external_calls.fetch_add(1, Ordering::Relaxed);
        let coordinate = self.geocoder.geocode(&key)?;
        if !coordinate.is_valid() {
            return Err(GeocodeError::InvalidCoordinate {
                lat: coordinate.lat,
                lng: coordinate.lng,
            });
        }

        if let Err(err) = self.cache.put(&key, coordinate) {
            warn!(key = %key, error = %err, "geocode not persisted");
        }
        debug!(key = %key, %coordinate, "geocoded");

        Ok(coordinate)
    }

    /// Geocoder calls made by this resolver so far.
    pub fn external_calls(&self) -> u64 {
        self.external_calls.load(Ordering::Relaxed)
    }
}
