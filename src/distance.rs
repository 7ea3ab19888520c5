//! Distance provider: route cache, then rate-limited routing API, then
//! haversine.
//!
//! [`DistanceProvider::distance`] never fails. Each step is a fallback for the
//! one before it, trading accuracy for availability:
//!
//! 1. the route cache, keyed by the directional rounded coordinate pair;
//! 2. the routing service, behind the shared rate limiter and the outage
//!    breaker, with successful legs written to the route cache;
//! 3. a great-circle estimate, which is never written to the route cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::PersistentCache;
use crate::config::BreakerConfig;
use crate::error::RoutingError;
use crate::geo::Coordinate;
use crate::haversine::HaversineEstimator;
use crate::polyline::Polyline;
use crate::rate_limit::{RateLimiter, lock};
use crate::traits::{RouteLeg, RoutingService};

/// Where a distance value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    /// Both ends round to the same cache key.
    SamePoint,
    Cache,
    Api,
    /// Great-circle estimate; not a road distance.
    Haversine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Distance {
    pub meters: f64,
    pub duration_secs: Option<f64>,
    pub geometry: Option<Polyline>,
    pub source: DistanceSource,
}

impl Distance {
    fn from_leg(leg: RouteLeg, source: DistanceSource) -> Self {
        Self {
            meters: leg.meters,
            duration_secs: leg.duration_secs,
            geometry: leg.geometry,
            source,
        }
    }
}

/// Counters since the provider was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistanceStats {
    pub cache_hits: u64,
    pub api_calls: u64,
    pub fallbacks: u64,
}

/// State of the routing outage breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are skipped until the cooldown ends.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Duration,
}

pub struct DistanceProvider<R> {
    routing: R,
    cache: Arc<PersistentCache<RouteLeg>>,
    limiter: Arc<RateLimiter>,
    max_wait: Duration,
    assume_symmetric: bool,
    estimator: HaversineEstimator,
    breaker_config: BreakerConfig,
    breaker: Mutex<Breaker>,
    cache_hits: AtomicU64,
    api_calls: AtomicU64,
    fallbacks: AtomicU64,
}

impl<R: RoutingService> DistanceProvider<R> {
    pub fn new(
        routing: R,
        cache: Arc<PersistentCache<RouteLeg>>,
        limiter: Arc<RateLimiter>,
        max_wait: Duration,
    ) -> Self {
        Self {
            routing,
            cache,
            limiter,
            max_wait,
            assume_symmetric: false,
            estimator: HaversineEstimator::default(),
            breaker_config: BreakerConfig::default(),
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: Duration::ZERO,
            }),
            cache_hits: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn with_symmetric_lookup(mut self, assume_symmetric: bool) -> Self {
        self.assume_symmetric = assume_symmetric;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_estimator(mut self, estimator: HaversineEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Travel distance for the leg `from -> to`. Always finite and
    /// non-negative.
    pub fn distance(&self, from: Coordinate, to: Coordinate) -> Distance {
        let key = from.pair_key(&to);
        if from.key() == to.key() {
            return Distance {
                meters: 0.0,
                duration_secs: Some(0.0),
                geometry: None,
                source: DistanceSource::SamePoint,
            };
        }

        if let Some(leg) = self.cached(&key, from, to) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Distance::from_leg(leg, DistanceSource::Cache);
        }

        match self.fetch(from, to) {
            Ok(leg) => {
                if let Err(err) = self.cache.put(&key, leg.clone()) {
                    warn!(key = %key, error = %err, "route leg not persisted");
                }
                Distance::from_leg(leg, DistanceSource::Api)
            }
            Err(reason) => {
                debug!(key = %key, reason = %reason, "using haversine estimate");
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                let meters = self.estimator.meters(from, to);
                Distance {
                    meters,
                    duration_secs: Some(self.estimator.seconds_for(meters)),
                    geometry: None,
                    source: DistanceSource::Haversine,
                }
            }
        }
    }

    pub fn meters(&self, from: Coordinate, to: Coordinate) -> f64 {
        self.distance(from, to).meters
    }

    pub fn stats(&self) -> DistanceStats {
        DistanceStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        lock(&self.breaker).state
    }

    fn cached(&self, key: &str, from: Coordinate, to: Coordinate) -> Option<RouteLeg> {
        if let Some(leg) = self.cache.get(key) {
            return Some(leg);
        }
        if !self.assume_symmetric {
            return None;
        }

        let mut leg = self.cache.get(&to.pair_key(&from))?;
        leg.geometry = leg.geometry.map(|geometry| {
            let mut points = geometry.into_points();
            points.reverse();
            Polyline::new(points)
        });
        Some(leg)
    }

    fn fetch(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, FetchFailure> {
        if !self.allow_call() {
            return Err(FetchFailure::Routing(RoutingError::Unavailable));
        }
        if let Err(err) = self.limiter.acquire_within(self.max_wait) {
            self.release_trial();
            return Err(FetchFailure::RateLimited(err.retry_after));
        }

        self.api_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.routing.route(from, to).and_then(|leg| {
            if leg.is_usable() {
                Ok(leg)
            } else {
                Err(RoutingError::InvalidResponse(format!(
                    "unusable distance {}",
                    leg.meters
                )))
            }
        });

        match result {
            Ok(leg) => {
                self.record_success();
                Ok(leg)
            }
            Err(err) => {
                warn!(from = %from, to = %to, error = %err, "routing call failed");
                self.record_failure();
                Err(FetchFailure::Routing(err))
            }
        }
    }

    fn allow_call(&self) -> bool {
        let mut breaker = lock(&self.breaker);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let now = self.limiter.clock().now();
                if now.saturating_sub(breaker.opened_at) >= self.breaker_config.cooldown {
                    debug!("routing breaker half-open, letting one trial call through");
                    breaker.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Returns an unused trial call so the next request can try again.
    fn release_trial(&self) {
        let mut breaker = lock(&self.breaker);
        if breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Open;
        }
    }

    fn record_success(&self) {
        let mut breaker = lock(&self.breaker);
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
    }

    fn record_failure(&self) {
        let mut breaker = lock(&self.breaker);
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);

        let trip = match breaker.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                breaker.consecutive_failures >= self.breaker_config.failure_threshold
            }
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                failures = breaker.consecutive_failures,
                cooldown = ?self.breaker_config.cooldown,
                "routing breaker open, using haversine estimates"
            );
            breaker.state = CircuitState::Open;
            breaker.opened_at = self.limiter.clock().now();
        }
    }
}

enum FetchFailure {
    Routing(RoutingError),
    RateLimited(Duration),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Routing(err) => err.fmt(f),
            FetchFailure::RateLimited(retry_after) => {
                write!(f, "no rate limit slot, next in {:?}", retry_after)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::RateLimitConfig;
    use crate::haversine::haversine_meters;
    use crate::rate_limit::ManualClock;

    /// Returns 1.3x the great-circle distance, or fails when switched off.
    struct FakeRouting {
        up: AtomicBool,
        calls: AtomicU64,
    }

    impl FakeRouting {
        fn new(up: bool) -> Self {
            Self {
                up: AtomicBool::new(up),
                calls: AtomicU64::new(0),
            }
        }
    }

    impl RoutingService for FakeRouting {
        fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.up.load(Ordering::Relaxed) {
                Ok(RouteLeg::new(haversine_meters(from, to) * 1.3).with_duration(60.0))
            } else {
                Err(RoutingError::InvalidResponse("503".to_string()))
            }
        }
    }

    fn provider(routing: FakeRouting, max_calls: usize) -> (DistanceProvider<FakeRouting>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig {
                max_calls,
                ..RateLimitConfig::default()
            },
            clock.clone(),
        ));
        let cache = Arc::new(PersistentCache::in_memory("routes"));
        (
            DistanceProvider::new(routing, cache, limiter, Duration::from_secs(2)),
            clock,
        )
    }

    const A: Coordinate = Coordinate::new(52.3764, 4.8979);
    const B: Coordinate = Coordinate::new(52.3600, 4.8852);

    #[test]
    fn test_api_result_is_cached() {
        let (provider, _) = provider(FakeRouting::new(true), 35);

        let first = provider.distance(A, B);
        let second = provider.distance(A, B);

        assert_eq!(first.source, DistanceSource::Api);
        assert_eq!(second.source, DistanceSource::Cache);
        assert_eq!(first.meters, second.meters);
        assert_eq!(provider.routing.calls.load(Ordering::Relaxed), 1);
        assert_eq!(
            provider.stats(),
            DistanceStats {
                cache_hits: 1,
                api_calls: 1,
                fallbacks: 0
            }
        );
    }

    #[test]
    fn test_directions_cached_independently() {
        let (provider, _) = provider(FakeRouting::new(true), 35);
        provider.distance(A, B);
        assert_eq!(provider.distance(B, A).source, DistanceSource::Api);
        assert_eq!(provider.cache.len(), 2);
    }

    #[test]
    fn test_symmetric_lookup_reuses_reverse_leg() {
        let (provider, _) = provider(FakeRouting::new(true), 35);
        let provider = provider.with_symmetric_lookup(true);
        provider.distance(A, B);
        assert_eq!(provider.distance(B, A).source, DistanceSource::Cache);
        assert_eq!(provider.cache.len(), 1);
    }

    #[test]
    fn test_failure_falls_back_and_is_not_cached() {
        let (provider, _) = provider(FakeRouting::new(false), 35);

        let distance = provider.distance(A, B);

        assert_eq!(distance.source, DistanceSource::Haversine);
        assert!(distance.meters.is_finite() && distance.meters >= 0.0);
        assert!((distance.meters - haversine_meters(A, B)).abs() < 1e-9);
        assert!(provider.cache.is_empty());
        assert_eq!(provider.stats().fallbacks, 1);
    }

    #[test]
    fn test_exhausted_budget_falls_back_without_waiting() {
        let (provider, clock) = provider(FakeRouting::new(true), 1);

        assert_eq!(provider.distance(A, B).source, DistanceSource::Api);
        assert_eq!(provider.distance(B, A).source, DistanceSource::Haversine);
        assert_eq!(clock.total_slept(), Duration::ZERO);
        assert_eq!(provider.routing.calls.load(Ordering::Relaxed), 1);
        assert_eq!(provider.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_same_point_skips_everything() {
        let (provider, _) = provider(FakeRouting::new(true), 35);
        let distance = provider.distance(A, Coordinate::new(A.lat + 1e-7, A.lng));
        assert_eq!(distance.source, DistanceSource::SamePoint);
        assert_eq!(distance.meters, 0.0);
        assert_eq!(provider.stats(), DistanceStats::default());
    }

    #[test]
    fn test_breaker_opens_and_recovers() {
        let (provider, clock) = provider(FakeRouting::new(false), 1000);
        let provider = provider.with_breaker(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        });
        let points: Vec<Coordinate> = (0..8)
            .map(|i| Coordinate::new(52.0 + f64::from(i) * 0.01, 4.9))
            .collect();

        for pair in points.windows(2) {
            provider.distance(pair[0], pair[1]);
        }
        assert_eq!(provider.circuit_state(), CircuitState::Open);
        assert_eq!(provider.routing.calls.load(Ordering::Relaxed), 3);
        assert_eq!(provider.stats().fallbacks, 7);

        // Cooldown elapsed, provider back up: trial call succeeds and closes.
        clock.advance(Duration::from_secs(30));
        provider.routing.up.store(true, Ordering::Relaxed);
        assert_eq!(provider.distance(points[0], points[7]).source, DistanceSource::Api);
        assert_eq!(provider.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens_breaker() {
        let (provider, clock) = provider(FakeRouting::new(false), 1000);
        let provider = provider.with_breaker(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
        });

        provider.distance(A, B);
        assert_eq!(provider.circuit_state(), CircuitState::Open);

        clock.advance(Duration::from_secs(31));
        provider.distance(B, A);
        assert_eq!(provider.circuit_state(), CircuitState::Open);
        assert_eq!(provider.routing.calls.load(Ordering::Relaxed), 2);

        // Still inside the new cooldown.
        clock.advance(Duration::from_secs(10));
        provider.distance(B, A);
        assert_eq!(provider.routing.calls.load(Ordering::Relaxed), 2);
    }
}
