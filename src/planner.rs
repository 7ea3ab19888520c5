//! Route optimization orchestrator.
//!
//! [`Planner`] is the context object constructed once at process start. It
//! owns the shared rate limiter, both cache stores, the resolver and the
//! distance provider, and optimizes every route group of a request
//! independently.
//!
//! Failures are absorbed as close to their source as possible: a stop that
//! cannot be geocoded is excluded and reported, a leg that cannot be routed is
//! estimated. Only a group with no resolvable stop at all fails.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheStores;
use crate::config::PlannerConfig;
use crate::distance::{Distance, DistanceProvider, DistanceSource, DistanceStats};
use crate::error::{GeocodeError, PlanError};
use crate::geo::{Address, Coordinate};
use crate::haversine::HaversineEstimator;
use crate::polyline::Polyline;
use crate::rate_limit::{Clock, RateLimiter, SystemClock};
use crate::resolver::GeoResolver;
use crate::solver::{self, SolveOptions};
use crate::traits::{Geocoder, RoutingService};

/// A delivery stop as handed over by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub route_id: String,
    pub address: Address,
    /// Known coordinate; stops without one are geocoded.
    #[serde(default)]
    pub coordinate: Option<Coordinate>,
    /// 1-based visiting position, set once the route is optimized.
    #[serde(default)]
    pub position: Option<usize>,
}

impl Stop {
    pub fn new(id: impl Into<String>, route_id: impl Into<String>, address: Address) -> Self {
        Self {
            id: id.into(),
            route_id: route_id.into(),
            address,
            coordinate: None,
            position: None,
        }
    }

    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }
}

/// A stop left out of its route, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedStop {
    pub stop: Stop,
    pub reason: String,
}

/// One leg of an optimized route.
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub meters: f64,
    pub duration_secs: Option<f64>,
    pub source: DistanceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Polyline>,
}

/// Legs per distance source. Haversine legs mean the route was partly
/// optimized on straight-line estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EdgeSources {
    pub cache: usize,
    pub api: usize,
    pub haversine: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub route_id: String,
    /// Resolved stops in visiting order, positions assigned.
    pub stops: Vec<Stop>,
    pub legs: Vec<Leg>,
    pub excluded: Vec<ExcludedStop>,
    /// Length of the resolved stops in their input order.
    pub original_distance: f64,
    pub optimized_distance: f64,
    pub savings_meters: f64,
    pub savings_percent: f64,
    pub edge_sources: EdgeSources,
}

#[derive(Debug)]
pub struct RouteFailure {
    pub route_id: String,
    pub error: PlanError,
    pub excluded: Vec<ExcludedStop>,
}

#[derive(Debug)]
pub struct PlanReport {
    /// Optimized routes, in the order their groups first appeared.
    pub routes: Vec<RouteSummary>,
    pub failures: Vec<RouteFailure>,
    /// Cache stores that lost their disk backing, as `(store, error)`.
    pub cache_failures: Vec<(&'static str, String)>,
    /// Provider counters at the end of the request.
    pub distance_stats: DistanceStats,
}

impl PlanReport {
    pub fn route(&self, route_id: &str) -> Option<&RouteSummary> {
        self.routes.iter().find(|route| route.route_id == route_id)
    }

    pub fn total_original_distance(&self) -> f64 {
        self.routes.iter().map(|r| r.original_distance).sum()
    }

    pub fn total_optimized_distance(&self) -> f64 {
        self.routes.iter().map(|r| r.optimized_distance).sum()
    }
}

pub struct Planner<G, R> {
    resolver: GeoResolver<G>,
    distances: DistanceProvider<R>,
    caches: CacheStores,
    limiter: Arc<RateLimiter>,
    options: SolveOptions,
}

impl<G: Geocoder, R: RoutingService> Planner<G, R> {
    /// Builds a planner on the real clock with caches under
    /// `config.cache_dir`.
    pub fn from_config(config: &PlannerConfig, geocoder: G, routing: R) -> Self {
        let caches = CacheStores::open(config);
        Self::new(config, geocoder, routing, caches, Arc::new(SystemClock::default()))
    }

    pub fn new(
        config: &PlannerConfig,
        geocoder: G,
        routing: R,
        caches: CacheStores,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock));
        let resolver = GeoResolver::new(
            geocoder,
            caches.geocode.clone(),
            limiter.clone(),
            config.geocode_max_wait,
        );
        let distances = DistanceProvider::new(
            routing,
            caches.routes.clone(),
            limiter.clone(),
            config.routing_max_wait,
        )
        .with_symmetric_lookup(config.assume_symmetric)
        .with_breaker(config.breaker.clone())
        .with_estimator(HaversineEstimator::new(config.fallback_speed_kmh));

        Self {
            resolver,
            distances,
            caches,
            limiter,
            options: config.solve.clone(),
        }
    }

    pub fn resolver(&self) -> &GeoResolver<G> {
        &self.resolver
    }

    pub fn distances(&self) -> &DistanceProvider<R> {
        &self.distances
    }

    pub fn caches(&self) -> &CacheStores {
        &self.caches
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Groups `stops` by route id and optimizes each group.
    pub fn optimize_all(&self, stops: Vec<Stop>) -> PlanReport {
        let mut routes = Vec::new();
        let mut failures = Vec::new();

        for (route_id, group) in group_by_route(stops) {
            match self.optimize_route(&route_id, group) {
                Ok(summary) => routes.push(summary),
                Err(failure) => {
                    warn!(route_id = %failure.route_id, error = %failure.error, "route not optimized");
                    failures.push(failure);
                }
            }
        }

        if let Err(err) = self.caches.flush() {
            warn!(error = %err, "cache flush failed");
        }

        PlanReport {
            routes,
            failures,
            cache_failures: self.caches.failures(),
            distance_stats: self.distances.stats(),
        }
    }

    /// Resolves and optimizes one route group.
    pub fn optimize_route(
        &self,
        route_id: &str,
        stops: Vec<Stop>,
    ) -> Result<RouteSummary, RouteFailure> {
        let total = stops.len();
        let (resolved, excluded) = self.resolve_stops(route_id, stops);

        if resolved.is_empty() {
            return Err(RouteFailure {
                route_id: route_id.to_string(),
                error: PlanError::NoResolvableStops {
                    route_id: route_id.to_string(),
                    excluded: total,
                },
                excluded,
            });
        }

        let memo = LegMemo::new(&self.distances);
        let points: Vec<Coordinate> = resolved.iter().map(|(_, c)| *c).collect();
        let indexed: Vec<usize> = (0..points.len()).collect();
        let leg_meters = |a: &usize, b: &usize| memo.meters(*a, *b, &points);

        let original_distance = solver::route_length(&indexed, leg_meters, self.options.closed_tour);
        let tour = solver::optimize(&indexed, leg_meters, &self.options);

        let mut visit_order = tour.order.clone();
        if self.options.closed_tour && visit_order.len() > 1 {
            visit_order.push(visit_order[0]);
        }
        let mut edge_sources = EdgeSources::default();
        let legs: Vec<Leg> = visit_order
            .windows(2)
            .map(|pair| {
                let distance = memo.get(pair[0], pair[1], &points);
                match distance.source {
                    DistanceSource::Cache => edge_sources.cache += 1,
                    DistanceSource::Api => edge_sources.api += 1,
                    DistanceSource::Haversine => edge_sources.haversine += 1,
                    DistanceSource::SamePoint => {}
                }
                Leg {
                    from_stop_id: resolved[pair[0]].0.id.clone(),
                    to_stop_id: resolved[pair[1]].0.id.clone(),
                    meters: distance.meters,
                    duration_secs: distance.duration_secs,
                    source: distance.source,
                    geometry: distance.geometry,
                }
            })
            .collect();

        let mut by_position: Vec<Option<Stop>> =
            resolved.into_iter().map(|(stop, _)| Some(stop)).collect();
        let ordered: Vec<Stop> = tour
            .order
            .iter()
            .enumerate()
            .filter_map(|(rank, &index)| {
                by_position[index].take().map(|mut stop| {
                    stop.position = Some(rank + 1);
                    stop
                })
            })
            .collect();

        let optimized_distance = tour.total_distance;
        let savings_meters = original_distance - optimized_distance;
        let savings_percent = if original_distance > 0.0 {
            savings_meters / original_distance * 100.0
        } else {
            0.0
        };

        info!(
            route_id = %route_id,
            stops = ordered.len(),
            excluded = excluded.len(),
            original_distance,
            optimized_distance,
            savings_percent,
            haversine_legs = edge_sources.haversine,
            "route optimized"
        );

        Ok(RouteSummary {
            route_id: route_id.to_string(),
            stops: ordered,
            legs,
            excluded,
            original_distance,
            optimized_distance,
            savings_meters,
            savings_percent,
            edge_sources,
        })
    }

    fn resolve_stops(
        &self,
        route_id: &str,
        stops: Vec<Stop>,
    ) -> (Vec<(Stop, Coordinate)>, Vec<ExcludedStop>) {
        let mut resolved = Vec::with_capacity(stops.len());
        let mut excluded = Vec::new();

        for mut stop in stops {
            let result = match stop.coordinate {
                Some(coordinate) if coordinate.is_valid() => Ok(coordinate),
                Some(coordinate) => Err(GeocodeError::InvalidCoordinate {
                    lat: coordinate.lat,
                    lng: coordinate.lng,
                }),
                None => self.resolver.resolve(&stop.address.query()),
            };

            match result {
                Ok(coordinate) => {
                    stop.coordinate = Some(coordinate);
                    resolved.push((stop, coordinate));
                }
                Err(err) => {
                    warn!(route_id = %route_id, stop_id = %stop.id, error = %err, "stop excluded");
                    excluded.push(ExcludedStop {
                        stop,
                        reason: err.to_string(),
                    });
                }
            }
        }

        (resolved, excluded)
    }
}

/// Groups stops by route id, keeping the order in which groups first appear
/// and the input order within each group.
pub fn group_by_route(stops: Vec<Stop>) -> Vec<(String, Vec<Stop>)> {
    let mut groups: Vec<(String, Vec<Stop>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for stop in stops {
        match index.get(&stop.route_id) {
            Some(&slot) => groups[slot].1.push(stop),
            None => {
                index.insert(stop.route_id.clone(), groups.len());
                groups.push((stop.route_id.clone(), vec![stop]));
            }
        }
    }

    groups
}

/// Request-scoped memo of leg distances by resolved-stop index.
///
/// Haversine fallbacks live here only for the current route, so a later
/// request retries the routing service for them.
struct LegMemo<'p, R> {
    provider: &'p DistanceProvider<R>,
    legs: RefCell<HashMap<(usize, usize), Distance>>,
}

impl<'p, R: RoutingService> LegMemo<'p, R> {
    fn new(provider: &'p DistanceProvider<R>) -> Self {
        Self {
            provider,
            legs: RefCell::new(HashMap::new()),
        }
    }

    fn meters(&self, from: usize, to: usize, points: &[Coordinate]) -> f64 {
        if let Some(distance) = self.legs.borrow().get(&(from, to)) {
            return distance.meters;
        }
        self.get(from, to, points).meters
    }

    fn get(&self, from: usize, to: usize, points: &[Coordinate]) -> Distance {
        if let Some(distance) = self.legs.borrow().get(&(from, to)) {
            return distance.clone();
        }
        let distance = self.provider.distance(points[from], points[to]);
        self.legs.borrow_mut().insert((from, to), distance.clone());
        distance
    }
}
