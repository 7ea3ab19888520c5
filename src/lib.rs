//! route-optimizer
//!
//! Multi-stop delivery route optimization on road-network distances, with
//! persistent geocode/route caches and a shared rate limit on external calls.

pub mod cache;
pub mod config;
pub mod distance;
pub mod error;
pub mod geo;
pub mod haversine;
pub mod ors;
pub mod osrm;
pub mod planner;
pub mod polyline;
pub mod rate_limit;
pub mod resolver;
pub mod solver;
pub mod traits;

pub use config::PlannerConfig;
pub use error::{CacheIoError, GeocodeError, PlanError, RateLimitExceeded, RoutingError};
pub use geo::{Address, Coordinate};
pub use planner::{PlanReport, Planner, RouteSummary, Stop};
