//! Runtime configuration for the planner context.
//!
//! Every struct has a `Default` matching production behaviour. Values can be
//! overridden from the environment through `from_env`, which reads through an
//! injectable lookup so tests never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::solver::SolveOptions;

/// Variable lookup used by the `from_lookup` constructors.
pub type EnvLookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

const CACHE_DIR_VAR: &str = "ROUTE_CACHE_DIR";
const RATE_LIMIT_VAR: &str = "ROUTE_RATE_LIMIT_PER_MINUTE";
const ROUTING_WAIT_VAR: &str = "ROUTE_ROUTING_MAX_WAIT_SECS";
const SYMMETRIC_VAR: &str = "ROUTE_ASSUME_SYMMETRIC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls allowed within one window.
    pub max_calls: usize,
    pub window: Duration,
    /// Wait cap used by `RateLimiter::acquire`.
    pub default_max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 35,
            window: Duration::from_secs(60),
            default_max_wait: Duration::from_secs(60),
        }
    }
}

/// Outage breaker for the routing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive routing failures before external calls are suspended.
    pub failure_threshold: u32,
    /// How long calls stay suspended before one trial call is let through.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Directory holding the geocode and route cache files.
    pub cache_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
    /// Longest a routing call waits for a rate-limit slot before the
    /// haversine fallback is used.
    pub routing_max_wait: Duration,
    /// Longest a geocoding call waits for a rate-limit slot.
    pub geocode_max_wait: Duration,
    /// Reuse a cached `b -> a` leg when `a -> b` is missing.
    pub assume_symmetric: bool,
    pub breaker: BreakerConfig,
    /// Speed used to estimate durations of haversine legs.
    pub fallback_speed_kmh: f64,
    pub solve: SolveOptions,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            rate_limit: RateLimitConfig::default(),
            routing_max_wait: Duration::from_secs(2),
            geocode_max_wait: Duration::from_secs(60),
            assume_symmetric: false,
            breaker: BreakerConfig::default(),
            fallback_speed_kmh: 40.0,
            solve: SolveOptions::default(),
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|var: &str| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: &EnvLookup<'_>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup(CACHE_DIR_VAR).filter(|dir| !dir.trim().is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(max_calls) = parse_var::<usize>(lookup, RATE_LIMIT_VAR)? {
            if max_calls == 0 {
                return Err(ConfigError::Invalid {
                    var: RATE_LIMIT_VAR,
                    value: max_calls.to_string(),
                });
            }
            config.rate_limit.max_calls = max_calls;
        }
        if let Some(secs) = parse_var::<u64>(lookup, ROUTING_WAIT_VAR)? {
            config.routing_max_wait = Duration::from_secs(secs);
        }
        if let Some(symmetric) = parse_var::<bool>(lookup, SYMMETRIC_VAR)? {
            config.assume_symmetric = symmetric;
        }

        Ok(config)
    }

    pub fn geocode_cache_path(&self) -> PathBuf {
        self.cache_dir.join("geocode_cache.jsonl")
    }

    pub fn route_cache_path(&self) -> PathBuf {
        self.cache_dir.join("route_cache.jsonl")
    }
}

/// Returns the variable's value, or `default` when unset or blank.
pub(crate) fn env_or(lookup: &EnvLookup<'_>, var: &str, default: String) -> String {
    lookup(var)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(default)
}

fn parse_var<T: FromStr>(
    lookup: &EnvLookup<'_>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
