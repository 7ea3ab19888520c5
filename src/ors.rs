//! OpenRouteService HTTP adapter: geocoding search and driving directions.

use std::time::Duration;

use serde::Deserialize;

use crate::config::{EnvLookup, env_or};
use crate::error::{ConfigError, GeocodeError, RateLimitExceeded, RoutingError};
use crate::geo::Coordinate;
use crate::polyline::Polyline;
use crate::traits::{Geocoder, RouteLeg, RoutingService};

pub const API_KEY_VAR: &str = "OPENROUTESERVICE_API_KEY";
const BASE_URL_VAR: &str = "OPENROUTESERVICE_BASE_URL";
const PROFILE_VAR: &str = "OPENROUTESERVICE_PROFILE";

/// Wait suggested to callers when a 429 carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OrsConfig {
    pub base_url: String,
    pub api_key: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OrsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openrouteservice.org".to_string(),
            api_key: String::new(),
            profile: "driving-car".to_string(),
            timeout_secs: 10,
        }
    }
}

impl OrsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|var: &str| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: &EnvLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let api_key = lookup(API_KEY_VAR)
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing(API_KEY_VAR))?;

        Ok(Self {
            base_url: env_or(lookup, BASE_URL_VAR, defaults.base_url),
            api_key,
            profile: env_or(lookup, PROFILE_VAR, defaults.profile),
            timeout_secs: defaults.timeout_secs,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrsClient {
    config: OrsConfig,
    client: reqwest::blocking::Client,
}

impl OrsClient {
    pub fn new(config: OrsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

impl Geocoder for OrsClient {
    fn geocode(&self, query: &str) -> Result<Coordinate, GeocodeError> {
        let response = self
            .client
            .get(self.url("/geocode/search"))
            .query(&[
                ("api_key", self.config.api_key.as_str()),
                ("text", query),
                ("size", "1"),
            ])
            .send()?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited(RateLimitExceeded {
                retry_after: retry_after(&response),
            }));
        }

        let body = response.error_for_status()?.json::<GeocodeResponse>()?;
        parse_geocode(query, body)
    }
}

impl RoutingService for OrsClient {
    fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError> {
        let start = format!("{:.6},{:.6}", from.lng, from.lat);
        let end = format!("{:.6},{:.6}", to.lng, to.lat);
        let response = self
            .client
            .get(self.url(&format!("/v2/directions/{}", self.config.profile)))
            .query(&[
                ("api_key", self.config.api_key.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
            ])
            .send()?;

        match response.status() {
            reqwest::StatusCode::TOO_MANY_REQUESTS => return Err(RoutingError::RateLimited),
            reqwest::StatusCode::NOT_FOUND => return Err(RoutingError::NoRoute),
            _ => {}
        }

        let body = response.error_for_status()?.json::<DirectionsResponse>()?;
        parse_directions(body)
    }
}

fn retry_after(response: &reqwest::blocking::Response) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn parse_geocode(query: &str, body: GeocodeResponse) -> Result<Coordinate, GeocodeError> {
    let feature = body
        .features
        .into_iter()
        .next()
        .ok_or_else(|| GeocodeError::NotFound {
            address: query.to_string(),
        })?;

    match feature.geometry.coordinates.as_slice() {
        [lng, lat, ..] => Coordinate::checked(*lat, *lng).ok_or(GeocodeError::InvalidCoordinate {
            lat: *lat,
            lng: *lng,
        }),
        _ => Err(GeocodeError::Service {
            message: "geocoding feature without coordinates".to_string(),
        }),
    }
}

fn parse_directions(body: DirectionsResponse) -> Result<RouteLeg, RoutingError> {
    let feature = body
        .features
        .into_iter()
        .next()
        .ok_or(RoutingError::NoRoute)?;
    let summary = feature.properties.summary;

    let mut leg = RouteLeg::new(summary.distance.unwrap_or(0.0));
    if let Some(duration) = summary.duration {
        leg = leg.with_duration(duration);
    }

    if let Some(geometry) = feature.geometry {
        let points = geometry
            .coordinates
            .iter()
            .map(|pair| match pair.as_slice() {
                [lng, lat, ..] => Ok((*lat, *lng)),
                _ => Err(RoutingError::InvalidResponse(
                    "geometry point without two coordinates".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        leg = leg.with_geometry(Polyline::new(points));
    }

    if !leg.is_usable() {
        return Err(RoutingError::InvalidResponse(format!(
            "unusable distance {}",
            leg.meters
        )));
    }

    Ok(leg)
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    features: Vec<PointFeature>,
}

#[derive(Debug, Deserialize)]
struct PointFeature {
    geometry: PointGeometry,
}

#[derive(Debug, Deserialize)]
struct PointGeometry {
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    features: Vec<RouteFeature>,
}

#[derive(Debug, Deserialize)]
struct RouteFeature {
    properties: RouteProperties,
    geometry: Option<LineGeometry>,
}

#[derive(Debug, Deserialize)]
struct RouteProperties {
    #[serde(default)]
    summary: RouteSummary,
}

#[derive(Debug, Default, Deserialize)]
struct RouteSummary {
    distance: Option<f64>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LineGeometry {
    coordinates: Vec<Vec<f64>>,
}
