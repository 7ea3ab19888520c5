//! OSRM HTTP adapter for point-to-point road routes.

use serde::Deserialize;

use crate::error::RoutingError;
use crate::geo::Coordinate;
use crate::polyline::{DEFAULT_PRECISION, Polyline};
use crate::traits::{RouteLeg, RoutingService};

#[derive(Debug, Clone)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "car".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsrmClient {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn route_url(&self, from: Coordinate, to: Coordinate) -> String {
        format!(
            "{}/route/v1/{}/{:.6},{:.6};{:.6},{:.6}?overview=full&geometries=polyline",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            from.lng,
            from.lat,
            to.lng,
            to.lat
        )
    }
}

impl RoutingService for OsrmClient {
    fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError> {
        let response = self.client.get(self.route_url(from, to)).send()?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RoutingError::RateLimited);
        }
        // OSRM answers NoSegment, InvalidQuery and friends with a 400 and a
        // JSON body carrying the code.
        if status.is_client_error() {
            let text = response.text()?;
            return parse_rejection(status, &text);
        }

        let body = response.error_for_status()?.json::<OsrmRouteResponse>()?;
        parse_route(body)
    }
}

fn parse_route(body: OsrmRouteResponse) -> Result<RouteLeg, RoutingError> {
    if body.code != "Ok" {
        return match body.code.as_str() {
            "NoRoute" | "NoSegment" => Err(RoutingError::NoRoute),
            other => Err(RoutingError::InvalidResponse(format!(
                "OSRM code {}: {}",
                other,
                body.message.unwrap_or_default()
            ))),
        };
    }

    let route = body
        .routes
        .into_iter()
        .next()
        .ok_or(RoutingError::NoRoute)?;

    let mut leg = RouteLeg::new(route.distance).with_duration(route.duration);
    if let Some(encoded) = route.geometry {
        let geometry = Polyline::decode(&encoded, DEFAULT_PRECISION).ok_or_else(|| {
            RoutingError::InvalidResponse("undecodable route geometry".to_string())
        })?;
        leg = leg.with_geometry(geometry);
    }

    Ok(leg)
}

fn parse_rejection(status: reqwest::StatusCode, text: &str) -> Result<RouteLeg, RoutingError> {
    match serde_json::from_str::<OsrmRouteResponse>(text) {
        Ok(body) if body.code != "Ok" => parse_route(body),
        _ => Err(RoutingError::InvalidResponse(format!(
            "HTTP {}: {}",
            status,
            text.trim()
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: Option<String>,
}
