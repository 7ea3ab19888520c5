//! Geographic primitives: coordinates, raw addresses and normalization.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Decimal places kept when a coordinate becomes part of a cache key.
///
/// Five places is roughly 1.1 m at the equator: geocoder jitter below that
/// still hits the same route cache entry.
pub const KEY_PRECISION: usize = 5;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Builds a coordinate, rejecting non-finite or out-of-range values.
    pub fn checked(lat: f64, lng: f64) -> Option<Self> {
        let coordinate = Self { lat, lng };
        coordinate.is_valid().then_some(coordinate)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Rounded textual form used inside cache keys.
    pub fn key(&self) -> String {
        format!(
            "{:.prec$},{:.prec$}",
            self.lat,
            self.lng,
            prec = KEY_PRECISION
        )
    }

    /// Directional cache key for the leg `self -> to`.
    pub fn pair_key(&self, to: &Coordinate) -> String {
        format!("{}->{}", self.key(), to.key())
    }

    pub fn as_tuple(&self) -> (f64, f64) {
        (self.lat, self.lng)
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Raw address fields as delivered by the ingestion layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub postal_code: String,
    pub city: String,
}

impl Address {
    pub fn new(
        street: impl Into<String>,
        postal_code: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            street: street.into(),
            postal_code: postal_code.into(),
            city: city.into(),
        }
    }

    /// Single-line query, e.g. `"Damrak 1, 1012 LG Amsterdam"`.
    pub fn query(&self) -> String {
        let locality = [self.postal_code.trim(), self.city.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        [self.street.trim(), locality.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn normalized(&self) -> String {
        normalize_address(&self.query())
    }
}

/// Trims, case-folds and collapses whitespace so that trivially different
/// spellings of one place share a geocode cache entry.
pub fn normalize_address(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
