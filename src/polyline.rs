//! Polyline representation for route geometries.
//!
//! Geometries are kept as decoded coordinate sequences. The compact encoded
//! polyline format only exists at the routing API boundary, where
//! [`Polyline::decode`] and [`Polyline::encode`] convert between the two.

use serde::{Deserialize, Serialize};

/// Precision used by OSRM and OpenRouteService encoded polylines.
pub const DEFAULT_PRECISION: u32 = 5;

/// A polyline representing a route geometry as decoded coordinates.
///
/// Each point is a (latitude, longitude) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<(f64, f64)>,
}

impl Polyline {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn into_points(self) -> Vec<(f64, f64)> {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Decodes an encoded polyline string.
    ///
    /// Returns `None` on characters outside the encoding alphabet, a
    /// truncated final value or deltas that overflow the running position.
    pub fn decode(encoded: &str, precision: u32) -> Option<Self> {
        let factor = 10_f64.powi(precision as i32);
        let bytes = encoded.as_bytes();
        let mut index = 0;
        let mut lat: i64 = 0;
        let mut lng: i64 = 0;
        let mut points = Vec::new();

        while index < bytes.len() {
            lat = lat.checked_add(next_value(bytes, &mut index)?)?;
            lng = lng.checked_add(next_value(bytes, &mut index)?)?;
            points.push((lat as f64 / factor, lng as f64 / factor));
        }

        Some(Self { points })
    }

    /// Encodes the points with the given precision.
    pub fn encode(&self, precision: u32) -> String {
        let factor = 10_f64.powi(precision as i32);
        let mut out = String::new();
        let mut prev = (0_i64, 0_i64);

        for &(lat, lng) in &self.points {
            let lat = (lat * factor).round() as i64;
            let lng = (lng * factor).round() as i64;
            push_value(&mut out, lat - prev.0);
            push_value(&mut out, lng - prev.1);
            prev = (lat, lng);
        }

        out
    }
}

fn next_value(bytes: &[u8], index: &mut usize) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes.get(*index)?;
        *index += 1;
        let chunk = i64::from(byte.checked_sub(63)?);
        if shift >= 64 {
            return None;
        }
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }

    Some(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

fn push_value(out: &mut String, value: i64) {
    let mut v = if value < 0 { !(value << 1) } else { value << 1 };
    while v >= 0x20 {
        out.push(char::from((0x20 | (v & 0x1f)) as u8 + 63));
        v >>= 5;
    }
    out.push(char::from(v as u8 + 63));
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    #[test]
    fn test_new_and_points() {
        let points = vec![(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)];
        let polyline = Polyline::new(points.clone());
        assert_eq!(polyline.points(), &points[..]);
        assert_eq!(polyline.into_points(), points);
    }

    #[test]
    fn test_decode_reference_string() {
        let polyline = Polyline::decode(SAMPLE, DEFAULT_PRECISION).expect("valid polyline");
        let expected = [(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)];
        assert_eq!(polyline.points().len(), expected.len());
        for (got, want) in polyline.points().iter().zip(expected) {
            assert!((got.0 - want.0).abs() < 1e-9 && (got.1 - want.1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_encode_reference_points() {
        let polyline = Polyline::new(vec![(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)]);
        assert_eq!(polyline.encode(DEFAULT_PRECISION), SAMPLE);
    }

    #[test]
    fn test_decode_empty() {
        let polyline = Polyline::decode("", DEFAULT_PRECISION).expect("empty is valid");
        assert!(polyline.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // Truncated: continuation bit set on the last byte.
        assert!(Polyline::decode("_p~iF~ps|", DEFAULT_PRECISION).is_none());
        // Below the alphabet.
        assert!(Polyline::decode("  ", DEFAULT_PRECISION).is_none());
    }

    #[test]
    fn test_decode_rejects_overflowing_deltas() {
        // Each chunk decodes to a delta near 2^62; the third latitude sum
        // no longer fits in an i64.
        let encoded = format!("}}{}F", "~".repeat(11)).repeat(6);
        assert!(Polyline::decode(&encoded, DEFAULT_PRECISION).is_none());
    }
}
