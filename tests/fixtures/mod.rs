//! Test fixtures for route-optimizer.
//!
//! Provides realistic test data including:
//! - Real Las Vegas / Henderson coordinates (from OpenStreetMap)
//! - Fake geocoding and routing services over those coordinates

#![allow(dead_code)]

pub mod las_vegas_stops;

pub use las_vegas_stops::*;
