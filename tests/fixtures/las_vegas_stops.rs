//! Delivery stops at real Las Vegas / Henderson coordinates.
//!
//! Coordinates sourced from OpenStreetMap. Street addresses are synthetic;
//! each one maps to exactly one coordinate in [`FixtureGeocoder`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use route_optimizer::error::{GeocodeError, RoutingError};
use route_optimizer::geo::{Address, Coordinate, normalize_address};
use route_optimizer::haversine::haversine_meters;
use route_optimizer::planner::Stop;
use route_optimizer::traits::{Geocoder, RouteLeg, RoutingService};

/// A named delivery address with its true coordinate.
#[derive(Debug, Clone)]
pub struct Dropoff {
    pub name: &'static str,
    pub street: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Dropoff {
    pub const fn new(name: &'static str, street: &'static str, lat: f64, lng: f64) -> Self {
        Self {
            name,
            street,
            lat,
            lng,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    pub fn address(&self) -> Address {
        Address::new(self.street, "89109", "Las Vegas")
    }

    pub fn stop(&self, route_id: &str) -> Stop {
        Stop::new(self.name, route_id, self.address())
    }
}

pub const STRIP: &[Dropoff] = &[
    Dropoff::new("Wynn Las Vegas", "3131 Las Vegas Blvd S", 36.1263781, -115.1658180),
    Dropoff::new("Hard Rock Cafe", "3771 Las Vegas Blvd S", 36.1041592, -115.1722166),
    Dropoff::new("Public House", "3355 Las Vegas Blvd S", 36.1219193, -115.1689317),
    Dropoff::new("Brooklyn Bowl", "3545 Las Vegas Blvd S", 36.1175388, -115.1695094),
    Dropoff::new("Gordon Ramsay BurGR", "3667 Las Vegas Blvd S", 36.1107195, -115.1720818),
    Dropoff::new("Bellagio", "3600 Las Vegas Blvd S", 36.1126, -115.1767),
    Dropoff::new("MGM Grand", "3799 Las Vegas Blvd S", 36.1023654, -115.1688720),
    Dropoff::new("Caesars Palace", "3570 Las Vegas Blvd S", 36.1162, -115.1745),
    Dropoff::new("Sinatra", "3121 Las Vegas Blvd S", 36.1300035, -115.1654850),
    Dropoff::new("Le Cirque", "3602 Las Vegas Blvd S", 36.1135689, -115.1749763),
];

pub const EAST: &[Dropoff] = &[
    Dropoff::new("Pei Wei Town Square", "6593 Las Vegas Blvd S", 36.0810469, -115.1472694),
    Dropoff::new("Hello Tokyo", "4155 E Tropicana Ave", 36.1161627, -115.0902096),
    Dropoff::new("Original Lindo Michoacan", "2655 E Desert Inn Rd", 36.1294005, -115.1135106),
    Dropoff::new("Tomo Sushi", "3300 E Tropicana Ave", 36.0992464, -115.1142123),
    Dropoff::new("Sushi Twister", "5775 E Tropicana Ave", 36.1007300, -115.0526259),
    Dropoff::new("Chuck Wagon Restaurant", "5111 Boulder Hwy", 36.1072491, -115.0593482),
    Dropoff::new("Roma Pizza", "4600 E Tropicana Ave", 36.1012461, -115.0753039),
    Dropoff::new("Longhorn Casino", "5288 Boulder Hwy", 36.1070664, -115.0591256),
];

pub const HENDERSON: &[Dropoff] = &[
    Dropoff::new("I Love Sushi Henderson", "11041 S Eastern Ave", 35.9916660, -115.1028343),
    Dropoff::new("Islander's Grill", "2470 Sunridge Heights Pkwy", 36.0335058, -114.9856162),
    Dropoff::new("Naga", "1527 W Warm Springs Rd", 36.0137634, -114.9928676),
    Dropoff::new("Green Valley Ranch Area", "2300 Paseo Verde Pkwy", 36.0308, -115.0825),
    Dropoff::new("Sunset Station Area", "1301 W Sunset Rd", 36.0614, -115.0631),
    Dropoff::new("RibCage", "10940 S Eastern Ave", 35.9949754, -115.0999810),
];

pub fn all_dropoffs() -> Vec<Dropoff> {
    let mut all = Vec::with_capacity(STRIP.len() + EAST.len() + HENDERSON.len());
    all.extend_from_slice(STRIP);
    all.extend_from_slice(EAST);
    all.extend_from_slice(HENDERSON);
    all
}

/// Geocoder answering from the fixture table, counting external calls.
#[derive(Debug, Default)]
pub struct FixtureGeocoder {
    known: HashMap<String, Coordinate>,
    calls: AtomicUsize,
}

impl FixtureGeocoder {
    pub fn new(dropoffs: &[Dropoff]) -> Self {
        let known = dropoffs
            .iter()
            .map(|dropoff| (dropoff.address().normalized(), dropoff.coordinate()))
            .collect();
        Self {
            known,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for FixtureGeocoder {
    fn geocode(&self, query: &str) -> Result<Coordinate, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.known
            .get(&normalize_address(query))
            .copied()
            .ok_or_else(|| GeocodeError::NotFound {
                address: query.to_string(),
            })
    }
}

/// Road distances as great-circle distance times a detour factor, with a
/// small direction-dependent surcharge to mimic one-way streets.
#[derive(Debug)]
pub struct FixtureRouting {
    up: AtomicBool,
    calls: AtomicUsize,
    requests: Mutex<Vec<(Coordinate, Coordinate)>>,
}

impl FixtureRouting {
    pub fn new() -> Self {
        Self {
            up: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn down() -> Self {
        let routing = Self::new();
        routing.set_up(false);
        routing
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(Coordinate, Coordinate)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn road_meters(from: Coordinate, to: Coordinate) -> f64 {
        let surcharge = if to.lat > from.lat { 1.05 } else { 1.0 };
        haversine_meters(from, to) * 1.3 * surcharge
    }
}

impl RoutingService for FixtureRouting {
    fn route(&self, from: Coordinate, to: Coordinate) -> Result<RouteLeg, RoutingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push((from, to));
        if !self.up.load(Ordering::SeqCst) {
            return Err(RoutingError::InvalidResponse("503 Service Unavailable".to_string()));
        }
        let meters = Self::road_meters(from, to);
        Ok(RouteLeg::new(meters).with_duration(meters / 11.0))
    }
}
