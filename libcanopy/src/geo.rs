//! Great-circle geometry on a spherical Earth

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Whether both components are finite and within their degree ranges
    pub fn is_valid(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-90.0..=90.0).contains(&self.latitude)
    }

    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        haversine(*self, *other)
    }
}

/// Great-circle distance in kilometres
pub fn haversine(a: Coordinate, b: Coordinate) -> f64 {
    haversine_with_radius(a, b, EARTH_RADIUS_KM)
}

/// Great-circle distance on a sphere of the given radius
pub fn haversine_with_radius(a: Coordinate, b: Coordinate, radius: f64) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // rounding can push h a hair above 1 for antipodal points
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    radius * c
}
