// Geographic primitives - coordinates and distance calculations
//
// Presence is surface-level: we only track lat/lon in degrees and measure
// separation in meters over a spherical Earth. Accuracy is ~0.5% which is
// far below the thresholds the update gate works with.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Degrees to radians conversion factor
const DTOR: f64 = PI / 180.0;

/// Average radius for spherical Earth approximation in meters
const SPHERICAL_R: f64 = 6371e3;

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Coordinate { lat, lon }
    }

    /// Great-circle distance to another coordinate, in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        greatcircle(self.lat, self.lon, other.lat, other.lon)
    }

    /// True when the two coordinates are within `epsilon_m` meters.
    pub fn approx_eq(&self, other: &Coordinate, epsilon_m: f64) -> bool {
        self.distance_to(other) < epsilon_m
    }
}

/// Returns great-circle distance in meters between two lat/lon points.
///
/// Assumes spherical Earth. The acos argument is clamped so that identical
/// points cannot produce NaN through rounding.
pub fn greatcircle(lat0: f64, lon0: f64, lat1: f64, lon1: f64) -> f64 {
    let lat0_rad = lat0 * DTOR;
    let lon0_rad = lon0 * DTOR;
    let lat1_rad = lat1 * DTOR;
    let lon1_rad = lon1 * DTOR;

    let c = lat0_rad.sin() * lat1_rad.sin()
        + lat0_rad.cos() * lat1_rad.cos() * (lon0_rad - lon1_rad).abs().cos();

    SPHERICAL_R * c.clamp(-1.0, 1.0).acos()
}
