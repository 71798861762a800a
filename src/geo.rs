/*!
 * Geographic and temporal calculations.
 *
 * The distances here are simple spherical earth approximations. At the scale of a couple of
 * hundred meters, which is what the clustering cares about, that is plenty accurate.
 */
use chrono::{DateTime, Duration, Utc};
use std::fmt::{self, Display};

/// A geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    /// Are both values finite and in range for a latitude and longitude?
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// The great circle distance to another coordinate in meters.
    pub fn distance_to(&self, other: Coord) -> f64 {
        great_circle_distance(*self, other)
    }
}

impl Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/**
 * The simple great circle distance calculation.
 *
 * #Arguments
 * * left - the first point, lat/lon in degrees.
 * * right - the second point, lat/lon in degrees.
 *
 * #Returns
 * The distance between the points in meters.
 */
pub fn great_circle_distance(left: Coord, right: Coord) -> f64 {
    const DEG2RAD: f64 = 2.0 * std::f64::consts::PI / 360.0;
    const EARTH_RADIUS_M: f64 = 6_371_009.0;

    let lat1_r = left.lat * DEG2RAD;
    let lon1_r = left.lon * DEG2RAD;
    let lat2_r = right.lat * DEG2RAD;
    let lon2_r = right.lon * DEG2RAD;

    let dlat2 = (lat2_r - lat1_r) / 2.0;
    let dlon2 = (lon2_r - lon1_r) / 2.0;

    let sin2_dlat = f64::powi(f64::sin(dlat2), 2);
    let sin2_dlon = f64::powi(f64::sin(dlon2), 2);

    // Clamp so rounding can't push asin out of its domain for antipodal points.
    let hav = (sin2_dlat + sin2_dlon * f64::cos(lat1_r) * f64::cos(lat2_r)).min(1.0);

    2.0 * f64::asin(f64::sqrt(hav)) * EARTH_RADIUS_M
}

/// The absolute amount of time between two events, order doesn't matter.
pub fn time_delta(left: DateTime<Utc>, right: DateTime<Utc>) -> Duration {
    if left > right {
        left - right
    } else {
        right - left
    }
}
