//! Utility functions for distances, coordinate checks and deadlines

use geo::{Point, Rect};
use std::time::{Duration, Instant};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6371000.0;

/// Great-circle distance in meters between two WGS84 points (x = lon, y = lat)
#[inline]
pub fn haversine_distance(p1: Point<f64>, p2: Point<f64>) -> f64 {
    let lat1 = p1.y().to_radians();
    let lat2 = p2.y().to_radians();
    let delta_lat = (p2.y() - p1.y()).to_radians();
    let delta_lon = (p2.x() - p1.x()).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Whether a lon/lat pair is a usable WGS84 position
#[inline]
pub fn is_valid_position(lon: f64, lat: f64) -> bool {
    lon.is_finite() && lat.is_finite() && (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)
}

/// Inclusive containment test, edges count as inside
#[inline]
pub fn rect_contains_inclusive(rect: &Rect<f64>, point: Point<f64>) -> bool {
    let min = rect.min();
    let max = rect.max();
    min.x <= point.x() && point.x() <= max.x && min.y <= point.y() && point.y() <= max.y
}

/// Furthest a deadline is pushed when `now + span` does not fit in an `Instant`
const DEADLINE_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + span`, saturating for spans too large to represent
#[inline]
pub fn deadline_after(now: Instant, span: Duration) -> Instant {
    now.checked_add(span)
        .or_else(|| now.checked_add(DEADLINE_HORIZON))
        .unwrap_or(now)
}
