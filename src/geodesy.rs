//! Great-circle geometry on a spherical Earth.
//!
//! Distances between hypocenters are small compared to the Earth radius,
//! so the vertical separation is combined with the horizontal great-circle
//! distance as a flat-Earth hypotenuse. Latitudes and longitudes are in
//! degrees, depths and the returned distances in kilometers, azimuths in
//! degrees clockwise from north.

use crate::catalog::{Event, Station};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn deg2km(deg: f64) -> f64 {
    deg * std::f64::consts::PI * EARTH_RADIUS_KM / 180.0
}

/// Angular distance, azimuth and back-azimuth between two points.
///
/// Arguments
/// ---------
/// * `lat1`, `lon1`: first point in degrees
/// * `lat2`, `lon2`: second point in degrees
///
/// Return
/// ------
/// * `(distance_deg, azimuth_deg, back_azimuth_deg)` where the azimuth is
///   measured at the first point towards the second and the back-azimuth
///   at the second point towards the first
pub fn delazi(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64, f64) {
    if lat1 == lat2 && lon1 == lon2 {
        return (0.0, 0.0, 0.0);
    }

    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());

    let a = std::f64::consts::FRAC_PI_2 - lat2;
    let b = std::f64::consts::FRAC_PI_2 - lat1;
    let gam = lon1 - lon2;
    let (cos_a, sin_a) = (a.cos(), a.sin());
    let (cos_b, sin_b) = (b.cos(), b.sin());

    let cos_c = (cos_a * cos_b + sin_a * sin_b * gam.cos()).clamp(-1.0, 1.0);
    let delta = cos_c.acos();
    let sin_c = delta.sin();

    let mut azi1 = ((cos_a - cos_b * cos_c) / (sin_b * sin_c)).acos();
    let mut azi2 = ((cos_b - cos_a * cos_c) / (sin_a * sin_c)).acos();

    if (azi1.is_nan() || azi2.is_nan()) && (lon2 - lon1).abs() < 1e-6 {
        // the points share a meridian, the spherical triangle degenerates
        if lat1 > lat2 {
            azi1 = std::f64::consts::PI;
            azi2 = 0.0;
        } else {
            azi1 = 0.0;
            azi2 = std::f64::consts::PI;
        }
    } else if gam.sin() < 0.0 {
        azi2 = 2.0 * std::f64::consts::PI - azi2;
    } else {
        azi1 = 2.0 * std::f64::consts::PI - azi1;
    }

    (delta.to_degrees(), azi1.to_degrees(), azi2.to_degrees())
}

/// Horizontal distance in km plus azimuth/back-azimuth.
pub fn distance_2d(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64, f64) {
    let (dist, az, baz) = delazi(lat1, lon1, lat2, lon2);
    (deg2km(dist), az, baz)
}

/// Hypocentral distance in km between two points at depth.
pub fn distance_3d(
    lat1: f64,
    lon1: f64,
    depth1: f64,
    lat2: f64,
    lon2: f64,
    depth2: f64,
) -> (f64, f64, f64) {
    let (h_dist, az, baz) = distance_2d(lat1, lon1, lat2, lon2);
    if depth1 == depth2 {
        return (h_dist, az, baz);
    }
    let v_dist = (depth1 - depth2).abs();
    (h_dist.hypot(v_dist), az, baz)
}

pub fn event_distance(ev1: &Event, ev2: &Event) -> (f64, f64, f64) {
    distance_3d(
        ev1.latitude,
        ev1.longitude,
        ev1.depth,
        ev2.latitude,
        ev2.longitude,
        ev2.depth,
    )
}

/// Event to station distance; the station elevation (meters above sea
/// level) becomes a negative depth in km.
pub fn station_distance(event: &Event, station: &Station) -> (f64, f64, f64) {
    distance_3d(
        event.latitude,
        event.longitude,
        event.depth,
        station.latitude,
        station.longitude,
        -(station.elevation / 1000.0),
    )
}
