//! Prolate spheroid shells used by the neighbor selection.
//!
//! Following Waldhauser's method, candidate neighbors are sampled from
//! concentric, vertically elongated ellipsoidal layers around the
//! reference hypocenter, each layer split into 8 quadrants:
//!
//! ```text
//!        lat
//!         ^
//!         |
//!    2/6  |   1/5
//!         |
//! -----------------> lon
//!         |
//!    3/7  |   4/8
//!         |
//! ```
//!
//! Quadrants 1-4 lie above the center depth, 5-8 below.

use crate::geodesy::{deg2km, delazi};

/// Standard-equation spheroid `(x-xo)²/a + (y-yo)²/b + (z-zo)²/c = 1`
/// centered on a hypocenter. Constructed from a characteristic axis
/// length: the horizontal semi-axes are `len/2`, the vertical one `len`.
#[derive(Debug, Clone, Copy)]
pub struct Ellipsoid {
    axis_a: f64,
    axis_b: f64,
    axis_c: f64,
    latitude: f64,
    longitude: f64,
    depth: f64,
    /// Degrees; when 0 `axis_a` is east-west and `axis_b` north-south.
    orientation: f64,
}

impl Ellipsoid {
    pub fn with_axis_len(axis_len: f64, latitude: f64, longitude: f64, depth: f64) -> Self {
        Ellipsoid {
            axis_a: axis_len / 2.0,
            axis_b: axis_len / 2.0,
            axis_c: axis_len,
            latitude,
            longitude,
            depth,
            orientation: 0.0,
        }
    }

    /// Whether a hypocenter falls inside the spheroid. A degenerate
    /// spheroid (axis length 0) contains nothing.
    pub fn is_inside(&self, lat: f64, lon: f64, depth: f64) -> bool {
        let (dist_deg, az, _) = delazi(lat, lon, self.latitude, self.longitude);
        let distance = deg2km(dist_deg);
        let az = (az + self.orientation).to_radians();

        let dist_x = distance * az.cos();
        let dist_y = distance * az.sin();
        let dist_z = (depth - self.depth).abs();

        let one = dist_x.powi(2) / self.axis_a
            + dist_y.powi(2) / self.axis_b
            + dist_z.powi(2) / self.axis_c;
        one <= 1.0
    }

    /// Quadrant membership test around the center. The comparisons are
    /// strict: a coordinate exactly on a center plane is accepted by the
    /// quadrants on both sides of that plane.
    pub fn is_in_quadrant(&self, lat: f64, lon: f64, depth: f64, quadrant: u8) -> bool {
        assert!((1..=8).contains(&quadrant), "quadrant must be in 1..=8");

        if depth < self.depth && (1..=4).contains(&quadrant) {
            return false;
        }
        if depth > self.depth && (5..=8).contains(&quadrant) {
            return false;
        }

        if lon < self.longitude && matches!(quadrant, 1 | 4 | 5 | 8) {
            return false;
        }
        if lon > self.longitude && matches!(quadrant, 2 | 3 | 6 | 7) {
            return false;
        }

        if lat < self.latitude && matches!(quadrant, 1 | 2 | 5 | 6) {
            return false;
        }
        if lat > self.latitude && matches!(quadrant, 3 | 4 | 7 | 8) {
            return false;
        }

        true
    }

    pub fn is_inside_quadrant(&self, lat: f64, lon: f64, depth: f64, quadrant: u8) -> bool {
        self.is_in_quadrant(lat, lon, depth, quadrant) && self.is_inside(lat, lon, depth)
    }

    pub fn is_outside_quadrant(&self, lat: f64, lon: f64, depth: f64, quadrant: u8) -> bool {
        self.is_in_quadrant(lat, lon, depth, quadrant) && !self.is_inside(lat, lon, depth)
    }
}

#[cfg(test)]
mod ellipsoid_test {
    use super::*;

    // roughly one km in degrees of latitude
    const KM_IN_DEG: f64 = 1.0 / 111.19;

    #[test]
    fn test_is_inside_horizontal_boundary() {
        // axis len 2 -> horizontal semi-axis 1, so dist²/1 <= 1 within ~1 km
        let ell = Ellipsoid::with_axis_len(2.0, 46.0, 8.0, 10.0);
        assert!(ell.is_inside(46.0 + 0.9 * KM_IN_DEG, 8.0, 10.0));
        assert!(!ell.is_inside(46.0 + 1.5 * KM_IN_DEG, 8.0, 10.0));
    }

    #[test]
    fn test_is_inside_vertical_elongation() {
        // vertical axis is twice the horizontal semi-axis
        let ell = Ellipsoid::with_axis_len(2.0, 46.0, 8.0, 10.0);
        assert!(ell.is_inside(46.0, 8.0, 11.3));
        assert!(!ell.is_inside(46.0, 8.0, 11.5));
    }

    #[test]
    fn test_degenerate_ellipsoid_contains_nothing() {
        let ell = Ellipsoid::with_axis_len(0.0, 46.0, 8.0, 10.0);
        assert!(!ell.is_inside(46.0 + KM_IN_DEG, 8.0, 10.0));
        for quadrant in 1..=8 {
            assert!(!ell.is_inside_quadrant(46.0 + 0.1, 8.0 + 0.1, 10.5, quadrant));
        }
        // outside-only shells select everything in the right quadrant
        assert!(ell.is_outside_quadrant(46.0 + 0.1, 8.0 + 0.1, 10.5, 1));
    }

    #[test]
    fn test_quadrant_assignment_is_unique() {
        let ell = Ellipsoid::with_axis_len(10.0, 46.0, 8.0, 10.0);
        for (dlat, dlon, ddepth) in [
            (0.1, 0.1, 0.5),
            (0.1, -0.1, 0.5),
            (-0.1, -0.1, 0.5),
            (-0.1, 0.1, 0.5),
            (0.1, 0.1, -0.5),
            (0.1, -0.1, -0.5),
            (-0.1, -0.1, -0.5),
            (-0.1, 0.1, -0.5),
        ] {
            let count = (1..=8)
                .filter(|q| ell.is_in_quadrant(46.0 + dlat, 8.0 + dlon, 10.0 + ddepth, *q))
                .count();
            assert_eq!(count, 1, "point ({dlat},{dlon},{ddepth})");
        }
    }

    #[test]
    fn test_quadrants_by_azimuth() {
        let ell = Ellipsoid::with_axis_len(10.0, 0.0, 0.0, 10.0);
        // NE / NW / SW / SE below the center depth map to 1..4
        for (azimuth, quadrant) in [(45.0, 1u8), (315.0, 2), (225.0, 3), (135.0, 4)] {
            let az = (azimuth as f64).to_radians();
            let dist = 2.0 * KM_IN_DEG;
            let (lat, lon) = (dist * az.cos(), dist * az.sin());
            assert!(
                ell.is_inside_quadrant(lat, lon, 10.5, quadrant),
                "azimuth {azimuth} quadrant {quadrant}"
            );
            assert!(ell.is_inside_quadrant(lat, lon, 9.5, quadrant + 4));
        }
    }

    #[test]
    #[should_panic]
    fn test_quadrant_out_of_range() {
        let ell = Ellipsoid::with_axis_len(1.0, 0.0, 0.0, 0.0);
        ell.is_in_quadrant(0.0, 0.0, 0.0, 9);
    }
}
