//! Great-circle distance between coordinates.

use crate::geo_grid::Coordinate;

/// Earth radius used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance in meters.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let phi_a = a.lat.to_radians();
    let phi_b = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi_a.cos() * phi_b.cos() * (d_lambda / 2.0).sin().powi(2);

    // Clamp: rounding can push h marginally above 1 for antipodal points
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_zero_for_same_point() {
        let p = Coordinate::new(45.75372, 21.22571);
        assert_eq!(distance_meters(p, p), 0.0);
    }

    #[test]
    fn test_one_degree_latitude() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(1.0, 0.0);
        // R * pi / 180
        assert_relative_eq!(distance_meters(a, b), 111_194.93, epsilon = 0.01);
    }

    #[test]
    fn test_monotonic_with_separation() {
        let base = Coordinate::new(45.75, 21.22);
        let mut previous = 0.0;
        for step in 1..20 {
            let d = distance_meters(base, Coordinate::new(45.75, 21.22 + step as f64 * 0.001));
            assert!(d > previous);
            previous = d;
        }
    }

    proptest! {
        #[test]
        fn prop_symmetric(
            lat_a in -80.0f64..80.0, lng_a in -179.0f64..179.0,
            lat_b in -80.0f64..80.0, lng_b in -179.0f64..179.0,
        ) {
            let a = Coordinate::new(lat_a, lng_a);
            let b = Coordinate::new(lat_b, lng_b);
            let ab = distance_meters(a, b);
            let ba = distance_meters(b, a);
            prop_assert!((ab - ba).abs() <= 1e-6);
            prop_assert!(ab >= 0.0);
        }
    }
}
