//! Validated WGS84 coordinates and great-circle distance.

use serde::{Deserialize, Serialize};

use crate::SpatialError;

/// Mean Earth radius used for all distance computations.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude/longitude pair known to be in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    /// Validates and wraps a latitude/longitude pair.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinates`] if either value is not
    /// finite, latitude is outside `[-90, 90]`, or longitude is outside
    /// `[-180, 180]`.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SpatialError> {
        if !latitude.is_finite()
            || !longitude.is_finite()
            || !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(SpatialError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Latitude in degrees.
    #[must_use]
    pub const fn latitude(self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    #[must_use]
    pub const fn longitude(self) -> f64 {
        self.longitude
    }

    /// Haversine distance to `other` in meters.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_meters(self, other)
    }
}

/// Great-circle distance between two points on a sphere of radius
/// [`EARTH_RADIUS_M`].
#[must_use]
pub fn haversine_meters(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_and_non_finite() {
        assert!(Coordinates::new(90.0, 180.0).is_ok());
        assert!(Coordinates::new(-90.0, -180.0).is_ok());
        assert!(Coordinates::new(90.1, 0.0).is_err());
        assert!(Coordinates::new(0.0, -180.5).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
        assert!(Coordinates::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn one_degree_of_latitude() {
        let a = Coordinates::new(0.0, 0.0).unwrap();
        let b = Coordinates::new(1.0, 0.0).unwrap();
        let expected = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
        assert!((haversine_meters(a, b) - expected).abs() < 1e-6);
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let dc = Coordinates::new(38.9072, -77.0369).unwrap();
        let nyc = Coordinates::new(40.7128, -74.0060).unwrap();
        assert!((dc.distance_to(nyc) - nyc.distance_to(dc)).abs() < 1e-6);
        assert!(dc.distance_to(dc).abs() < 1e-9);
        // Roughly 328 km apart.
        let km = dc.distance_to(nyc) / 1000.0;
        assert!((320.0..335.0).contains(&km), "{km}");
    }

    #[test]
    fn crosses_antimeridian_the_short_way() {
        let east = Coordinates::new(0.0, 179.9).unwrap();
        let west = Coordinates::new(0.0, -179.9).unwrap();
        assert!(east.distance_to(west) < 25_000.0);
    }
}
