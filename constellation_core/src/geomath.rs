//! Great-circle distance between WGS84 coordinates.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};
use crate::error::SyncError;

/// A validated WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Result<Self, SyncError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(SyncError::invalid_payload(format!(
                "non-finite coordinates ({}, {})",
                lat, lng
            )));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(SyncError::invalid_payload(format!("latitude {} out of range", lat)));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(SyncError::invalid_payload(format!("longitude {} out of range", lng)));
        }
        Ok(Self { lat, lng })
    }

    /// Distance to `other` in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        distance_m(self, other)
    }

    fn to_point(self) -> Point<f64> {
        // geo uses (x = longitude, y = latitude)
        Point::new(self.lng, self.lat)
    }
}

/// Haversine distance in meters (mean earth radius).
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    a.to_point().haversine_distance(&b.to_point())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn p(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint::new(lat, lng).unwrap()
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        let a = p(44.4268, 26.1025);
        assert_relative_eq!(a.distance_m(&a), 0.0);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        // One degree along a meridian at mean earth radius
        let d = distance_m(&p(0.0, 0.0), &p(1.0, 0.0));
        assert_relative_eq!(d, 111_195.0, epsilon = 5.0);
    }

    #[test]
    fn test_distance_bucharest_neighbors() {
        let center = p(44.4268, 26.1025);
        let near = p(44.4278, 26.1035);
        let far = p(44.4368, 26.1125);

        let d_near = center.distance_m(&near);
        let d_far = center.distance_m(&far);

        assert!(d_near > 100.0 && d_near < 160.0, "near = {}", d_near);
        assert!(d_far > 1_200.0 && d_far < 1_600.0, "far = {}", d_far);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = p(44.4268, 26.1025);
        let b = p(-33.8688, 151.2093);
        assert_relative_eq!(a.distance_m(&b), b.distance_m(&a), epsilon = 1e-6);
    }

    #[test]
    fn test_geopoint_validation() {
        assert!(GeoPoint::new(90.0, 180.0).is_ok());
        assert!(GeoPoint::new(-90.0, -180.0).is_ok());
        assert!(GeoPoint::new(90.5, 0.0).is_err());
        assert!(GeoPoint::new(0.0, -180.5).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::INFINITY).is_err());
    }
}
