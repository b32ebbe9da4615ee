//! Circular geofence around an authorized site.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default admission radius around the site.
pub const DEFAULT_RADIUS_M: f64 = 100.0;

/// Latitude/longitude in signed decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    fn in_range(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
    }
}

/// Great-circle distance in meters on a spherical Earth.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Outcome of a geofence check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeofenceOutcome {
    /// At least one coordinate was not submitted; the check does not apply.
    Skipped,
    Within { point: GeoPoint, distance_m: f64 },
    /// `distance_m` is infinite when the coordinates did not parse.
    Outside { distance_m: f64 },
}

impl GeofenceOutcome {
    pub fn passed(&self) -> bool {
        !matches!(self, GeofenceOutcome::Outside { .. })
    }

    /// Submitted point, when it was present and accepted.
    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            GeofenceOutcome::Within { point, .. } => Some(*point),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub site: GeoPoint,
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(site: GeoPoint, radius_m: f64) -> Self {
        Self { site, radius_m }
    }

    /// Check raw form values. Missing or blank coordinates skip the check.
    pub fn check(&self, latitude: Option<&str>, longitude: Option<&str>) -> GeofenceOutcome {
        let (Some(lat), Some(lon)) = (non_blank(latitude), non_blank(longitude)) else {
            return GeofenceOutcome::Skipped;
        };

        match (lat.parse::<f64>(), lon.parse::<f64>()) {
            (Ok(latitude), Ok(longitude)) => self.check_point(GeoPoint::new(latitude, longitude)),
            _ => GeofenceOutcome::Outside {
                distance_m: f64::INFINITY,
            },
        }
    }

    pub fn check_point(&self, point: GeoPoint) -> GeofenceOutcome {
        if !point.in_range() {
            return GeofenceOutcome::Outside {
                distance_m: f64::INFINITY,
            };
        }

        let distance_m = haversine_distance(&self.site, &point);
        if distance_m <= self.radius_m {
            GeofenceOutcome::Within { point, distance_m }
        } else {
            GeofenceOutcome::Outside { distance_m }
        }
    }
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn equator_fence() -> Geofence {
        Geofence::new(GeoPoint::new(0.0, 0.0), DEFAULT_RADIUS_M)
    }

    #[test]
    fn test_identical_points_zero_distance() {
        let p = GeoPoint::new(-6.2, 106.8);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_known_distance() {
        // One degree of latitude is ~111.19 km on this sphere.
        let d = haversine_distance(&GeoPoint::new(0.0, 0.0), &GeoPoint::new(1.0, 0.0));
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_same_point_passes() {
        let outcome = equator_fence().check(Some("0"), Some("0"));
        assert!(outcome.passed());
        assert_eq!(outcome.point(), Some(GeoPoint::new(0.0, 0.0)));
    }

    #[test]
    fn test_two_hundred_meters_rejected() {
        let outcome = equator_fence().check(Some("0.0018"), Some("0"));
        match outcome {
            GeofenceOutcome::Outside { distance_m } => {
                assert!((distance_m - 200.0).abs() < 1.0, "got {distance_m}");
            }
            other => panic!("expected Outside, got {other:?}"),
        }
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let fence = Geofence::new(GeoPoint::new(0.0, 0.0), 200.2);
        assert!(fence.check(Some("0.0018"), Some("0.0")).passed());
    }

    #[test]
    fn test_missing_coordinate_skips() {
        let fence = equator_fence();
        assert_eq!(fence.check(None, Some("45.0")), GeofenceOutcome::Skipped);
        assert_eq!(fence.check(Some("45.0"), None), GeofenceOutcome::Skipped);
        assert_eq!(fence.check(Some("  "), Some("45.0")), GeofenceOutcome::Skipped);
        assert_eq!(fence.check(Some(""), Some("")), GeofenceOutcome::Skipped);
        assert!(fence.check(None, None).passed());
    }

    #[test]
    fn test_unparseable_is_infinitely_far() {
        let outcome = equator_fence().check(Some("north"), Some("0"));
        assert_eq!(
            outcome,
            GeofenceOutcome::Outside {
                distance_m: f64::INFINITY
            }
        );
        assert!(!outcome.passed());
    }

    #[test]
    fn test_non_finite_and_out_of_range_rejected() {
        let fence = equator_fence();
        assert!(!fence.check(Some("NaN"), Some("0")).passed());
        assert!(!fence.check(Some("inf"), Some("0")).passed());
        assert!(!fence.check(Some("91"), Some("0")).passed());
    }
}
