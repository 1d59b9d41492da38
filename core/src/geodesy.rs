//! Projection of geodetic position fixes onto a local plane.
//!
//! Position fixes arrive as WGS84 latitude and longitude. The fusion loop only ever needs planar
//! offsets, so fixes are projected through a [`PlanarProjection`]. The provided
//! [`LocalTangentPlane`] converts to Earth-centered Earth-fixed (ECEF) coordinates with
//! [`nav-types`](https://crates.io/crates/nav-types) and rotates the offset from a fixed origin into
//! the local East-North-Up frame.
use ::nav_types::{ECEF, WGS84};
use nalgebra::{Matrix3, Vector3};

use crate::error::{OdometryError, Result};

/// Geodesy collaborator: maps latitude and longitude (degrees) to a planar (easting, northing) pair in meters.
pub trait PlanarProjection {
    fn project(&self, latitude: f64, longitude: f64) -> Result<(f64, f64)>;
}

/// Convert an NMEA `ddmm.mmmm` (or `dddmm.mmmm`) coordinate to decimal degrees.
///
/// # Example
/// ```rust
/// use odometry::geodesy::nmea_to_degrees;
/// assert!((nmea_to_degrees(4130.0) - 41.5).abs() < 1e-12);
/// ```
pub fn nmea_to_degrees(value: f64) -> f64 {
    let magnitude = value.abs();
    let degrees = (magnitude / 100.0).trunc();
    let minutes = magnitude - degrees * 100.0;
    (degrees + minutes / 60.0).copysign(value)
}

/// Inverse of [`nmea_to_degrees`].
pub fn degrees_to_nmea(degrees: f64) -> f64 {
    let magnitude = degrees.abs();
    let whole = magnitude.trunc();
    (whole * 100.0 + (magnitude - whole) * 60.0).copysign(degrees)
}

/// Rotation from ECEF into East-North-Up at the given geodetic position (degrees).
pub fn ecef_to_enu(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let (slat, clat) = latitude.to_radians().sin_cos();
    let (slon, clon) = longitude.to_radians().sin_cos();
    Matrix3::new(
        -slon,
        clon,
        0.0,
        -slat * clon,
        -slat * slon,
        clat,
        clat * clon,
        clat * slon,
        slat,
    )
}

fn check_geodetic(latitude: f64, longitude: f64) -> Result<()> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(OdometryError::Projection(format!(
            "non-finite coordinate ({latitude}, {longitude})"
        )));
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=360.0).contains(&longitude) {
        return Err(OdometryError::Projection(format!(
            "coordinate out of range ({latitude}, {longitude})"
        )));
    }
    Ok(())
}

fn to_ecef(latitude: f64, longitude: f64) -> Vector3<f64> {
    let wgs84: WGS84<f64> = WGS84::from_degrees_and_meters(latitude, longitude, 0.0);
    let ecef: ECEF<f64> = ECEF::from(wgs84);
    Vector3::new(ecef.x(), ecef.y(), ecef.z())
}

/// East-North-Up tangent plane anchored at a fixed geodetic origin on the ellipsoid surface.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalTangentPlane {
    latitude: f64,
    longitude: f64,
    origin: Vector3<f64>,
    rotation: Matrix3<f64>,
}

impl LocalTangentPlane {
    /// Plane tangent to the WGS84 ellipsoid at `(latitude, longitude)` in degrees.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        check_geodetic(latitude, longitude)?;
        Ok(LocalTangentPlane {
            latitude,
            longitude,
            origin: to_ecef(latitude, longitude),
            rotation: ecef_to_enu(latitude, longitude),
        })
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    /// Geodetic coordinates (degrees) of a point on the plane.
    pub fn unproject(&self, easting: f64, northing: f64) -> Result<(f64, f64)> {
        if !easting.is_finite() || !northing.is_finite() {
            return Err(OdometryError::Projection(format!(
                "non-finite plane coordinate ({easting}, {northing})"
            )));
        }
        let p = self.origin + self.rotation.transpose() * Vector3::new(easting, northing, 0.0);
        let wgs84: WGS84<f64> = WGS84::from(ECEF::new(p.x, p.y, p.z));
        Ok((wgs84.latitude_degrees(), wgs84.longitude_degrees()))
    }
}

impl PlanarProjection for LocalTangentPlane {
    fn project(&self, latitude: f64, longitude: f64) -> Result<(f64, f64)> {
        check_geodetic(latitude, longitude)?;
        let enu = self.rotation * (to_ecef(latitude, longitude) - self.origin);
        Ok((enu.x, enu.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn nmea_conversion() {
        assert_approx_eq!(nmea_to_degrees(4130.0), 41.5, 1e-12);
        assert_approx_eq!(nmea_to_degrees(212.0), 2.2, 1e-12);
        assert_approx_eq!(nmea_to_degrees(-4130.0), -41.5, 1e-12);
        assert_approx_eq!(nmea_to_degrees(degrees_to_nmea(41.987654)), 41.987654, 1e-9);
        assert_approx_eq!(degrees_to_nmea(3.25), 315.0, 1e-9);
    }

    #[test]
    fn enu_rotation_is_orthonormal() {
        let r = ecef_to_enu(41.7, 3.0);
        let should_be_identity = r * r.transpose();
        assert!((should_be_identity - Matrix3::identity()).abs().max() < 1e-12);
        assert_approx_eq!(r.determinant(), 1.0, 1e-12);
    }

    #[test]
    fn origin_projects_to_zero() {
        let plane = LocalTangentPlane::new(41.7, 3.0).unwrap();
        let (e, n) = plane.project(41.7, 3.0).unwrap();
        assert_approx_eq!(e, 0.0, 1e-6);
        assert_approx_eq!(n, 0.0, 1e-6);
    }

    #[test]
    fn small_offsets_follow_the_axes() {
        let plane = LocalTangentPlane::new(41.7, 3.0).unwrap();
        let (e, n) = plane.project(41.701, 3.0).unwrap();
        assert!(e.abs() < 0.01);
        assert!(n > 110.0 && n < 112.0, "northing {n}");
        let (e, n) = plane.project(41.7, 3.001).unwrap();
        assert!(n.abs() < 0.01);
        assert!(e > 82.0 && e < 84.0, "easting {e}");
    }

    #[test]
    fn unproject_round_trip() {
        let plane = LocalTangentPlane::new(41.7, 3.0).unwrap();
        let (lat, lon) = plane.unproject(250.0, -120.0).unwrap();
        let (e, n) = plane.project(lat, lon).unwrap();
        assert_approx_eq!(e, 250.0, 1e-3);
        assert_approx_eq!(n, -120.0, 1e-3);
    }

    #[test]
    fn invalid_coordinates_are_rejected() {
        assert!(matches!(LocalTangentPlane::new(95.0, 0.0), Err(OdometryError::Projection(_))));
        let plane = LocalTangentPlane::new(0.0, 0.0).unwrap();
        assert!(plane.project(f64::NAN, 0.0).is_err());
        assert!(plane.unproject(f64::INFINITY, 0.0).is_err());
    }
}
