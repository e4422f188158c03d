//! Earth-related constants and geodetic helpers
//!
//! This module contains the constants and conversions needed to project GPS fixes into
//! a local Cartesian frame. The Earth is modeled as the WGS84 ellipsoid with a
//! semi-major and semi-minor axis. For basic positional conversions, the
//! [`nav-types`](https://crates.io/crates/nav-types) crate is used: it provides the
//! `WGS84` and `ECEF` types for representing a position in geodetic and Earth-centered
//! Earth-fixed Cartesian coordinates, respectively, along with the conversions between
//! them.
//!
//! The rotation from the ECEF frame into the local east-north-up (ENU) tangent frame is
//! not directly provided by `nav-types`, so it is implemented here. Together with the
//! ECEF conversion it forms the projection used by [`crate::frames`]: a fix is converted
//! to ECEF, differenced against the ECEF origin, and rotated into the tangent plane of
//! the origin.

use nalgebra::{Matrix3, Vector3};
use nav_types::{ECEF, WGS84};

/// WGS84 equatorial radius (semi-major axis) in meters
pub const EQUATORIAL_RADIUS: f64 = 6378137.0;

/// WGS84 polar radius (semi-minor axis) in meters
pub const POLAR_RADIUS: f64 = 6356752.31425;

/// WGS84 first eccentricity (unit-less)
pub const ECCENTRICITY: f64 = 0.0818191908425;

/// WGS84 first eccentricity squared (unit-less)
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;

/// Calculate the principal radii of curvature of the WGS84 ellipsoid
///
/// The meridian radius governs how northward displacement maps to latitude change and
/// the transverse (prime vertical) radius governs how eastward displacement maps to
/// longitude change. Both are used by the simulation utilities to synthesize geodetic
/// fixes from a planar trajectory.
///
/// # Arguments
/// * `latitude` - The WGS84 latitude in degrees
/// * `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// A tuple `(r_meridian, r_transverse)` in meters, both including the altitude offset.
pub fn principal_radii(latitude: &f64, altitude: &f64) -> (f64, f64) {
    let sin_lat_sq = latitude.to_radians().sin().powi(2);
    let denominator = 1.0 - ECCENTRICITY_SQUARED * sin_lat_sq;
    let r_meridian = EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED) / denominator.powf(1.5);
    let r_transverse = EQUATORIAL_RADIUS / denominator.sqrt();
    (r_meridian + altitude, r_transverse + altitude)
}

/// Convert a geodetic position to an ECEF position vector
///
/// # Arguments
/// * `latitude` - The WGS84 latitude in degrees
/// * `longitude` - The WGS84 longitude in degrees
/// * `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// The ECEF position as a `Vector3<f64>` in meters.
pub fn geodetic_to_ecef(latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
    let wgs84: WGS84<f64> = WGS84::from_degrees_and_meters(latitude, longitude, altitude);
    let ecef: ECEF<f64> = ECEF::from(wgs84);
    Vector3::new(ecef.x(), ecef.y(), ecef.z())
}

/// Calculate the rotation matrix from the ECEF frame to the local ENU frame
///
/// The ENU frame is the right-handed tangent frame at the given geodetic point with the
/// X-axis pointing east, the Y-axis pointing north, and the Z-axis pointing up along the
/// ellipsoid normal. Applying this rotation to an ECEF difference vector expresses it in
/// the tangent plane of that point.
///
/// # Arguments
/// * `latitude` - The WGS84 latitude in degrees
/// * `longitude` - The WGS84 longitude in degrees
///
/// # Returns
/// The 3x3 rotation matrix from ECEF to ENU.
pub fn ecef_to_enu_rotation(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();
    let (sin_lat, cos_lat) = (lat.sin(), lat.cos());
    let (sin_lon, cos_lon) = (lon.sin(), lon.cos());
    Matrix3::new(
        -sin_lon,
        cos_lon,
        0.0,
        -sin_lat * cos_lon,
        -sin_lat * sin_lon,
        cos_lat,
        cos_lat * cos_lon,
        cos_lat * sin_lon,
        sin_lat,
    )
}

/// Convert a local ENU displacement to a geodetic offset
///
/// Small-displacement inverse of the tangent-plane projection, used when synthesizing
/// GPS fixes along a simulated trajectory.
///
/// # Arguments
/// * `east` - Eastward displacement in meters
/// * `north` - Northward displacement in meters
/// * `latitude` - Latitude of the reference point in degrees
/// * `altitude` - Altitude of the reference point in meters
///
/// # Returns
/// A tuple `(dlat, dlon)` in degrees.
pub fn enu_to_geodetic_offset(east: f64, north: f64, latitude: f64, altitude: f64) -> (f64, f64) {
    let (r_meridian, r_transverse) = principal_radii(&latitude, &altitude);
    let dlat = (north / r_meridian).to_degrees();
    let cos_lat = latitude.to_radians().cos().max(1e-6); // Guard against cos(lat) --> 0 near poles
    let dlon = (east / (r_transverse * cos_lat)).to_degrees();
    (dlat, dlon)
}
