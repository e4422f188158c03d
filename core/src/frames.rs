//! Local tangent plane management for GPS projection
//!
//! A run of the estimator takes place in a single local Cartesian frame anchored at the
//! vehicle's first valid GPS fix and oriented by the vehicle's first measured heading.
//! GPS and magnetometer samples arrive on independent asynchronous streams with no
//! guaranteed ordering, so the anchor is split into two independent one-shot latches:
//!
//! - the *origin* latch, set from the first non-sentinel GPS fix, and
//! - the *rotation* latch, set from the first magnetometer-derived heading.
//!
//! Each latch transitions unset → set exactly once; later calls are no-ops. Callers must
//! gate projection requests on [`LocalTangentPlane::origin_set`] and rotated-frame
//! requests on [`LocalTangentPlane::heading_set`] rather than assuming an arrival order.
//!
//! The projection itself converts the fix to ECEF, differences it against the ECEF
//! origin, and rotates the difference into the east-north-up tangent plane of the
//! origin (see [`crate::earth`]). The frame rotation is then applied about the +z axis
//! so that the vehicle's first measured heading maps onto the configured initial
//! heading.

use nalgebra::{Matrix3, Vector3};

use crate::earth::{ecef_to_enu_rotation, geodetic_to_ecef};

/// Out-of-range stand-in coordinate for an invalid GPS fix.
///
/// When a receiver drops out it reports NaN latitude; callers substitute this value for
/// all three geodetic components before any further processing so that a dropout is
/// visible in the data stream without poisoning downstream arithmetic with NaN. A
/// sentinel fix must never anchor the frame.
pub const GPS_SENTINEL: f64 = -10.0;

/// True when a geodetic fix carries the dropout sentinel.
pub fn is_sentinel_fix(latitude: f64, longitude: f64, altitude: f64) -> bool {
    latitude == GPS_SENTINEL && longitude == GPS_SENTINEL && altitude == GPS_SENTINEL
}

/// Local tangent plane anchored at a one-time origin fix with a one-time rotation.
///
/// Invariant: once set, the origin and rotation never change for the lifetime of the
/// run; every subsequent fix is projected relative to the same anchor.
#[derive(Clone, Debug, Default)]
pub struct LocalTangentPlane {
    /// Geodetic origin (latitude deg, longitude deg, altitude m), valid once `origin_set`
    origin: (f64, f64, f64),
    /// ECEF position of the origin, cached at latch time
    origin_ecef: Vector3<f64>,
    /// ECEF -> ENU rotation at the origin, cached at latch time
    enu_rotation: Matrix3<f64>,
    /// Frame rotation about +z in radians, valid once `heading_set`
    rotation: f64,
    origin_set: bool,
    heading_set: bool,
}

impl LocalTangentPlane {
    pub fn new() -> LocalTangentPlane {
        LocalTangentPlane::default()
    }

    /// Whether the origin latch has been set.
    pub fn origin_set(&self) -> bool {
        self.origin_set
    }

    /// Whether the rotation latch has been set.
    pub fn heading_set(&self) -> bool {
        self.heading_set
    }

    /// Geodetic origin of the frame, if latched.
    pub fn origin(&self) -> Option<(f64, f64, f64)> {
        self.origin_set.then_some(self.origin)
    }

    /// Frame rotation in radians, if latched.
    pub fn rotation(&self) -> Option<f64> {
        self.heading_set.then_some(self.rotation)
    }

    /// Latch the frame origin at the given geodetic point.
    ///
    /// Only the first call has an effect; subsequent calls are ignored. Returns `true`
    /// when this call performed the latch.
    pub fn set_origin(&mut self, latitude: f64, longitude: f64, altitude: f64) -> bool {
        if self.origin_set {
            return false;
        }
        self.origin = (latitude, longitude, altitude);
        self.origin_ecef = geodetic_to_ecef(latitude, longitude, altitude);
        self.enu_rotation = ecef_to_enu_rotation(latitude, longitude);
        self.origin_set = true;
        true
    }

    /// Latch the frame rotation about +z, in radians.
    ///
    /// The value is the offset between the vehicle's first measured heading and the
    /// configured initial heading. Only the first call has an effect; subsequent calls
    /// are ignored. Returns `true` when this call performed the latch.
    pub fn set_rotation(&mut self, theta: f64) -> bool {
        if self.heading_set {
            return false;
        }
        self.rotation = theta;
        self.heading_set = true;
        true
    }

    /// Project a geodetic fix into the (unrotated) tangent plane of the origin.
    ///
    /// Returns `None` until the origin has been latched. The result is the east, north,
    /// and up displacement in meters relative to the origin fix; the origin fix itself
    /// projects to `(0, 0, 0)` up to floating-point tolerance.
    pub fn gps_to_cartesian(
        &self,
        latitude: f64,
        longitude: f64,
        altitude: f64,
    ) -> Option<(f64, f64, f64)> {
        if !self.origin_set {
            return None;
        }
        let ecef = geodetic_to_ecef(latitude, longitude, altitude);
        let enu = self.enu_rotation * (ecef - self.origin_ecef);
        Some((enu[0], enu[1], enu[2]))
    }

    /// Apply the latched frame rotation about the +z axis.
    ///
    /// Returns `None` until the rotation has been latched. The rotation is
    /// counterclockwise by the stored angle, so with a rotation of $\pi/2$ a point 10 m
    /// east of the origin, `(10, 0, 0)`, maps to `(0, 10, 0)`.
    pub fn rotate(&self, x: f64, y: f64, z: f64) -> Option<(f64, f64, f64)> {
        if !self.heading_set {
            return None;
        }
        let (sin_rot, cos_rot) = self.rotation.sin_cos();
        Some((x * cos_rot - y * sin_rot, x * sin_rot + y * cos_rot, z))
    }
}
