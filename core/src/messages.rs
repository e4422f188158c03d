//! Plain data structures at the engine boundary.
//!
//! The estimation engine consumes sensor samples and produces state estimates as plain
//! serde-able structs; whatever transport carries them (middleware topics, a replay
//! file, a test harness) is out of scope for this crate. Inbound samples have
//! latest-value semantics: the controller keeps only the most recent sample of each
//! kind, and a new sample overwrites the previous one without queuing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A geodetic GPS fix.
///
/// A receiver dropout is reported as NaN latitude; the controller substitutes the
/// sentinel coordinate (see [`crate::frames::GPS_SENTINEL`]) before any processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    /// WGS84 latitude in degrees
    pub latitude: f64,
    /// WGS84 longitude in degrees
    pub longitude: f64,
    /// WGS84 altitude in meters
    pub altitude: f64,
}

impl Display for GpsFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpsFix {{ lat: {:.6} deg, lon: {:.6} deg, alt: {:.2} m }}",
            self.latitude, self.longitude, self.altitude
        )
    }
}

/// A raw three-axis magnetometer sample in the body frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MagnetometerSample {
    pub field_x: f64,
    pub field_y: f64,
    pub field_z: f64,
}

impl Display for MagnetometerSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MagnetometerSample {{ [{:.4}, {:.4}, {:.4}] }}",
            self.field_x, self.field_y, self.field_z
        )
    }
}

/// A commanded throttle/steering sample as sent to the vehicle.
///
/// The steering here is the raw command; the controller divides out the mechanical
/// linkage ratio before the value reaches the dynamics model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlSample {
    /// Dimensionless throttle command, nominally in [0, 1]
    pub throttle: f64,
    /// Raw steering command, nominally in [-1, 1]
    pub steering: f64,
}

/// An externally supplied true-state sample, used only in ground-truth mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthSample {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

/// The engine's output: the estimated vehicle state at one tick.
///
/// Velocity is reported as planar components derived from the estimated heading and
/// forward speed, matching what downstream control consumes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEstimate {
    /// Estimated x position in meters (local tangent plane)
    pub x: f64,
    /// Estimated y position in meters (local tangent plane)
    pub y: f64,
    /// Estimated heading in radians, wrapped to [0, 2π)
    pub heading: f64,
    /// Estimated x velocity in m/s
    pub vx: f64,
    /// Estimated y velocity in m/s
    pub vy: f64,
    /// Wall-clock time the estimate was produced
    pub timestamp: DateTime<Utc>,
}

impl Display for StateEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateEstimate {{ x: {:.3} m, y: {:.3} m, heading: {:.2} deg, v: [{:.3}, {:.3}] m/s }}",
            self.x,
            self.y,
            self.heading.to_degrees(),
            self.vx,
            self.vy
        )
    }
}
