//! Observation-related code for the estimation engine.
//!
//! This module covers the two measurement paths feeding the filters: extraction of a
//! compass heading from a raw magnetometer field vector, and the pose observation model
//! shared by the EKF and the particle filter. The observation is linear and
//! time-invariant: it selects position and heading directly out of the state vector,
//! $z = H x$ with $H$ the constant 3×4 selector of $(p_x, p_y, \theta)$.

use std::fmt::{self, Display};

use nalgebra::{Matrix3x4, Vector3};
use serde::{Deserialize, Serialize};

use crate::{wrap_to_2pi, wrap_to_360};

/// Magnetometer LSB-to-Gauss scale for the onboard sensor.
pub const GAUSS_PER_LSB: f64 = 0.48828125;

/// Derive a compass heading from a raw magnetometer field vector.
///
/// The raw x/y field components are scaled to Gauss and converted to a bearing with
/// `atan2`. The scale cancels inside the arctangent but is kept so intermediate values
/// match the sensor's calibration sheet. Only the in-plane components participate; the
/// vehicle is assumed level.
///
/// # Arguments
/// * `field_x` - Raw magnetic field along the body x axis
/// * `field_y` - Raw magnetic field along the body y axis
///
/// # Returns
/// The heading in degrees, wrapped to [0, 360). Non-finite inputs yield NaN.
pub fn heading_from_magnetic(field_x: f64, field_y: f64) -> f64 {
    let x_gauss = field_x * GAUSS_PER_LSB;
    let y_gauss = field_y * GAUSS_PER_LSB;
    wrap_to_360(y_gauss.atan2(x_gauss).to_degrees())
}

/// Pose observation: frame-projected GPS position plus magnetometer heading.
///
/// Built by the estimation controller from the most recent GPS fix projected into the
/// local tangent plane and the most recent magnetometer heading. Only valid after the
/// frame is fully initialized; the controller carries a separate freshness flag that is
/// consumed exactly once per correction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseObservation {
    /// Observed x position in meters (local tangent plane)
    pub x: f64,
    /// Observed y position in meters (local tangent plane)
    pub y: f64,
    /// Observed heading in radians, wrapped to [0, 2π)
    pub heading: f64,
}

impl PoseObservation {
    pub fn new(x: f64, y: f64, heading: f64) -> PoseObservation {
        PoseObservation {
            x,
            y,
            heading: wrap_to_2pi(heading),
        }
    }

    /// The observation as a vector in [x, y, heading] order.
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.heading)
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.heading.is_finite()
    }
}

impl Display for PoseObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoseObservation {{ x: {:.3} m, y: {:.3} m, heading: {:.2} deg }}",
            self.x,
            self.y,
            self.heading.to_degrees()
        )
    }
}

/// The constant observation matrix $H$ selecting $(p_x, p_y, \theta)$ from the state.
pub fn observation_matrix() -> Matrix3x4<f64> {
    let mut h = Matrix3x4::zeros();
    h[(0, 0)] = 1.0;
    h[(1, 1)] = 1.0;
    h[(2, 2)] = 1.0;
    h
}
