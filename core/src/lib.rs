//! Ground-vehicle state estimation toolbox
//!
//! This crate provides the state estimation engine for a small ground vehicle that
//! fuses asynchronous, noisy sensor streams (GPS position, magnetometer heading, and
//! commanded throttle/steering) with a nonlinear vehicle dynamics model. The filters
//! are implemented as structs that are initialized once from a validated configuration
//! and then driven by a fixed-rate tick, with sensor samples buffered between ticks.
//! The crate has no knowledge of any transport or middleware: sensor samples arrive as
//! plain values and the estimate leaves as a plain struct.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nav-types`](https://crates.io/crates/nav-types): Provides basic coordinate types and conversions.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Provides random number generation for particle propagation and simulated sensor noise.
//!
//! All other functionality is built on top of these crates or is auxiliary functionality
//! (e.g. I/O). In general, variables are named according to the quantity they represent
//! and not the symbol used in the literature: the vehicle wheelbase is named `wheelbase`
//! instead of `l`. This style is sometimes relaxed within the body of a given function,
//! but the general rule is to use descriptive names for variables.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [earth]: Constants and geodetic helpers for projecting GPS fixes into a local frame.
//! - [frames]: The local tangent plane manager owning the one-shot origin/rotation latches.
//! - [dynamics]: The 4-DOF single-track vehicle model and its Jacobians.
//! - [kalman]: The Extended Kalman Filter over the vehicle model.
//! - [particle]: The particle filter alternative over the same model.
//! - [linalg]: Linear algebra helpers (symmetrization, SPD solves) for the filters.
//! - [measurements]: Magnetometer heading extraction and the pose observation model.
//! - [messages]: Plain sensor sample and state estimate structures at the engine boundary.
//! - [estimator]: The estimation controller: mode selection, buffering, and the tick cycle.
//! - [sim]: Scenario generation and closed-loop simulation utilities for testing filters.
//!
//! ## Coordinate and state definitions
//!
//! The vehicle state vector is
//!
//! $$
//! x = [p_x, p_y, \theta, v]
//! $$
//!
//! where:
//! - $p_x$ and $p_y$ are the planar position (meters) in the local tangent plane,
//! - $\theta$ is the heading (radians), wrapped to $[0, 2\pi)$,
//! - $v$ is the forward speed (m/s), non-negative for this drivetrain.
//!
//! The local tangent plane is anchored at the vehicle's first valid GPS fix and rotated
//! so that the first measured magnetometer heading maps onto the configured initial
//! heading. Once anchored, the origin and rotation never change for the lifetime of the
//! run; see [frames] for the exact latching protocol.

pub mod dynamics;
pub mod earth;
pub mod estimator;
pub mod frames;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod messages;
pub mod particle;
pub mod sim;

use std::fmt::{self, Display};

use nalgebra::{Vector2, Vector4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Construction-time configuration error.
///
/// The estimation engine refuses to start with an invalid noise or dynamics parameter:
/// these errors are fatal at construction and are never produced once a filter is
/// running. Sensor- and numerics-level problems are recovered locally instead (see the
/// individual filter modules).
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("parameter `{name}` must be finite, got {value}")]
    NotFinite { name: &'static str, value: f64 },
    #[error("parameter `{name}` must be strictly positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("parameter `{name}` must be non-negative, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("particle filter mode requires a non-zero particle count")]
    NoParticles,
}

/// Planar vehicle state: position in the local tangent plane, heading, and forward speed.
///
/// The heading is stored wrapped to $[0, 2\pi)$; every constructor and conversion in this
/// crate enforces the wrap so trigonometric evaluations never see an unwrapped angle.
/// The state is owned by whichever estimator is active and replaced wholesale each cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// X position in meters (local tangent plane)
    pub x: f64,
    /// Y position in meters (local tangent plane)
    pub y: f64,
    /// Heading in radians, wrapped to [0, 2π)
    pub heading: f64,
    /// Forward speed in m/s
    pub speed: f64,
}

impl VehicleState {
    /// Create a new state, wrapping the heading into the canonical range.
    pub fn new(x: f64, y: f64, heading: f64, speed: f64) -> VehicleState {
        VehicleState {
            x,
            y,
            heading: wrap_to_2pi(heading),
            speed,
        }
    }

    /// Velocity components in the local frame, derived from heading and speed.
    pub fn velocity(&self) -> (f64, f64) {
        (
            self.speed * self.heading.cos(),
            self.speed * self.heading.sin(),
        )
    }

    /// True when every component of the state is finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.heading.is_finite()
            && self.speed.is_finite()
    }
}

impl Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VehicleState {{ x: {:.3} m, y: {:.3} m, heading: {:.2} deg, speed: {:.3} m/s }}",
            self.x,
            self.y,
            self.heading.to_degrees(),
            self.speed
        )
    }
}

impl From<VehicleState> for Vector4<f64> {
    /// Converts a VehicleState to a `Vector4<f64>` in [x, y, heading, speed] order.
    fn from(state: VehicleState) -> Self {
        Vector4::new(state.x, state.y, state.heading, state.speed)
    }
}

impl From<Vector4<f64>> for VehicleState {
    /// Converts a `Vector4<f64>` in [x, y, heading, speed] order, wrapping the heading.
    fn from(vector: Vector4<f64>) -> Self {
        VehicleState::new(vector[0], vector[1], vector[2], vector[3])
    }
}

impl TryFrom<&[f64]> for VehicleState {
    type Error = &'static str;
    /// Attempts to create a VehicleState from a slice of 4 elements.
    fn try_from(slice: &[f64]) -> Result<Self, Self::Error> {
        if slice.len() != 4 {
            return Err("Slice must have length 4 for VehicleState");
        }
        Ok(VehicleState::new(slice[0], slice[1], slice[2], slice[3]))
    }
}

/// Commanded vehicle input: dimensionless throttle and steering angle.
///
/// Latest-value semantics apply at the controller boundary: each new sample overwrites
/// the previous one and there is no queue. The steering here is the *effective* steering
/// angle in radians, after the fixed mechanical linkage ratio has been divided out of
/// the raw command (see [`estimator::STEERING_RATIO`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// Dimensionless throttle command, nominally in [0, 1]
    pub throttle: f64,
    /// Effective steering angle in radians
    pub steering: f64,
}

impl ControlInput {
    pub fn new(throttle: f64, steering: f64) -> ControlInput {
        ControlInput { throttle, steering }
    }

    /// True when both components are finite.
    pub fn is_finite(&self) -> bool {
        self.throttle.is_finite() && self.steering.is_finite()
    }
}

impl Display for ControlInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlInput {{ throttle: {:.3}, steering: {:.4} rad }}",
            self.throttle, self.steering
        )
    }
}

impl From<ControlInput> for Vector2<f64> {
    fn from(control: ControlInput) -> Self {
        Vector2::new(control.throttle, control.steering)
    }
}

impl From<Vector2<f64>> for ControlInput {
    fn from(vector: Vector2<f64>) -> Self {
        ControlInput::new(vector[0], vector[1])
    }
}

// --- Miscellaneous functions for wrapping angles ---

/// Wrap an angle to the range $[0, 2\pi)$ radians
///
/// This is the canonical storage range for vehicle headings in this crate.
///
/// # Arguments
/// * `angle` - The angle to be wrapped, in radians.
/// # Returns
/// * The wrapped angle in $[0, 2\pi)$.
/// # Example
/// ```rust
/// use groundnav::wrap_to_2pi;
/// use std::f64::consts::PI;
/// let angle = 5.0 * PI;
/// let wrapped_angle = wrap_to_2pi(angle);
/// assert!((wrapped_angle - PI).abs() < 1e-12);
/// ```
pub fn wrap_to_2pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped >= 2.0 * std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped < 0.0 {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// Used for innovations and residuals, where the *shortest* angular distance is what
/// matters: a raw difference across the $0/2\pi$ boundary would otherwise be amplified
/// by the filter gain.
///
/// # Arguments
/// * `angle` - The angle to be wrapped, in radians.
/// # Returns
/// * The wrapped angle in $(-\pi, \pi]$.
/// # Example
/// ```rust
/// use groundnav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped <= -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Wrap an angle to the range [0, 360) degrees
///
/// Magnetometer headings are handled in degrees up to the point they enter an
/// observation vector; this keeps them in the compass-rose range.
pub fn wrap_to_360(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped >= 360.0 {
        wrapped -= 360.0;
    }
    while wrapped < 0.0 {
        wrapped += 360.0;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_to_2pi() {
        assert_approx_eq!(wrap_to_2pi(5.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_2pi(-PI / 2.0), 3.0 * PI / 2.0, 1e-12);
        assert_eq!(wrap_to_2pi(0.0), 0.0);
        assert_eq!(wrap_to_2pi(2.0 * PI), 0.0);
    }

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_eq!(wrap_to_pi(PI), PI);
    }

    #[test]
    fn test_wrap_to_360() {
        assert_eq!(wrap_to_360(370.0), 10.0);
        assert_eq!(wrap_to_360(-10.0), 350.0);
        assert_eq!(wrap_to_360(0.0), 0.0);
    }

    #[test]
    fn test_vehicle_state_wraps_heading() {
        let state = VehicleState::new(1.0, 2.0, 3.0 * PI, 0.5);
        assert_approx_eq!(state.heading, PI, 1e-12);
    }

    #[test]
    fn test_vehicle_state_vector_round_trip() {
        let state = VehicleState::new(1.0, -2.0, 0.25, 1.5);
        let vector: Vector4<f64> = state.into();
        let back: VehicleState = vector.into();
        assert_eq!(state, back);
    }

    #[test]
    fn test_vehicle_state_velocity() {
        let state = VehicleState::new(0.0, 0.0, PI / 2.0, 2.0);
        let (vx, vy) = state.velocity();
        assert_approx_eq!(vx, 0.0, 1e-12);
        assert_approx_eq!(vy, 2.0, 1e-12);
    }

    #[test]
    fn test_vehicle_state_from_slice() {
        let state = VehicleState::try_from([1.0, 2.0, 0.1, 0.5].as_slice()).unwrap();
        assert_eq!(state.x, 1.0);
        assert!(VehicleState::try_from([1.0, 2.0].as_slice()).is_err());
    }
}
