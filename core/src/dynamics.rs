//! 4-DOF single-track vehicle model
//!
//! This module implements the reduced-order dynamics used as the process model by both
//! filters in this crate. The vehicle is approximated as a single-track (bicycle-like)
//! model with state $[p_x, p_y, \theta, v]$ driven by throttle and steering:
//!
//! $$
//! \begin{aligned}
//! \dot{p}_x &= v \cos\theta \\\\
//! \dot{p}_y &= v \sin\theta \\\\
//! \dot{\theta} &= \frac{v}{l} \tan\delta \\\\
//! \dot{v} &= \frac{1}{m_{eff}} \left( F_{drive}(\alpha, v) - c_1 v - c_0 \right)
//! \end{aligned}
//! $$
//!
//! where $l$ is the wheelbase, $\alpha$ the throttle, and $\delta$ the steering angle.
//! The drivetrain is a reduced-order DC motor model: stall torque $\tau_0$ scaled by
//! throttle, reduced by a back-EMF term proportional to motor speed with no-load speed
//! $\omega_0$, geared to the wheel by the reduction ratio $\gamma$ and wheel radius
//! $r_w$. The effective translational inertia is the wheel inertia reflected through the
//! wheel radius, $m_{eff} = i_w / r_w^2$. Resistance is a linear drag term $c_1 v$ plus
//! a constant rolling term $c_0$ that opposes motion, so with zero control the speed
//! decays to zero and stays there; the drivetrain does not reverse, and the speed state
//! is clamped at zero.
//!
//! Because the speed equation is linear in $v$ for a fixed throttle, the discrete step
//! uses its exact solution over the timestep rather than an Euler step; the drivetrain
//! time constant can be much shorter than the tick period, where a forward Euler update
//! would be unstable. Position and heading use a forward Euler step at the pre-update
//! speed.
//!
//! Everything in this module is a pure function of its arguments: double precision,
//! deterministic, and free of hidden randomness. Non-finite inputs propagate NaN rather
//! than panicking; filtering malformed samples is the caller's responsibility.

use nalgebra::{Matrix4, Matrix4x2};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ControlInput, VehicleState};

/// Physical and empirical constants of the vehicle drivetrain and chassis.
///
/// Loaded once at construction and immutable thereafter. The defaults match the
/// 1/6-scale test vehicle this model was identified on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DynamicsParams {
    /// Linear drag coefficient (N per m/s)
    pub c1: f64,
    /// Constant rolling resistance (N)
    pub c0: f64,
    /// Wheelbase in meters
    pub wheelbase: f64,
    /// Driven wheel radius in meters
    pub wheel_radius: f64,
    /// Wheel (plus reflected driveline) inertia in kg m^2
    pub wheel_inertia: f64,
    /// Gear reduction ratio, wheel speed over motor speed
    pub gear_ratio: f64,
    /// Motor stall torque in N m
    pub tau0: f64,
    /// Motor no-load speed in rad/s
    pub omega0: f64,
}

impl Default for DynamicsParams {
    fn default() -> Self {
        DynamicsParams {
            c1: 0.0001,
            c0: 0.02,
            wheelbase: 0.5,
            wheel_radius: 0.08451952624,
            wheel_inertia: 0.001,
            gear_ratio: 0.33333333,
            tau0: 0.3,
            omega0: 30.0,
        }
    }
}

impl DynamicsParams {
    /// Check every parameter against its physical range.
    ///
    /// The estimator must not start with an invalid dynamics parameter (e.g. a
    /// non-positive wheelbase), so this is called once at filter construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("c1", self.c1),
            ("c0", self.c0),
            ("wheelbase", self.wheelbase),
            ("wheel_radius", self.wheel_radius),
            ("wheel_inertia", self.wheel_inertia),
            ("gear_ratio", self.gear_ratio),
            ("tau0", self.tau0),
            ("omega0", self.omega0),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { name, value });
            }
        }
        for (name, value) in [
            ("wheelbase", self.wheelbase),
            ("wheel_radius", self.wheel_radius),
            ("wheel_inertia", self.wheel_inertia),
            ("gear_ratio", self.gear_ratio),
            ("omega0", self.omega0),
        ] {
            if value <= 0.0 {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        for (name, value) in [("c1", self.c1), ("c0", self.c0), ("tau0", self.tau0)] {
            if value < 0.0 {
                return Err(ConfigError::Negative { name, value });
            }
        }
        Ok(())
    }

    /// Effective translational mass: wheel inertia reflected through the wheel radius.
    fn effective_mass(&self) -> f64 {
        self.wheel_inertia / (self.wheel_radius * self.wheel_radius)
    }

    /// Drive force per unit throttle at stall (N).
    fn drive_gain(&self) -> f64 {
        self.tau0 / (self.gear_ratio * self.wheel_radius)
    }

    /// Back-EMF force per unit speed (N per m/s).
    fn back_emf_gain(&self) -> f64 {
        self.tau0 / (self.gear_ratio * self.gear_ratio * self.omega0 * self.wheel_radius * self.wheel_radius)
    }

    /// Speed decay rate $b$ of the linear speed equation $\dot{v} = a - b v$ (1/s).
    fn speed_decay_rate(&self) -> f64 {
        (self.back_emf_gain() + self.c1) / self.effective_mass()
    }

    /// Advance the state through the vehicle model by `dt` seconds.
    ///
    /// Pure and deterministic. The returned heading is wrapped to $[0, 2\pi)$ and the
    /// returned speed is clamped at zero (the drivetrain does not reverse). Non-finite
    /// inputs propagate NaN.
    pub fn predict(&self, state: &VehicleState, control: &ControlInput, dt: f64) -> VehicleState {
        let (sin_heading, cos_heading) = state.heading.sin_cos();
        let x = state.x + state.speed * cos_heading * dt;
        let y = state.y + state.speed * sin_heading * dt;
        let heading =
            state.heading + state.speed * control.steering.tan() / self.wheelbase * dt;

        let mass = self.effective_mass();
        let accel_forcing = (self.drive_gain() * control.throttle - self.c0) / mass;
        let decay = self.speed_decay_rate();
        let speed = if decay > 0.0 {
            let settle = (-decay * dt).exp();
            state.speed * settle + accel_forcing / decay * (1.0 - settle)
        } else {
            state.speed + accel_forcing * dt
        };
        // Comparison (not f64::max) so a NaN speed stays NaN instead of being clamped
        let speed = if speed < 0.0 { 0.0 } else { speed };

        VehicleState::new(x, y, heading, speed)
    }

    /// Jacobian of the discrete step with respect to the state, $F = \partial f / \partial x$.
    ///
    /// Evaluated on the un-clamped branch of the speed update; the clamp at zero speed
    /// is not differentiable and the filters linearize about the moving regime.
    pub fn jacobian_state(
        &self,
        state: &VehicleState,
        control: &ControlInput,
        dt: f64,
    ) -> Matrix4<f64> {
        let (sin_heading, cos_heading) = state.heading.sin_cos();
        let decay = self.speed_decay_rate();
        let speed_retention = if decay > 0.0 { (-decay * dt).exp() } else { 1.0 };
        let mut jacobian = Matrix4::identity();
        jacobian[(0, 2)] = -state.speed * sin_heading * dt;
        jacobian[(0, 3)] = cos_heading * dt;
        jacobian[(1, 2)] = state.speed * cos_heading * dt;
        jacobian[(1, 3)] = sin_heading * dt;
        jacobian[(2, 3)] = control.steering.tan() / self.wheelbase * dt;
        jacobian[(3, 3)] = speed_retention;
        jacobian
    }

    /// Jacobian of the discrete step with respect to the control, $B = \partial f / \partial u$.
    pub fn jacobian_control(
        &self,
        state: &VehicleState,
        control: &ControlInput,
        dt: f64,
    ) -> Matrix4x2<f64> {
        let mut jacobian = Matrix4x2::zeros();
        let cos_steering = control.steering.cos();
        jacobian[(2, 1)] = state.speed * dt / (self.wheelbase * cos_steering * cos_steering);

        let mass = self.effective_mass();
        let decay = self.speed_decay_rate();
        jacobian[(3, 0)] = if decay > 0.0 {
            self.drive_gain() / mass * (1.0 - (-decay * dt).exp()) / decay
        } else {
            self.drive_gain() / mass * dt
        };
        jacobian
    }
}
