//! Extended Kalman Filter over the 4-DOF vehicle model
//!
//! The Extended Kalman Filter provides a linearized Gaussian approximation to the
//! Bayesian filtering problem for the nonlinear vehicle dynamics. The filter runs a
//! fixed-timestep predict/correct cycle: `predict` is invoked on every tick of the
//! estimation controller, `correct` only when a fresh observation is available.
//!
//! ## Predict step
//!
//! $$
//! \begin{aligned}
//! \bar{x}_{k+1} &= f(x_k, u_k) \\\\
//! \bar{P}_{k+1} &= F_k P_k F_k^T + Q
//! \end{aligned}
//! $$
//!
//! where $f(\cdot)$ is the discrete vehicle model ([`DynamicsParams::predict`]) and
//! $F_k = \partial f / \partial x$ its analytic Jacobian.
//!
//! ## Correct step
//!
//! $$
//! \begin{aligned}
//! S_k &= H \bar{P}_k H^T + R \\\\
//! K_k &= \bar{P}_k H^T S_k^{-1} \\\\
//! x_k &= \bar{x}_k + K_k (z_k - H \bar{x}_k) \\\\
//! P_k &= (I - K_k H) \bar{P}_k
//! \end{aligned}
//! $$
//!
//! The observation model $H$ is linear and time-invariant (position and heading read
//! directly out of the state), the heading innovation is wrapped to the shortest
//! angular distance before use, and $S$ is solved via Cholesky factorization rather
//! than a naive inverse. A singular or indefinite $S$, or a non-finite input, skips the step
//! for that cycle and keeps the predicted state; NaN and Inf never propagate into the
//! filter state.

use log::warn;
use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

use crate::dynamics::DynamicsParams;
use crate::linalg::{chol_solve_spd, symmetrize};
use crate::measurements::{PoseObservation, observation_matrix};
use crate::{ConfigError, ControlInput, VehicleState, wrap_to_pi};

/// Extended Kalman Filter tracking `[x, y, heading, speed]`.
#[derive(Clone, Debug)]
pub struct ExtendedKalmanFilter {
    /// Current state estimate
    state: VehicleState,
    /// State covariance P
    covariance: Matrix4<f64>,
    /// Process noise covariance Q (diagonal)
    process_noise: Matrix4<f64>,
    /// Observation noise covariance R (diagonal)
    observation_noise: Matrix3<f64>,
    /// Vehicle model shared with the other estimators
    dynamics: DynamicsParams,
    /// Fixed timestep of the estimation cycle in seconds
    dt: f64,
}

impl ExtendedKalmanFilter {
    /// Create a new EKF.
    ///
    /// All parameters are validated here; the filter refuses to construct with a
    /// non-finite or negative noise entry, an invalid dynamics parameter, or a
    /// non-positive timestep. The initial covariance is the identity: position and
    /// heading are only loosely known until the first correction arrives.
    ///
    /// # Arguments
    /// * `initial_state` - State at the start of the run (from configuration)
    /// * `dynamics` - Vehicle model constants
    /// * `process_noise_diagonal` - Q diagonal in [x, y, heading, speed] order
    /// * `observation_noise_diagonal` - R diagonal in [x, y, heading] order
    /// * `dt` - Fixed cycle timestep in seconds
    pub fn new(
        initial_state: VehicleState,
        dynamics: DynamicsParams,
        process_noise_diagonal: Vector4<f64>,
        observation_noise_diagonal: Vector3<f64>,
        dt: f64,
    ) -> Result<ExtendedKalmanFilter, ConfigError> {
        dynamics.validate()?;
        validate_noise_diagonal("Q", process_noise_diagonal.as_slice())?;
        validate_noise_diagonal("R", observation_noise_diagonal.as_slice())?;
        if !dt.is_finite() {
            return Err(ConfigError::NotFinite {
                name: "dt",
                value: dt,
            });
        }
        if dt <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "dt",
                value: dt,
            });
        }
        Ok(ExtendedKalmanFilter {
            state: initial_state,
            covariance: Matrix4::identity(),
            process_noise: Matrix4::from_diagonal(&process_noise_diagonal),
            observation_noise: Matrix3::from_diagonal(&observation_noise_diagonal),
            dynamics,
            dt,
        })
    }

    /// Current state estimate.
    pub fn state(&self) -> VehicleState {
        self.state
    }

    /// Current state covariance.
    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.covariance
    }

    /// Re-seat the heading estimate, used when the frame rotation latches and the
    /// vehicle's heading becomes the configured initial heading by definition.
    pub fn reset_heading(&mut self, heading: f64) {
        self.state = VehicleState::new(self.state.x, self.state.y, heading, self.state.speed);
    }

    /// Predict step: advance the state through the vehicle model and propagate the
    /// covariance.
    ///
    /// A non-finite control input skips the step and keeps the current state.
    pub fn predict(&mut self, control: &ControlInput) -> VehicleState {
        if !control.is_finite() {
            warn!("ekf: skipping predict, non-finite control input {control}");
            return self.state;
        }
        let transition = self.dynamics.jacobian_state(&self.state, control, self.dt);
        self.state = self.dynamics.predict(&self.state, control, self.dt);
        self.covariance = symmetrize(
            &(transition * self.covariance * transition.transpose() + self.process_noise),
        );
        self.state
    }

    /// Correct step: fuse a pose observation into the predicted state.
    ///
    /// The heading innovation is wrapped to the shortest angular distance so a
    /// measurement across the 0/2π boundary is not amplified by the gain. If the
    /// innovation covariance cannot be Cholesky factorized, or the observation is
    /// non-finite, the correction is skipped for this cycle and the predicted state is
    /// retained.
    pub fn correct(&mut self, observation: &PoseObservation) -> VehicleState {
        if !observation.is_finite() {
            warn!("ekf: skipping correct, non-finite observation {observation}");
            return self.state;
        }
        let h = observation_matrix();
        let state_vector: Vector4<f64> = self.state.into();
        let mut innovation = observation.vector() - h * state_vector;
        innovation[2] = wrap_to_pi(innovation[2]);

        let innovation_covariance =
            h * self.covariance * h.transpose() + self.observation_noise;
        // K = P Hᵀ S⁻¹, obtained by solving S Kᵀ = H P (P is symmetric)
        let gain_transpose = match chol_solve_spd(&innovation_covariance, &(h * self.covariance)) {
            Some(solved) => solved,
            None => {
                warn!("ekf: skipping correct, innovation covariance not positive definite");
                return self.state;
            }
        };
        let gain = gain_transpose.transpose();

        let corrected: VehicleState = (state_vector + gain * innovation).into();
        if !corrected.is_finite() {
            warn!("ekf: skipping correct, update produced a non-finite state");
            return self.state;
        }
        self.state = corrected;
        self.covariance = symmetrize(&((Matrix4::identity() - gain * h) * self.covariance));
        self.state
    }
}

fn validate_noise_diagonal(name: &'static str, diagonal: &[f64]) -> Result<(), ConfigError> {
    for &value in diagonal {
        if !value.is_finite() {
            return Err(ConfigError::NotFinite { name, value });
        }
        if value < 0.0 {
            return Err(ConfigError::Negative { name, value });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const DT: f64 = 0.1;

    fn default_filter() -> ExtendedKalmanFilter {
        ExtendedKalmanFilter::new(
            VehicleState::default(),
            DynamicsParams::default(),
            Vector4::new(0.1, 0.1, 3.0, 0.1),
            Vector3::new(0.0, 0.0, 0.3),
            DT,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_negative_process_noise() {
        let result = ExtendedKalmanFilter::new(
            VehicleState::default(),
            DynamicsParams::default(),
            Vector4::new(-0.1, 0.1, 3.0, 0.1),
            Vector3::new(0.0, 0.0, 0.3),
            DT,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_dt() {
        let result = ExtendedKalmanFilter::new(
            VehicleState::default(),
            DynamicsParams::default(),
            Vector4::new(0.1, 0.1, 3.0, 0.1),
            Vector3::new(0.0, 0.0, 0.3),
            0.0,
        );
        assert_eq!(
            result.err(),
            Some(ConfigError::NotPositive {
                name: "dt",
                value: 0.0
            })
        );
    }

    #[test]
    fn test_predict_matches_dynamics() {
        let mut ekf = default_filter();
        let control = ControlInput::new(0.5, 0.0);
        let expected =
            DynamicsParams::default().predict(&VehicleState::default(), &control, DT);
        let predicted = ekf.predict(&control);
        assert_eq!(predicted, expected);
    }

    #[test]
    fn test_predict_grows_position_uncertainty() {
        let mut ekf = default_filter();
        let before = ekf.covariance()[(0, 0)];
        ekf.predict(&ControlInput::new(0.5, 0.0));
        assert!(ekf.covariance()[(0, 0)] > before);
    }

    #[test]
    fn test_nonfinite_control_skips_predict() {
        let mut ekf = default_filter();
        let before = ekf.state();
        let after = ekf.predict(&ControlInput::new(f64::NAN, 0.0));
        assert_eq!(before, after);
        assert!(after.is_finite());
    }

    #[test]
    fn test_nonfinite_observation_skips_correct() {
        let mut ekf = default_filter();
        ekf.predict(&ControlInput::new(0.5, 0.0));
        let before = ekf.state();
        let after = ekf.correct(&PoseObservation {
            x: f64::NAN,
            y: 0.0,
            heading: 0.0,
        });
        assert_eq!(before, after);
    }

    #[test]
    fn test_correct_pulls_state_toward_observation() {
        let mut ekf = default_filter();
        ekf.predict(&ControlInput::new(0.5, 0.0));
        let predicted = ekf.state();
        let observation = PoseObservation::new(2.0, 1.0, 0.1);
        let corrected = ekf.correct(&observation);
        assert!((corrected.x - observation.x).abs() < (predicted.x - observation.x).abs());
        assert!((corrected.y - observation.y).abs() < (predicted.y - observation.y).abs());
    }

    #[test]
    fn test_heading_innovation_uses_shortest_distance() {
        // State heading just above zero, observation just below 2π: the corrected
        // heading must stay near the boundary instead of swinging through π.
        let mut ekf = ExtendedKalmanFilter::new(
            VehicleState::new(0.0, 0.0, 0.05, 0.0),
            DynamicsParams::default(),
            Vector4::new(0.1, 0.1, 3.0, 0.1),
            Vector3::new(0.0, 0.0, 0.3),
            DT,
        )
        .unwrap();
        let observation = PoseObservation::new(0.0, 0.0, 2.0 * std::f64::consts::PI - 0.05);
        let corrected = ekf.correct(&observation);
        let distance_to_boundary = wrap_to_pi(corrected.heading).abs();
        assert!(distance_to_boundary < 0.06);
    }

    #[test]
    fn test_covariance_stays_symmetric_psd() {
        let mut ekf = default_filter();
        let mut rng = StdRng::seed_from_u64(7);
        for step in 0..200 {
            let control =
                ControlInput::new(rng.random_range(0.0..1.0), rng.random_range(-0.3..0.3));
            ekf.predict(&control);
            if step % 5 == 0 {
                let observation = PoseObservation::new(
                    rng.random_range(-5.0..5.0),
                    rng.random_range(-5.0..5.0),
                    rng.random_range(0.0..6.2),
                );
                ekf.correct(&observation);
            }
            let covariance = ekf.covariance();
            for i in 0..4 {
                for j in 0..4 {
                    assert_approx_eq!(covariance[(i, j)], covariance[(j, i)], 1e-9);
                }
            }
            for eigenvalue in covariance.symmetric_eigenvalues().iter() {
                assert!(*eigenvalue > -1e-9, "negative eigenvalue {eigenvalue}");
            }
            assert!(ekf.state().is_finite());
        }
    }

    #[test]
    fn test_heading_always_wrapped() {
        let mut ekf = default_filter();
        let control = ControlInput::new(1.0, 0.4);
        for _ in 0..500 {
            let state = ekf.predict(&control);
            assert!(state.heading >= 0.0 && state.heading < 2.0 * std::f64::consts::PI);
        }
    }
}
