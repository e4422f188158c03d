//! Particle filter over the 4-DOF vehicle model
//!
//! A nonparametric alternative to the EKF in [`crate::kalman`]: the belief over the
//! vehicle state is represented as a weighted set of discrete samples propagated
//! through the same dynamics model with injected process noise and reweighted against
//! pose observations. Unlike the EKF, the filter needs no Jacobians; it exercises only
//! [`DynamicsParams::predict`].
//!
//! One call to [`ParticleFilter::update`] performs a full cycle:
//! 1. every particle is propagated through the dynamics with independently sampled
//!    process noise drawn from the Q diagonal (scaled by $\sqrt{dt}$),
//! 2. if a fresh observation is supplied, each particle's importance weight is
//!    multiplied by the Gaussian likelihood of the observation given the particle's
//!    pose (covariance from the R diagonal), weights are normalized, and the set is
//!    systematically resampled when the effective sample size $1 / \sum w_i^2$ falls
//!    below the configured fraction of the particle count,
//! 3. the weighted mean is returned as the point estimate, with a circular mean for
//!    the heading component.
//!
//! With no observation the cycle is propagation-only (no reweighting, no resampling),
//! mirroring the EKF's skip-correct behavior when nothing fresh has arrived.
//!
//! The random number generator is seeded at construction so a run is reproducible.

use log::warn;
use nalgebra::{Vector3, Vector4};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::dynamics::DynamicsParams;
use crate::measurements::PoseObservation;
use crate::{ConfigError, ControlInput, VehicleState, wrap_to_2pi, wrap_to_pi};

/// One weighted sample of the vehicle state.
#[derive(Clone, Copy, Debug)]
pub struct Particle {
    pub state: VehicleState,
    pub weight: f64,
}

/// Particle filter tracking `[x, y, heading, speed]`.
#[derive(Clone, Debug)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    dynamics: DynamicsParams,
    /// Per-axis process noise standard deviations (square roots of the Q diagonal)
    process_noise_std: Vector4<f64>,
    /// Per-axis observation noise standard deviations (square roots of the R diagonal)
    observation_noise_std: Vector3<f64>,
    /// Fixed cycle timestep in seconds
    dt: f64,
    /// Resample when the effective sample size drops below this fraction of the count
    resample_threshold: f64,
    rng: StdRng,
}

impl ParticleFilter {
    /// Create a new particle filter with `num_particles` samples drawn from a Gaussian
    /// prior around the initial state (per-axis standard deviations from the Q
    /// diagonal).
    ///
    /// All parameters are validated; construction fails rather than starting a filter
    /// with an invalid noise or dynamics parameter. The `seed` fixes the random number
    /// generator so runs are reproducible.
    pub fn new(
        initial_state: VehicleState,
        dynamics: DynamicsParams,
        process_noise_diagonal: Vector4<f64>,
        observation_noise_diagonal: Vector3<f64>,
        num_particles: usize,
        dt: f64,
        seed: u64,
    ) -> Result<ParticleFilter, ConfigError> {
        dynamics.validate()?;
        if num_particles == 0 {
            return Err(ConfigError::NoParticles);
        }
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
        for (name, diagonal) in [
            ("Q", process_noise_diagonal.as_slice()),
            ("R", observation_noise_diagonal.as_slice()),
        ] {
            for &value in diagonal {
                if !value.is_finite() {
                    return Err(ConfigError::NotFinite { name, value });
                }
                if value < 0.0 {
                    return Err(ConfigError::Negative { name, value });
                }
            }
        }

        let process_noise_std = process_noise_diagonal.map(f64::sqrt);
        let observation_noise_std = observation_noise_diagonal.map(f64::sqrt);
        let mut rng = StdRng::seed_from_u64(seed);

        let uniform_weight = 1.0 / num_particles as f64;
        let mut particles = Vec::with_capacity(num_particles);
        let initial: Vector4<f64> = initial_state.into();
        for _ in 0..num_particles {
            let mut sample = initial;
            for axis in 0..4 {
                if process_noise_std[axis] > 0.0 {
                    let normal = Normal::new(0.0, process_noise_std[axis]).unwrap();
                    sample[axis] += normal.sample(&mut rng);
                }
            }
            particles.push(Particle {
                state: VehicleState::from(sample),
                weight: uniform_weight,
            });
        }

        Ok(ParticleFilter {
            particles,
            dynamics,
            process_noise_std,
            observation_noise_std,
            dt,
            resample_threshold: 0.5,
            rng,
        })
    }

    /// Number of particles in the set.
    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    /// Read-only access to the particle set.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Effective sample size, $N_{eff} = 1 / \sum w_i^2$.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }

    /// Re-seat the heading of the whole particle set, used when the frame rotation
    /// latches and the vehicle's heading becomes the configured initial heading by
    /// definition. The set's spread around the mean is preserved.
    pub fn reset_heading(&mut self, heading: f64) {
        let shift = wrap_to_pi(heading - self.estimate().heading);
        for particle in &mut self.particles {
            let state = particle.state;
            particle.state =
                VehicleState::new(state.x, state.y, state.heading + shift, state.speed);
        }
    }

    /// Run one filter cycle: propagate, then (with a fresh observation) reweight and
    /// resample. Returns the weighted-mean state estimate.
    ///
    /// A non-finite control input skips the whole cycle; a non-finite observation
    /// degrades the cycle to propagation-only. Both are recoverable and logged.
    pub fn update(
        &mut self,
        control: &ControlInput,
        observation: Option<&PoseObservation>,
    ) -> VehicleState {
        if !control.is_finite() {
            warn!("particle filter: skipping cycle, non-finite control input {control}");
            return self.estimate();
        }
        self.propagate(control);

        match observation {
            Some(observation) if observation.is_finite() => {
                self.reweight(observation);
                if self.normalize_weights() {
                    let threshold = self.resample_threshold * self.num_particles() as f64;
                    if self.effective_sample_size() < threshold {
                        self.systematic_resample();
                    }
                }
            }
            Some(observation) => {
                warn!("particle filter: ignoring non-finite observation {observation}");
            }
            None => {}
        }
        self.estimate()
    }

    /// Weighted mean of the particle set, with a circular mean for the heading.
    pub fn estimate(&self) -> VehicleState {
        let mut x = 0.0;
        let mut y = 0.0;
        let mut speed = 0.0;
        let mut heading_sin = 0.0;
        let mut heading_cos = 0.0;
        for particle in &self.particles {
            x += particle.weight * particle.state.x;
            y += particle.weight * particle.state.y;
            speed += particle.weight * particle.state.speed;
            heading_sin += particle.weight * particle.state.heading.sin();
            heading_cos += particle.weight * particle.state.heading.cos();
        }
        let heading = wrap_to_2pi(heading_sin.atan2(heading_cos));
        VehicleState::new(x, y, heading, speed)
    }

    /// Propagate every particle through the dynamics with sampled process noise.
    fn propagate(&mut self, control: &ControlInput) {
        let dt_sqrt = self.dt.sqrt();
        for particle in &mut self.particles {
            let predicted = self.dynamics.predict(&particle.state, control, self.dt);
            let mut sample: Vector4<f64> = predicted.into();
            for axis in 0..4 {
                if self.process_noise_std[axis] > 0.0 {
                    let normal = Normal::new(0.0, self.process_noise_std[axis]).unwrap();
                    sample[axis] += normal.sample(&mut self.rng) * dt_sqrt;
                }
            }
            // Speed stays non-negative under noise as well
            if sample[3] < 0.0 {
                sample[3] = 0.0;
            }
            particle.state = VehicleState::from(sample);
        }
    }

    /// Multiply each particle's weight by the Gaussian likelihood of the observation.
    ///
    /// Log-likelihoods are shifted by their maximum before exponentiation so a tight
    /// observation cannot underflow the whole set. Axes with zero observation noise
    /// are skipped: a zero-variance axis carries no usable likelihood for a sampled
    /// filter.
    fn reweight(&mut self, observation: &PoseObservation) {
        let mut log_likelihoods = Vec::with_capacity(self.particles.len());
        for particle in &self.particles {
            let residual = [
                observation.x - particle.state.x,
                observation.y - particle.state.y,
                wrap_to_pi(observation.heading - particle.state.heading),
            ];
            let mut log_likelihood = 0.0;
            for axis in 0..3 {
                let std_dev = self.observation_noise_std[axis];
                if std_dev > 0.0 {
                    let normalized = residual[axis] / std_dev;
                    log_likelihood -= 0.5 * normalized * normalized + std_dev.ln();
                }
            }
            log_likelihoods.push(log_likelihood);
        }
        let max_log_likelihood = log_likelihoods
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        for (particle, log_likelihood) in self.particles.iter_mut().zip(log_likelihoods) {
            particle.weight *= (log_likelihood - max_log_likelihood).exp();
        }
    }

    /// Normalize weights to sum to one. A degenerate (zero or non-finite) weight sum
    /// resets the set to uniform weights and reports `false` so the caller skips
    /// resampling for this cycle.
    fn normalize_weights(&mut self) -> bool {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
            true
        } else {
            warn!("particle filter: degenerate weights, resetting to uniform");
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
            false
        }
    }

    /// Systematic resampling: a single random offset and evenly spaced positions over
    /// the cumulative weights. Lower variance than multinomial resampling and O(N).
    fn systematic_resample(&mut self) {
        let n = self.particles.len();
        let uniform = 1.0 / n as f64;
        let offset = self.rng_uniform() * uniform;
        let mut resampled = Vec::with_capacity(n);
        let mut cumulative = self.particles[0].weight;
        let mut source = 0;
        for step in 0..n {
            let position = offset + step as f64 * uniform;
            while position > cumulative && source < n - 1 {
                source += 1;
                cumulative += self.particles[source].weight;
            }
            resampled.push(Particle {
                state: self.particles[source].state,
                weight: uniform,
            });
        }
        self.particles = resampled;
    }

    fn rng_uniform(&mut self) -> f64 {
        use rand::Rng;
        self.rng.random_range(0.0..1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const DT: f64 = 0.1;

    fn default_filter(seed: u64) -> ParticleFilter {
        ParticleFilter::new(
            VehicleState::default(),
            DynamicsParams::default(),
            Vector4::new(0.1, 0.1, 0.05, 0.01),
            Vector3::new(0.5, 0.5, 0.3),
            500,
            DT,
            seed,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_particles() {
        let result = ParticleFilter::new(
            VehicleState::default(),
            DynamicsParams::default(),
            Vector4::zeros(),
            Vector3::zeros(),
            0,
            DT,
            42,
        );
        assert_eq!(result.err(), Some(ConfigError::NoParticles));
    }

    #[test]
    fn test_initial_weights_are_uniform() {
        let pf = default_filter(42);
        let expected = 1.0 / 500.0;
        for particle in pf.particles() {
            assert_approx_eq!(particle.weight, expected, 1e-12);
        }
        assert_approx_eq!(pf.effective_sample_size(), 500.0, 1e-6);
    }

    #[test]
    fn test_same_seed_same_run() {
        let mut a = default_filter(9);
        let mut b = default_filter(9);
        let control = ControlInput::new(0.5, 0.05);
        let observation = PoseObservation::new(0.1, 0.0, 0.0);
        for _ in 0..10 {
            let estimate_a = a.update(&control, Some(&observation));
            let estimate_b = b.update(&control, Some(&observation));
            assert_eq!(estimate_a, estimate_b);
        }
    }

    #[test]
    fn test_propagation_only_keeps_weights() {
        let mut pf = default_filter(42);
        pf.update(&ControlInput::new(0.5, 0.0), None);
        let expected = 1.0 / 500.0;
        for particle in pf.particles() {
            assert_approx_eq!(particle.weight, expected, 1e-12);
        }
    }

    #[test]
    fn test_heading_always_wrapped() {
        let mut pf = default_filter(3);
        let control = ControlInput::new(1.0, 0.3);
        for _ in 0..50 {
            let estimate = pf.update(&control, None);
            assert!(estimate.heading >= 0.0 && estimate.heading < 2.0 * std::f64::consts::PI);
            for particle in pf.particles() {
                assert!(particle.state.heading >= 0.0);
                assert!(particle.state.heading < 2.0 * std::f64::consts::PI);
            }
        }
    }

    #[test]
    fn test_converges_toward_consistent_observation() {
        let mut pf = default_filter(42);
        let control = ControlInput::default();
        let observation = PoseObservation::new(2.0, -1.0, 0.3);
        let mut estimate = VehicleState::default();
        for _ in 0..50 {
            estimate = pf.update(&control, Some(&observation));
        }
        assert!((estimate.x - observation.x).abs() < 0.5);
        assert!((estimate.y - observation.y).abs() < 0.5);
        assert!(wrap_to_pi(estimate.heading - observation.heading).abs() < 0.2);
    }

    #[test]
    fn test_resampling_restores_effective_sample_size() {
        let mut pf = default_filter(42);
        let control = ControlInput::default();
        let observation = PoseObservation::new(3.0, 3.0, 1.0);
        let threshold = 0.5 * pf.num_particles() as f64;
        for _ in 0..30 {
            pf.update(&control, Some(&observation));
            // After a cycle the set either kept a healthy spread or was just resampled
            // back to uniform weights; both leave the ESS at or above the threshold.
            assert!(pf.effective_sample_size() >= threshold * 0.99);
        }
    }

    #[test]
    fn test_circular_mean_near_boundary() {
        // Particles straddling the 0/2π boundary must average to the boundary, not π
        let mut pf = ParticleFilter::new(
            VehicleState::new(0.0, 0.0, 0.0, 0.0),
            DynamicsParams::default(),
            Vector4::zeros(),
            Vector3::new(0.5, 0.5, 0.3),
            100,
            DT,
            1,
        )
        .unwrap();
        for (index, particle) in pf.particles.iter_mut().enumerate() {
            let heading = if index % 2 == 0 { 0.1 } else { 2.0 * std::f64::consts::PI - 0.1 };
            particle.state = VehicleState::new(0.0, 0.0, heading, 0.0);
        }
        let estimate = pf.estimate();
        assert!(wrap_to_pi(estimate.heading).abs() < 1e-6);
    }

    #[test]
    fn test_reset_heading_recenters_set() {
        let mut pf = default_filter(11);
        pf.reset_heading(1.0);
        assert_approx_eq!(pf.estimate().heading, 1.0, 1e-9);
    }
}
