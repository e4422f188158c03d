//! Estimation controller: mode selection, sensor buffering, and the fixed-rate cycle
//!
//! The [`StateEstimator`] owns everything a single estimation run needs: the local
//! tangent plane with its one-shot latches, the latest-value sensor buffers, and the
//! active filter. Sensor ingestion and the fixed-rate tick may originate from
//! independent asynchronous sources in the hosting process, but every mutation funnels
//! through `&mut StateEstimator`, so the borrow rules serialize buffer writes against
//! ticks; wrap the estimator in a mutex if the host is multi-threaded.
//! Each inbound handler is an O(1) buffer assignment; the tick is bounded by fixed-size
//! linear algebra (EKF) or O(N) in the particle count (PF).
//!
//! The core sequencing property lives in [`StateEstimator::tick`]: prediction runs on
//! every tick at the configured rate, while correction runs only when a fresh
//! observation has arrived since the last tick. The freshness flag is consumed exactly
//! once, so a GPS stream slower than the tick rate yields predict-only cycles in
//! between fixes and a stale correction is never re-applied.
//!
//! The estimation mode is a closed variant fixed at construction; switching modes
//! mid-run is not supported. In ground-truth mode no filter exists at all, so the
//! EKF/PF code paths cannot be touched even accidentally.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use clap::ValueEnum;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::dynamics::DynamicsParams;
use crate::frames::{GPS_SENTINEL, LocalTangentPlane, is_sentinel_fix};
use crate::kalman::ExtendedKalmanFilter;
use crate::measurements::{PoseObservation, heading_from_magnetic};
use crate::messages::{
    ControlSample, GpsFix, GroundTruthSample, MagnetometerSample, StateEstimate,
};
use crate::particle::ParticleFilter;
use crate::{ConfigError, ControlInput, VehicleState, wrap_to_2pi};

/// Mechanical linkage ratio between the raw steering command and the road-wheel angle.
///
/// Raw commands are divided by this before they reach the dynamics model.
pub const STEERING_RATIO: f64 = 2.2;

/// Which estimator drives the run. Selected once at construction, immutable thereafter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMode {
    /// Pass an externally supplied true-state sample straight through.
    #[default]
    GroundTruth,
    /// Extended Kalman filter over the vehicle model.
    ExtendedKalmanFilter,
    /// Particle filter over the vehicle model.
    ParticleFilter,
}

/// Complete configuration of an estimation run.
///
/// Read once at construction and never mutated afterwards. Defaults match the
/// parameters the model was identified with; any subset can be overridden from a
/// JSON or TOML file via [`EstimatorConfig::from_file`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Estimation mode for this run
    pub mode: EstimationMode,
    /// Process noise for the position states (applied to both x and y)
    pub q1: f64,
    /// Process noise for the heading state
    pub q3: f64,
    /// Process noise for the speed state
    pub q4: f64,
    /// Observation noise for the position components (applied to both x and y)
    pub r1: f64,
    /// Observation noise for the heading component
    pub r3: f64,
    /// Initial x position in meters
    pub x0: f64,
    /// Initial y position in meters
    pub y0: f64,
    /// Initial heading in radians
    pub theta0: f64,
    /// Initial speed in m/s
    pub v0: f64,
    /// Fixed publish/prediction rate in Hz
    pub tick_rate: f64,
    /// Particle count (particle filter mode only)
    pub num_particles: usize,
    /// RNG seed (particle filter mode only); fixed so runs are reproducible
    pub seed: u64,
    /// Publish the raw frame-projected position instead of the filtered one, keeping
    /// the filtered heading and velocity. Diagnostic mode for isolating the velocity
    /// estimate from position corrections.
    pub velocity_only: bool,
    /// Vehicle model constants. Last so the serialized TOML keeps plain values ahead
    /// of the nested table.
    pub dynamics: DynamicsParams,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            mode: EstimationMode::GroundTruth,
            q1: 0.1,
            q3: 3.0,
            q4: 0.1,
            r1: 0.0,
            r3: 0.3,
            x0: 0.0,
            y0: 0.0,
            theta0: 0.0,
            v0: 0.0,
            tick_rate: 10.0,
            num_particles: 500,
            seed: 42,
            velocity_only: false,
            dynamics: DynamicsParams::default(),
        }
    }
}

impl EstimatorConfig {
    /// The process noise diagonal in [x, y, heading, speed] order.
    pub fn process_noise_diagonal(&self) -> nalgebra::Vector4<f64> {
        nalgebra::Vector4::new(self.q1, self.q1, self.q3, self.q4)
    }

    /// The observation noise diagonal in [x, y, heading] order.
    pub fn observation_noise_diagonal(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(self.r1, self.r1, self.r3)
    }

    /// The fixed cycle timestep in seconds.
    pub fn dt(&self) -> f64 {
        1.0 / self.tick_rate
    }

    /// The configured initial state.
    pub fn initial_state(&self) -> VehicleState {
        VehicleState::new(self.x0, self.y0, self.theta0, self.v0)
    }

    /// Check every parameter against its range. Called by
    /// [`StateEstimator::new`]; an invalid configuration never constructs an
    /// estimator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dynamics.validate()?;
        for (name, value) in [
            ("q1", self.q1),
            ("q3", self.q3),
            ("q4", self.q4),
            ("r1", self.r1),
            ("r3", self.r3),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { name, value });
            }
            if value < 0.0 {
                return Err(ConfigError::Negative { name, value });
            }
        }
        for (name, value) in [
            ("x0", self.x0),
            ("y0", self.y0),
            ("theta0", self.theta0),
            ("v0", self.v0),
            ("tick_rate", self.tick_rate),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { name, value });
            }
        }
        if self.tick_rate <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "tick_rate",
                value: self.tick_rate,
            });
        }
        if self.mode == EstimationMode::ParticleFilter && self.num_particles == 0 {
            return Err(ConfigError::NoParticles);
        }
        Ok(())
    }

    /// Write the configuration to a file, choosing the format by extension
    /// (`.json`/`.toml`).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        match extension_of(path).as_deref() {
            Some("json") => {
                let file = File::create(path)?;
                serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
            }
            Some("toml") => {
                let mut file = File::create(path)?;
                let serialized = toml::to_string(self).map_err(io::Error::other)?;
                file.write_all(serialized.as_bytes())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Read the configuration from a file, choosing the format by extension
    /// (`.json`/`.toml`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        match extension_of(path).as_deref() {
            Some("json") => {
                let file = File::open(path)?;
                serde_json::from_reader(file).map_err(io::Error::other)
            }
            Some("toml") => {
                let mut contents = String::new();
                File::open(path)?.read_to_string(&mut contents)?;
                toml::from_str(&contents).map_err(io::Error::other)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// The active filter, fixed at construction. Ground-truth mode carries no filter.
#[derive(Clone, Debug)]
enum FilterKind {
    GroundTruth,
    Ekf(ExtendedKalmanFilter),
    Pf(ParticleFilter),
}

/// The estimation engine for one run of the vehicle.
///
/// Feed it sensor samples through the `handle_*` methods as they arrive, and call
/// [`StateEstimator::tick`] at the configured fixed rate; each tick returns the state
/// estimate to hand to the external publish collaborator.
#[derive(Clone, Debug)]
pub struct StateEstimator {
    mode: EstimationMode,
    filter: FilterKind,
    frame: LocalTangentPlane,
    dt: f64,
    init_x: f64,
    init_y: f64,
    init_theta: f64,
    velocity_only: bool,

    // Latest-value sensor buffers; each is written by exactly one handler and read by
    // the tick.
    control: ControlSample,
    ground_truth: GroundTruthSample,
    /// Latest frame-projected GPS position, valid once both frame latches are set
    observed_x: f64,
    observed_y: f64,
    /// Latest magnetometer heading in degrees, [0, 360)
    heading_degrees: f64,
    /// A fresh projected fix is waiting to be consumed by the next tick
    gps_fresh: bool,
    /// Previous projected fix, for differentiating a ground-track velocity
    last_fix: Option<(f64, f64)>,
    track_velocity: (f64, f64),
}

impl StateEstimator {
    /// Construct an estimator from a validated configuration.
    ///
    /// Configuration errors are fatal here: an estimator with an invalid noise or
    /// dynamics parameter never starts.
    pub fn new(config: &EstimatorConfig) -> Result<StateEstimator, ConfigError> {
        config.validate()?;
        let filter = match config.mode {
            EstimationMode::GroundTruth => FilterKind::GroundTruth,
            EstimationMode::ExtendedKalmanFilter => FilterKind::Ekf(ExtendedKalmanFilter::new(
                config.initial_state(),
                config.dynamics,
                config.process_noise_diagonal(),
                config.observation_noise_diagonal(),
                config.dt(),
            )?),
            EstimationMode::ParticleFilter => FilterKind::Pf(ParticleFilter::new(
                config.initial_state(),
                config.dynamics,
                config.process_noise_diagonal(),
                config.observation_noise_diagonal(),
                config.num_particles,
                config.dt(),
                config.seed,
            )?),
        };
        Ok(StateEstimator {
            mode: config.mode,
            filter,
            frame: LocalTangentPlane::new(),
            dt: config.dt(),
            init_x: config.x0,
            init_y: config.y0,
            init_theta: config.theta0,
            velocity_only: config.velocity_only,
            control: ControlSample::default(),
            ground_truth: GroundTruthSample::default(),
            observed_x: config.x0,
            observed_y: config.y0,
            heading_degrees: 0.0,
            gps_fresh: false,
            last_fix: None,
            track_velocity: (0.0, 0.0),
        })
    }

    /// The estimation mode of this run.
    pub fn mode(&self) -> EstimationMode {
        self.mode
    }

    /// The local tangent plane, for inspecting the latch state.
    pub fn frame(&self) -> &LocalTangentPlane {
        &self.frame
    }

    /// Ground-track velocity from differentiating successive projected fixes.
    ///
    /// Diagnostic only; zero until two fixes have been projected.
    pub fn measured_track_velocity(&self) -> (f64, f64) {
        self.track_velocity
    }

    /// Ingest a GPS fix.
    ///
    /// A non-finite fix is substituted with the out-of-range sentinel and proceeds so
    /// the dropout stays visible downstream, but it can neither anchor the frame nor
    /// count as a fresh measurement for the correction path. Once both frame latches
    /// are set, a valid fix is projected and rotated into the local tangent plane and
    /// flagged fresh for the next tick.
    pub fn handle_gps(&mut self, fix: &GpsFix) {
        let (latitude, longitude, altitude) = if fix.latitude.is_finite()
            && fix.longitude.is_finite()
            && fix.altitude.is_finite()
        {
            (fix.latitude, fix.longitude, fix.altitude)
        } else {
            warn!("gps: non-finite fix {fix}, substituting sentinel coordinate");
            (GPS_SENTINEL, GPS_SENTINEL, GPS_SENTINEL)
        };

        let sentinel = is_sentinel_fix(latitude, longitude, altitude);
        if !sentinel {
            self.frame.set_origin(latitude, longitude, altitude);
        }

        let Some((east, north, up)) = self.frame.gps_to_cartesian(latitude, longitude, altitude)
        else {
            debug!("gps: fix received before the frame origin latched, ignoring");
            return;
        };
        let Some((x, y, _z)) = self.frame.rotate(east, north, up) else {
            debug!("gps: fix received before the frame rotation latched, ignoring");
            return;
        };
        let x = x + self.init_x;
        let y = y + self.init_y;
        self.observed_x = x;
        self.observed_y = y;
        if sentinel {
            // The out-of-range projection stays visible in the buffers, but a dropout
            // is not a fresh measurement and must not enter the correction path.
            return;
        }
        if let Some((last_x, last_y)) = self.last_fix {
            self.track_velocity = ((x - last_x) / self.dt, (y - last_y) / self.dt);
        }
        self.last_fix = Some((x, y));
        self.gps_fresh = true;
    }

    /// Ingest a magnetometer sample.
    ///
    /// The first valid sample latches the frame rotation as the offset between the
    /// measured heading and the configured initial heading, and re-seats the active
    /// filter's heading at the initial heading. Malformed samples are dropped.
    pub fn handle_magnetometer(&mut self, sample: &MagnetometerSample) {
        if !(sample.field_x.is_finite()
            && sample.field_y.is_finite()
            && sample.field_z.is_finite())
        {
            warn!("magnetometer: dropping non-finite sample {sample}");
            return;
        }
        self.heading_degrees = heading_from_magnetic(sample.field_x, sample.field_y);

        if self
            .frame
            .set_rotation(self.heading_degrees.to_radians() - self.init_theta)
        {
            match &mut self.filter {
                FilterKind::Ekf(ekf) => ekf.reset_heading(self.init_theta),
                FilterKind::Pf(pf) => pf.reset_heading(self.init_theta),
                FilterKind::GroundTruth => {}
            }
        }
    }

    /// Ingest a commanded throttle/steering sample. Latest value wins; no queue.
    pub fn handle_control(&mut self, sample: &ControlSample) {
        self.control = *sample;
    }

    /// Ingest an externally supplied true-state sample (ground-truth mode only).
    pub fn handle_ground_truth(&mut self, sample: &GroundTruthSample) {
        self.ground_truth = *sample;
    }

    /// Run one fixed-rate cycle and produce the estimate to publish.
    ///
    /// Prediction runs every tick; correction runs only when a fresh observation is
    /// waiting, and consumes the freshness flag. Before the frame is fully initialized
    /// every cycle is predict-only.
    pub fn tick(&mut self) -> StateEstimate {
        let control = ControlInput::new(
            self.control.throttle,
            self.control.steering / STEERING_RATIO,
        );
        let observation = self.pending_observation();

        let state = match &mut self.filter {
            FilterKind::GroundTruth => {
                // Pure passthrough; the heading is the latest magnetometer bearing,
                // matching what the truth source reports against.
                return StateEstimate {
                    x: self.ground_truth.x,
                    y: self.ground_truth.y,
                    heading: wrap_to_2pi(self.heading_degrees.to_radians()),
                    vx: self.ground_truth.vx,
                    vy: self.ground_truth.vy,
                    timestamp: chrono::Utc::now(),
                };
            }
            FilterKind::Ekf(ekf) => {
                let mut state = ekf.predict(&control);
                if self.gps_fresh {
                    if let Some(observation) = &observation {
                        state = ekf.correct(observation);
                    }
                    self.gps_fresh = false;
                }
                state
            }
            FilterKind::Pf(pf) => {
                let fresh = if self.gps_fresh {
                    self.gps_fresh = false;
                    observation
                } else {
                    None
                };
                pf.update(&control, fresh.as_ref())
            }
        };

        let (vx, vy) = state.velocity();
        let (x, y) = if self.velocity_only {
            (self.observed_x, self.observed_y)
        } else {
            (state.x, state.y)
        };
        StateEstimate {
            x,
            y,
            heading: state.heading,
            vx,
            vy,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Build the observation for this cycle, if the frame is fully initialized.
    ///
    /// The magnetometer heading is mapped into the estimation frame by the latched
    /// rotation, so the observation agrees with the state the filters track.
    fn pending_observation(&self) -> Option<PoseObservation> {
        if !(self.frame.origin_set() && self.frame.heading_set()) {
            return None;
        }
        let rotation = self.frame.rotation()?;
        Some(PoseObservation::new(
            self.observed_x,
            self.observed_y,
            self.heading_degrees.to_radians() - rotation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    fn ekf_config() -> EstimatorConfig {
        EstimatorConfig {
            mode: EstimationMode::ExtendedKalmanFilter,
            ..Default::default()
        }
    }

    /// Magnetometer field pointing along +y: a 90 degree bearing.
    fn east_magnetometer() -> MagnetometerSample {
        MagnetometerSample {
            field_x: 0.0,
            field_y: 1.0,
            field_z: 0.0,
        }
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = EstimatorConfig {
            tick_rate: 0.0,
            ..ekf_config()
        };
        assert!(StateEstimator::new(&config).is_err());

        let config = EstimatorConfig {
            mode: EstimationMode::ParticleFilter,
            num_particles: 0,
            ..Default::default()
        };
        assert_eq!(
            StateEstimator::new(&config).err(),
            Some(ConfigError::NoParticles)
        );
    }

    #[test]
    fn test_first_fix_latches_origin_once() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        assert!(estimator.frame().origin_set());
        estimator.handle_gps(&GpsFix {
            latitude: 35.0,
            longitude: -117.0,
            altitude: 50.0,
        });
        assert_eq!(estimator.frame().origin(), Some((34.0, -118.0, 100.0)));
    }

    #[test]
    fn test_dropout_never_anchors_frame() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_gps(&GpsFix {
            latitude: f64::NAN,
            longitude: f64::NAN,
            altitude: f64::NAN,
        });
        assert!(!estimator.frame().origin_set());
        // The real fix that follows anchors the frame normally
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        assert_eq!(estimator.frame().origin(), Some((34.0, -118.0, 100.0)));
    }

    #[test]
    fn test_first_heading_latches_rotation() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_magnetometer(&east_magnetometer());
        assert!(estimator.frame().heading_set());
        assert_approx_eq!(estimator.frame().rotation().unwrap(), FRAC_PI_2, 1e-9);
        // Later samples update the heading buffer but not the latch
        estimator.handle_magnetometer(&MagnetometerSample {
            field_x: 1.0,
            field_y: 0.0,
            field_z: 0.0,
        });
        assert_approx_eq!(estimator.frame().rotation().unwrap(), FRAC_PI_2, 1e-9);
    }

    #[test]
    fn test_eastward_fix_projects_per_convention() {
        // Origin at (34, -118, 100), first heading 90 deg, theta0 = 0: the stored
        // rotation is pi/2 and a fix 10 m due east projects to approximately (0, 10).
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        estimator.handle_magnetometer(&east_magnetometer());

        let (dlat, dlon) = crate::earth::enu_to_geodetic_offset(10.0, 0.0, 34.0, 100.0);
        estimator.handle_gps(&GpsFix {
            latitude: 34.0 + dlat,
            longitude: -118.0 + dlon,
            altitude: 100.0,
        });
        let observation = estimator.pending_observation().unwrap();
        assert_approx_eq!(observation.x, 0.0, 0.05);
        assert_approx_eq!(observation.y, 10.0, 0.05);
    }

    #[test]
    fn test_predict_only_before_frame_initialized() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        // No sensor data at all: ticks must still produce estimates from prediction
        let first = estimator.tick();
        assert!(first.x.is_finite());
        assert!(estimator.pending_observation().is_none());
    }

    #[test]
    fn test_freshness_flag_consumed_once() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        estimator.handle_magnetometer(&east_magnetometer());
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        assert!(estimator.gps_fresh);
        estimator.tick();
        assert!(!estimator.gps_fresh);
        // A second tick with no new fix stays predict-only
        estimator.tick();
        assert!(!estimator.gps_fresh);
    }

    #[test]
    fn test_ground_truth_mode_is_pure_passthrough() {
        let mut estimator = StateEstimator::new(&EstimatorConfig::default()).unwrap();
        estimator.handle_ground_truth(&GroundTruthSample {
            x: 3.0,
            y: -2.0,
            vx: 0.5,
            vy: 0.1,
        });
        estimator.handle_control(&ControlSample {
            throttle: 1.0,
            steering: 0.5,
        });
        let estimate = estimator.tick();
        assert_eq!(estimate.x, 3.0);
        assert_eq!(estimate.y, -2.0);
        assert_eq!(estimate.vx, 0.5);
        assert_eq!(estimate.vy, 0.1);
        assert!(matches!(estimator.filter, FilterKind::GroundTruth));
    }

    #[test]
    fn test_control_buffer_latest_value_wins() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_control(&ControlSample {
            throttle: 0.2,
            steering: 0.0,
        });
        estimator.handle_control(&ControlSample {
            throttle: 0.9,
            steering: 1.1,
        });
        assert_eq!(estimator.control.throttle, 0.9);
        assert_eq!(estimator.control.steering, 1.1);
    }

    #[test]
    fn test_track_velocity_from_successive_fixes() {
        let mut estimator = StateEstimator::new(&ekf_config()).unwrap();
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        estimator.handle_magnetometer(&MagnetometerSample {
            field_x: 1.0,
            field_y: 0.0,
            field_z: 0.0,
        });
        estimator.handle_gps(&GpsFix {
            latitude: 34.0,
            longitude: -118.0,
            altitude: 100.0,
        });
        let (dlat, dlon) = crate::earth::enu_to_geodetic_offset(1.0, 0.0, 34.0, 100.0);
        estimator.handle_gps(&GpsFix {
            latitude: 34.0 + dlat,
            longitude: -118.0 + dlon,
            altitude: 100.0,
        });
        let (vx, _vy) = estimator.measured_track_velocity();
        // 1 m eastward between fixes at 10 Hz
        assert_approx_eq!(vx, 10.0, 0.5);
    }

    #[test]
    fn test_config_round_trip_through_toml() {
        let config = EstimatorConfig {
            mode: EstimationMode::ParticleFilter,
            q3: 1.5,
            num_particles: 250,
            ..Default::default()
        };
        let dir = std::env::temp_dir().join("groundnav_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        config.to_file(&path).unwrap();
        let restored = EstimatorConfig::from_file(&path).unwrap();
        assert_eq!(restored.mode, EstimationMode::ParticleFilter);
        assert_eq!(restored.q3, 1.5);
        assert_eq!(restored.num_particles, 250);
    }
}
