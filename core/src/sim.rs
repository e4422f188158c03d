//! Simulation utilities and CSV data loading for the estimation engine.
//!
//! This module provides:
//! - A struct ([`ScenarioRecord`]) for reading and writing sensor scenarios to/from CSV
//! - A scenario generator that propagates a ground-truth trajectory through the same
//!   vehicle model the filters use and synthesizes noisy GPS/magnetometer samples
//! - A closed-loop runner that drives a [`StateEstimator`] from a record stream at the
//!   configured tick rate
//! - A [`NavigationResult`] structure for storing and analyzing the resulting estimates
//!
//! The generator and the runner are what the integration tests and the `groundnav`
//! binary are built on: the same scenario CSV can be replayed against any estimation
//! mode for comparison.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::dynamics::DynamicsParams;
use crate::earth::enu_to_geodetic_offset;
use crate::estimator::{STEERING_RATIO, StateEstimator};
use crate::messages::{ControlSample, GpsFix, GroundTruthSample, MagnetometerSample};
use crate::{ControlInput, VehicleState};

/// One row of a sensor scenario: everything the estimator can be fed at one tick.
///
/// GPS fields are present on every row; `gps_fresh` marks the rows where a new fix
/// actually arrived (the GPS rate is typically below the tick rate).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ScenarioRecord {
    /// Elapsed scenario time in seconds
    pub time_s: f64,
    /// WGS84 latitude in degrees
    pub latitude: f64,
    /// WGS84 longitude in degrees
    pub longitude: f64,
    /// WGS84 altitude in meters
    pub altitude: f64,
    /// Whether this row carries a fresh GPS fix
    pub gps_fresh: bool,
    /// Raw magnetometer field, body x
    pub mag_x: f64,
    /// Raw magnetometer field, body y
    pub mag_y: f64,
    /// Raw magnetometer field, body z
    pub mag_z: f64,
    /// Commanded throttle
    pub throttle: f64,
    /// Raw commanded steering (before the linkage ratio)
    pub steering: f64,
    /// Ground-truth x position in the estimation frame
    pub true_x: f64,
    /// Ground-truth y position in the estimation frame
    pub true_y: f64,
    /// Ground-truth x velocity
    pub true_vx: f64,
    /// Ground-truth y velocity
    pub true_vy: f64,
}

impl ScenarioRecord {
    /// Reads a CSV file and returns a vector of `ScenarioRecord` structs.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<ScenarioRecord>)` if successful.
    /// * `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }

    /// Writes a slice of `ScenarioRecord` structs to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()
    }
}

/// Parameters of a synthetic scenario.
#[derive(Clone, Copy, Debug)]
pub struct ScenarioConfig {
    /// Scenario length in seconds
    pub duration_s: f64,
    /// Tick (and record) rate in Hz
    pub tick_rate: f64,
    /// Interval between fresh GPS fixes in seconds
    pub gps_interval_s: f64,
    /// Geodetic anchor of the run (latitude deg, longitude deg, altitude m)
    pub origin: (f64, f64, f64),
    /// Constant commanded throttle
    pub throttle: f64,
    /// Constant raw steering command
    pub steering: f64,
    /// GPS position noise standard deviation in meters
    pub gps_noise_std: f64,
    /// Magnetometer per-axis field noise standard deviation (unit field)
    pub mag_noise_std: f64,
    /// RNG seed for the sensor noise
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            duration_s: 60.0,
            tick_rate: 10.0,
            gps_interval_s: 1.0,
            origin: (34.0, -118.0, 100.0),
            throttle: 0.5,
            steering: 0.0,
            gps_noise_std: 0.2,
            mag_noise_std: 0.01,
            seed: 42,
        }
    }
}

/// Generate a synthetic sensor scenario by propagating the ground truth through the
/// vehicle model and sampling noisy sensors along the way.
///
/// The truth starts at the frame origin heading due east (heading zero), so the
/// estimation frame coincides with the generation frame up to the magnetometer noise
/// on the very first sample. GPS fixes are emitted every `gps_interval_s`; the
/// magnetometer and control streams run at the full tick rate.
pub fn generate_scenario(config: &ScenarioConfig, dynamics: &DynamicsParams) -> Vec<ScenarioRecord> {
    let dt = 1.0 / config.tick_rate;
    let steps = (config.duration_s * config.tick_rate).round() as usize;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let gps_noise = Normal::new(0.0, config.gps_noise_std).unwrap();
    let mag_noise = Normal::new(0.0, config.mag_noise_std).unwrap();

    let control = ControlInput::new(config.throttle, config.steering / STEERING_RATIO);
    let (lat0, lon0, alt0) = config.origin;
    let mut truth = VehicleState::default();
    let mut records = Vec::with_capacity(steps);
    let mut last_gps_time = f64::NEG_INFINITY;

    for step in 0..steps {
        let time_s = step as f64 * dt;
        let gps_fresh = time_s - last_gps_time >= config.gps_interval_s;
        if gps_fresh {
            last_gps_time = time_s;
        }
        let east = truth.x + gps_noise.sample(&mut rng);
        let north = truth.y + gps_noise.sample(&mut rng);
        let (dlat, dlon) = enu_to_geodetic_offset(east, north, lat0, alt0);

        let (true_vx, true_vy) = truth.velocity();
        records.push(ScenarioRecord {
            time_s,
            latitude: lat0 + dlat,
            longitude: lon0 + dlon,
            altitude: alt0,
            gps_fresh,
            mag_x: truth.heading.cos() + mag_noise.sample(&mut rng),
            mag_y: truth.heading.sin() + mag_noise.sample(&mut rng),
            mag_z: 0.0,
            throttle: config.throttle,
            steering: config.steering,
            true_x: truth.x,
            true_y: truth.y,
            true_vx,
            true_vy,
        });
        truth = dynamics.predict(&truth, &control, dt);
    }
    records
}

/// One row of a navigation solution: the published estimate against the truth.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub time_s: f64,
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub vx: f64,
    pub vy: f64,
    pub true_x: f64,
    pub true_y: f64,
}

/// The collected output of a closed-loop run.
#[derive(Clone, Debug, Default)]
pub struct NavigationResult {
    pub records: Vec<EstimateRecord>,
}

impl NavigationResult {
    /// Root-mean-square position error of the run against the truth.
    pub fn rms_position_error(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let sum_of_squares: f64 = self
            .records
            .iter()
            .map(|r| (r.x - r.true_x).powi(2) + (r.y - r.true_y).powi(2))
            .sum();
        (sum_of_squares / self.records.len() as f64).sqrt()
    }

    /// Writes the navigation solution to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()
    }
}

/// Drive an estimator through a recorded scenario at the fixed tick rate.
///
/// Each record delivers its sensor samples to the estimator's buffers (GPS only on
/// fresh rows), then one tick runs and the published estimate is collected against the
/// truth carried in the record.
pub fn closed_loop(records: &[ScenarioRecord], estimator: &mut StateEstimator) -> NavigationResult {
    let mut result = NavigationResult::default();
    for record in records {
        estimator.handle_control(&ControlSample {
            throttle: record.throttle,
            steering: record.steering,
        });
        estimator.handle_magnetometer(&MagnetometerSample {
            field_x: record.mag_x,
            field_y: record.mag_y,
            field_z: record.mag_z,
        });
        if record.gps_fresh {
            estimator.handle_gps(&GpsFix {
                latitude: record.latitude,
                longitude: record.longitude,
                altitude: record.altitude,
            });
        }
        estimator.handle_ground_truth(&GroundTruthSample {
            x: record.true_x,
            y: record.true_y,
            vx: record.true_vx,
            vy: record.true_vy,
        });

        let estimate = estimator.tick();
        result.records.push(EstimateRecord {
            time_s: record.time_s,
            x: estimate.x,
            y: estimate.y,
            heading: estimate.heading,
            vx: estimate.vx,
            vy: estimate.vy,
            true_x: record.true_x,
            true_y: record.true_y,
        });
    }
    result
}
