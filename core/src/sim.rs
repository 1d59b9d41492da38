//! Synthetic sensor logs for exercising the fusion loop against a known trajectory.
//!
//! A [`Scenario`] describes a vehicle holding constant body velocity and turn rate at constant
//! depth. [`simulate`] samples the ground truth at each sensor's rate and writes raw rows in the
//! same layouts the adapters parse, inverting the configured mounting and calibration so that a
//! fused run can be compared against the truth. Noise is Gaussian and seeded.
use std::fs;
use std::path::Path;

use log::info;
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::VehicleState;
use crate::config::{LogPaths, OdometryConfig};
use crate::error::{OdometryError, Result};
use crate::frames::normalize_angle;
use crate::geodesy::{LocalTangentPlane, degrees_to_nmea};
use crate::logs::write_log;
use crate::sensors::{ORIENTATION_FIELDS, VELOCITY_FIELDS};
use crate::stream::{ExhaustionPolicy, SensorKind, SensorStream, StreamMultiplexer};

/// Gravity reported on the orientation sensor's vertical accelerometer (m/s²)
const GRAVITY: f64 = 9.81;

/// Largest number of rows generated for any one stream
const MAX_SAMPLES: f64 = 10_000_000.0;

/// Motion, sampling rates and noise levels of a synthetic run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Timestamp of the first sample (s)
    pub start_time: f64,
    pub duration: f64,
    /// Body-frame surge, sway and heave (m/s)
    pub body_velocity: [f64; 3],
    /// Turn rate (rad/s)
    pub yaw_rate: f64,
    pub initial_yaw: f64,
    pub initial_depth: f64,
    /// Sample rates (Hz); zero disables the stream
    pub velocity_rate: f64,
    pub orientation_rate: f64,
    pub position_fix_rate: f64,
    pub scan_rate: f64,
    /// Noise stdevs: velocity (m/s), depth (m), heading (rad), heading rate (rad/s), position (m)
    pub velocity_noise: f64,
    pub depth_noise: f64,
    pub yaw_noise: f64,
    pub yaw_rate_noise: f64,
    pub position_noise: f64,
    /// Geodetic origin of the run (degrees)
    pub origin: [f64; 2],
    pub seed: u64,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            start_time: 1000.0,
            duration: 120.0,
            body_velocity: [0.5, 0.0, 0.0],
            yaw_rate: 0.01,
            initial_yaw: 0.3,
            initial_depth: 2.0,
            velocity_rate: 5.0,
            orientation_rate: 10.0,
            position_fix_rate: 1.0,
            scan_rate: 2.0,
            velocity_noise: 0.02,
            depth_noise: 0.01,
            yaw_noise: 0.01,
            yaw_rate_noise: 0.005,
            position_noise: 1.5,
            origin: [41.7, 3.0],
            seed: 42,
        }
    }
}

impl Scenario {
    /// Exact vehicle state `t` seconds after the start.
    pub fn truth_at(&self, t: f64) -> VehicleState {
        let [u, v, w] = self.body_velocity;
        let r = self.yaw_rate;
        let yaw0 = self.initial_yaw;
        let yaw = yaw0 + r * t;
        // ∫cos(yaw) and ∫sin(yaw) over [0, t]
        let (int_cos, int_sin) = if r.abs() < 1e-12 {
            (yaw0.cos() * t, yaw0.sin() * t)
        } else {
            ((yaw.sin() - yaw0.sin()) / r, -(yaw.cos() - yaw0.cos()) / r)
        };
        VehicleState {
            x: u * int_cos - v * int_sin,
            y: u * int_sin + v * int_cos,
            z: self.initial_depth + w * t,
            yaw: normalize_angle(yaw),
            surge: u,
            sway: v,
            heave: w,
            yaw_rate: r,
        }
    }

    /// Check that the timing fields describe a finite number of samples per stream.
    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() {
            return Err(OdometryError::Config(format!(
                "scenario start time must be finite, got {}",
                self.start_time
            )));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(OdometryError::Config(format!(
                "scenario duration must be finite and non-negative, got {}",
                self.duration
            )));
        }
        let rates = [
            ("velocity", self.velocity_rate),
            ("orientation", self.orientation_rate),
            ("position fix", self.position_fix_rate),
            ("scan", self.scan_rate),
        ];
        for (name, rate) in rates {
            if !rate.is_finite() || rate < 0.0 {
                return Err(OdometryError::Config(format!(
                    "{name} rate must be finite and non-negative, got {rate}"
                )));
            }
            if self.duration * rate >= MAX_SAMPLES {
                return Err(OdometryError::Config(format!(
                    "{name} stream would exceed {MAX_SAMPLES} samples"
                )));
            }
        }
        Ok(())
    }

    fn sample_times(&self, rate: f64) -> Vec<f64> {
        if rate <= 0.0 || self.duration < 0.0 {
            return Vec::new();
        }
        let count = (self.duration * rate).floor() as usize + 1;
        (0..count).map(|k| k as f64 / rate).collect()
    }
}

/// Truth sample as written to `truth.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TruthRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub surge: f64,
    pub sway: f64,
    pub heave: f64,
    pub yaw_rate: f64,
}

impl TruthRecord {
    fn new(time: f64, s: &VehicleState) -> Self {
        TruthRecord {
            time,
            x: s.x,
            y: s.y,
            z: s.z,
            yaw: s.yaw,
            surge: s.surge,
            sway: s.sway,
            heave: s.heave,
            yaw_rate: s.yaw_rate,
        }
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn state(&self) -> VehicleState {
        VehicleState {
            x: self.x,
            y: self.y,
            z: self.z,
            yaw: self.yaw,
            surge: self.surge,
            sway: self.sway,
            heave: self.heave,
            yaw_rate: self.yaw_rate,
        }
    }
}

/// Raw rows for each sensor plus the truth they were generated from.
#[derive(Clone, Debug, Default)]
pub struct SimulatedLogs {
    pub velocity: Vec<Vec<f64>>,
    pub orientation: Vec<Vec<f64>>,
    pub position_fix: Vec<Vec<f64>>,
    pub scan: Vec<Vec<f64>>,
    pub truth: Vec<TruthRecord>,
}

impl SimulatedLogs {
    pub fn rows(&self, kind: SensorKind) -> &[Vec<f64>] {
        match kind {
            SensorKind::Velocity => &self.velocity,
            SensorKind::Orientation => &self.orientation,
            SensorKind::PositionFix => &self.position_fix,
            SensorKind::Scan => &self.scan,
        }
    }

    /// Streams for every non-empty log, registered in [`SensorKind::ALL`] order.
    pub fn multiplexer(&self, policy: ExhaustionPolicy) -> Result<StreamMultiplexer> {
        let mut mux = StreamMultiplexer::new(policy);
        for kind in SensorKind::ALL {
            let rows = self.rows(kind);
            if !rows.is_empty() {
                mux.add_stream(SensorStream::new(kind, rows.to_vec())?)?;
            }
        }
        Ok(mux)
    }

    /// Write each log as `<kind>.log` and the truth as `truth.csv` into `dir`.
    ///
    /// Returns log paths ready to be placed in an [`OdometryConfig`].
    pub fn write_to<P: AsRef<Path>>(&self, dir: P, delimiter: char) -> Result<LogPaths> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut logs = LogPaths {
            delimiter,
            ..LogPaths::default()
        };
        for kind in SensorKind::ALL {
            let rows = self.rows(kind);
            if rows.is_empty() {
                continue;
            }
            let path = dir.join(format!("{kind}.log"));
            write_log(&path, rows, delimiter, Some(&format!("synthetic {kind} log")))?;
            logs.set_path(kind, path);
        }
        let mut writer = csv::Writer::from_path(dir.join("truth.csv"))?;
        for record in &self.truth {
            writer.serialize(record)?;
        }
        writer.flush()?;
        info!("Wrote synthetic logs to {}", dir.display());
        Ok(logs)
    }
}

fn gaussian(stdev: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, stdev.max(0.0))
        .map_err(|e| OdometryError::Config(format!("invalid noise stdev {stdev}: {e}")))
}

/// Generate raw logs for `scenario` as seen through the sensors described by `config`.
pub fn simulate(scenario: &Scenario, config: &OdometryConfig) -> Result<SimulatedLogs> {
    scenario.validate()?;
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let velocity_noise = gaussian(scenario.velocity_noise)?;
    let depth_noise = gaussian(scenario.depth_noise)?;
    let yaw_noise = gaussian(scenario.yaw_noise)?;
    let yaw_rate_noise = gaussian(scenario.yaw_rate_noise)?;
    let position_noise = gaussian(scenario.position_noise)?;
    let t0 = scenario.start_time;
    let mut logs = SimulatedLogs::default();

    let dvl = &config.velocity;
    if dvl.velocity_scale == 0.0 || dvl.depth_scale == 0.0 {
        return Err(OdometryError::Config(
            "velocity calibration scales must be non-zero".to_string(),
        ));
    }
    let to_sensor = dvl.mounting.rotation().transpose();
    for t in scenario.sample_times(scenario.velocity_rate) {
        let truth = scenario.truth_at(t);
        let body = Vector3::new(truth.surge, truth.sway, truth.heave);
        let noise = Vector3::from_fn(|_, _| velocity_noise.sample(&mut rng));
        let sensor = (to_sensor * body + noise) / dvl.velocity_scale;
        let depth = truth.z + depth_noise.sample(&mut rng);
        let mut row = vec![0.0; VELOCITY_FIELDS];
        row[0] = t0 + t;
        row[11..14].copy_from_slice(sensor.as_slice());
        row[14] = 1.0;
        row[26] = depth / dvl.depth_scale + dvl.pressure_offset;
        logs.velocity.push(row);
    }

    let mount_yaw = config.orientation.mounting.yaw;
    for t in scenario.sample_times(scenario.orientation_rate) {
        let truth = scenario.truth_at(t);
        let yaw = normalize_angle(truth.yaw - mount_yaw + yaw_noise.sample(&mut rng));
        let rate = truth.yaw_rate + yaw_rate_noise.sample(&mut rng);
        let row = vec![
            t0 + t,
            0.0,
            0.0,
            yaw.to_degrees(),
            0.0,
            0.0,
            rate,
            0.0,
            0.0,
            GRAVITY,
        ];
        debug_assert_eq!(row.len(), ORIENTATION_FIELDS);
        logs.orientation.push(row);
    }

    let plane = LocalTangentPlane::new(scenario.origin[0], scenario.origin[1])?;
    for t in scenario.sample_times(scenario.position_fix_rate) {
        let truth = scenario.truth_at(t);
        let easting = truth.y + position_noise.sample(&mut rng);
        let northing = truth.x + position_noise.sample(&mut rng);
        let (lat, lon) = plane.unproject(easting, northing)?;
        logs.position_fix
            .push(vec![t0 + t, degrees_to_nmea(lat), degrees_to_nmea(lon)]);
    }

    for t in scenario.sample_times(scenario.scan_rate) {
        logs.scan.push(vec![t0 + t]);
    }

    for t in scenario.sample_times(scenario.velocity_rate.max(scenario.orientation_rate)) {
        logs.truth.push(TruthRecord::new(t0 + t, &scenario.truth_at(t)));
    }

    info!(
        "Simulated {:.1} s: {} velocity, {} orientation, {} position fix, {} scan rows",
        scenario.duration,
        logs.velocity.len(),
        logs.orientation.len(),
        logs.position_fix.len(),
        logs.scan.len()
    );
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{OrientationReading, PositionFixReading, VelocityReading};
    use crate::geodesy::PlanarProjection;
    use assert_approx_eq::assert_approx_eq;

    fn quiet() -> Scenario {
        Scenario {
            duration: 10.0,
            velocity_noise: 0.0,
            depth_noise: 0.0,
            yaw_noise: 0.0,
            yaw_rate_noise: 0.0,
            position_noise: 0.0,
            ..Scenario::default()
        }
    }

    #[test]
    fn truth_follows_the_arc() {
        let scenario = Scenario {
            body_velocity: [1.0, 0.0, 0.0],
            yaw_rate: std::f64::consts::FRAC_PI_2 / 10.0,
            initial_yaw: 0.0,
            ..Scenario::default()
        };
        let s = scenario.truth_at(10.0);
        let radius = 1.0 / scenario.yaw_rate;
        assert_approx_eq!(s.x, radius, 1e-9);
        assert_approx_eq!(s.y, radius, 1e-9);
        assert_approx_eq!(s.yaw, std::f64::consts::FRAC_PI_2, 1e-12);

        let straight = Scenario {
            yaw_rate: 0.0,
            initial_yaw: 0.0,
            body_velocity: [2.0, 0.0, 0.0],
            ..Scenario::default()
        };
        assert_approx_eq!(straight.truth_at(3.0).x, 6.0, 1e-12);
    }

    #[test]
    fn sample_counts() {
        let logs = simulate(&quiet(), &OdometryConfig::default()).unwrap();
        assert_eq!(logs.velocity.len(), 51);
        assert_eq!(logs.orientation.len(), 101);
        assert_eq!(logs.position_fix.len(), 11);
        assert_eq!(logs.scan.len(), 21);
        assert_eq!(logs.truth.len(), 101);
    }

    #[test]
    fn rows_parse_back_to_the_truth() {
        let scenario = quiet();
        let config = OdometryConfig::default();
        let logs = simulate(&scenario, &config).unwrap();
        let truth = scenario.truth_at(4.0);

        let reading = VelocityReading::parse(&logs.velocity[20], &config.velocity).unwrap();
        let body = reading.body_velocity(&config.velocity);
        assert_approx_eq!(body.x, truth.surge, 1e-9);
        assert_approx_eq!(body.y, truth.sway, 1e-9);
        assert_approx_eq!(reading.depth, truth.z, 1e-9);

        let reading = OrientationReading::parse(&logs.orientation[40], &config.orientation).unwrap();
        assert_approx_eq!(reading.yaw(), truth.yaw, 1e-9);
        assert_approx_eq!(reading.yaw_rate(), truth.yaw_rate, 1e-12);

        let fix = PositionFixReading::parse(&logs.position_fix[4]).unwrap();
        let plane = LocalTangentPlane::new(scenario.origin[0], scenario.origin[1]).unwrap();
        let (e, n) = plane.project(fix.latitude, fix.longitude).unwrap();
        assert_approx_eq!(n, truth.x, 1e-3);
        assert_approx_eq!(e, truth.y, 1e-3);
    }

    #[test]
    fn rejects_unbounded_timing() {
        let config = OdometryConfig::default();
        for duration in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
            let scenario = Scenario {
                duration,
                ..Scenario::default()
            };
            assert!(
                matches!(simulate(&scenario, &config), Err(OdometryError::Config(_))),
                "duration {duration}"
            );
        }
        let scenario = Scenario {
            scan_rate: f64::INFINITY,
            ..Scenario::default()
        };
        assert!(matches!(simulate(&scenario, &config), Err(OdometryError::Config(_))));
        let scenario = Scenario {
            velocity_rate: -5.0,
            ..Scenario::default()
        };
        assert!(scenario.validate().is_err());
        assert!(Scenario::default().validate().is_ok());
        let empty = Scenario {
            duration: 0.0,
            ..Scenario::default()
        };
        assert_eq!(simulate(&empty, &config).unwrap().velocity.len(), 1);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let config = OdometryConfig::default();
        let a = simulate(&Scenario::default(), &config).unwrap();
        let b = simulate(&Scenario::default(), &config).unwrap();
        assert_eq!(a.velocity, b.velocity);
        assert_eq!(a.position_fix, b.position_fix);
        let c = simulate(&Scenario { seed: 7, ..Scenario::default() }, &config).unwrap();
        assert_ne!(a.velocity, c.velocity);
    }

    #[test]
    fn write_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = simulate(&quiet(), &OdometryConfig::default()).unwrap();
        let paths = logs.write_to(dir.path(), ' ').unwrap();
        for kind in SensorKind::ALL {
            assert!(paths.path(kind).unwrap().exists(), "{kind}");
        }
        assert!(dir.path().join("truth.csv").exists());
        let mux = logs.multiplexer(ExhaustionPolicy::DrainRemaining).unwrap();
        assert_eq!(mux.remaining(), 51 + 101 + 11 + 21);
    }
}
