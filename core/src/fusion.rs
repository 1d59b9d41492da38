//! The predict/correct loop that turns a multiplexed sensor log into a trajectory.
//!
//! For every record the multiplexer returns:
//!
//! 1. `dt` is the record's timestamp minus the last timestamp the filter processed (0 for the first).
//! 2. An uninitialized filter is bootstrapped from the first record that yields a correction.
//! 3. Otherwise the filter predicts by `dt` and, if the record carries a correction, corrects.
//! 4. Every applied correction appends `(timestamp, state, covariance)` to the trajectory.
//!
//! Water-track velocities, heading-rate observations and position-fix corrections are available
//! through [`FusionOptions`] but inactive by default. Position fixes are always projected and
//! logged relative to the odometry origin so they can be compared against the trajectory.
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::OdometryConfig;
use crate::error::{OdometryError, Result};
use crate::geodesy::LocalTangentPlane;
use crate::kalman::{Estimate, ExtendedKalmanFilter};
use crate::measurements::Measurement;
use crate::sensors::{
    PositionFixReading, SensorRecord, VelocityMode, orientation_measurement, position_fix,
    position_fix_measurement, velocity_measurement,
};
use crate::state_index::{X, Y};
use crate::stream::{ExhaustionPolicy, RawRecord, StreamMultiplexer};

/// Switches for the optional correction paths and the merge policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionOptions {
    /// Correct with velocity readings taken in water-track mode
    pub correct_with_water_track: bool,
    /// Correct horizontal position with projected position fixes
    pub correct_with_position_fix: bool,
    /// Observe heading rate alongside heading from the orientation sensor
    pub observe_yaw_rate: bool,
    /// Multiplexer behaviour when a stream runs out
    pub exhaustion_policy: ExhaustionPolicy,
    /// Variance seeded at bootstrap for states the first measurement does not observe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_unobserved_variance: Option<f64>,
}

/// One logged estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryEntry {
    pub timestamp: f64,
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Append-only sequence of logged estimates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn with_capacity(capacity: usize) -> Self {
        Trajectory {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, timestamp: f64, estimate: &Estimate) {
        self.entries.push(TrajectoryEntry {
            timestamp,
            state: estimate.state.clone(),
            covariance: estimate.covariance.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TrajectoryEntry> {
        self.entries.last()
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.timestamp).collect()
    }

    pub fn covariances(&self) -> Vec<DMatrix<f64>> {
        self.entries.iter().map(|e| e.covariance.clone()).collect()
    }

    /// Values of one state element over time.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.entries.iter().map(|e| e.state[index]).collect()
    }
}

/// Position fix expressed in the odometry frame (x north, y east).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionFixSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
}

/// Counters describing a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub records: usize,
    pub predictions: usize,
    pub corrections: usize,
    pub skipped: usize,
}

/// What processing a single record did to the filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Bootstrapped,
    Predicted,
    Corrected,
    /// The record could not be used yet (e.g. no bootstrap measurement so far)
    Skipped,
    /// The record's timestamp precedes the last processed one
    Stale,
}

/// Everything a run produces.
#[derive(Clone, Debug, Default)]
pub struct FusionResult {
    pub trajectory: Trajectory,
    pub position_fixes: Vec<PositionFixSample>,
    /// Heading reported by the orientation sensor, as (timestamp, yaw)
    pub heading_observations: Vec<(f64, f64)>,
    pub stats: FusionStats,
    pub final_estimate: Option<Estimate>,
}

/// Drives the filter from a record sequence.
pub struct FusionEngine<'a> {
    config: &'a OdometryConfig,
    filter: ExtendedKalmanFilter,
    last_timestamp: Option<f64>,
    projection: Option<LocalTangentPlane>,
    /// Planar (north, east) of the odometry origin in projection coordinates
    fix_offset: Option<(f64, f64)>,
    result: FusionResult,
}

impl<'a> FusionEngine<'a> {
    pub fn new(config: &'a OdometryConfig) -> Result<Self> {
        let mut filter = ExtendedKalmanFilter::constant_velocity(config.filter.acceleration_stdevs)?;
        if let Some(variance) = config.fusion.bootstrap_unobserved_variance {
            filter = filter.with_unobserved_variance(variance);
        }
        let projection = match config.position.origin {
            Some([lat, lon]) => Some(LocalTangentPlane::new(lat, lon)?),
            None => None,
        };
        Ok(FusionEngine {
            config,
            filter,
            last_timestamp: None,
            projection,
            fix_offset: None,
            result: FusionResult::default(),
        })
    }

    pub fn filter(&self) -> &ExtendedKalmanFilter {
        &self.filter
    }

    pub fn result(&self) -> &FusionResult {
        &self.result
    }

    /// Consume the multiplexer until it reports exhaustion.
    ///
    /// [`OdometryError::StreamExhausted`] ends the run normally; any other error aborts it.
    pub fn run(mut self, mux: &mut StreamMultiplexer) -> Result<FusionResult> {
        self.result.trajectory = Trajectory::with_capacity(mux.remaining());
        loop {
            match mux.next_record() {
                Ok(record) => {
                    self.process(&record)?;
                }
                Err(e) if e.is_exhausted() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.finish())
    }

    /// Final result, including the last estimate.
    pub fn finish(mut self) -> FusionResult {
        self.result.final_estimate = self.filter.estimate().cloned();
        let stats = self.result.stats;
        info!(
            "Fusion finished: {} records, {} predictions, {} corrections, {} skipped, {} trajectory entries",
            stats.records,
            stats.predictions,
            stats.corrections,
            stats.skipped,
            self.result.trajectory.len()
        );
        self.result
    }

    /// Process one record.
    pub fn process(&mut self, record: &RawRecord) -> Result<StepOutcome> {
        self.result.stats.records += 1;
        let parsed = SensorRecord::parse(record, &self.config.velocity, &self.config.orientation)?;
        let timestamp = parsed.timestamp();

        let dt = match self.last_timestamp {
            Some(previous) if timestamp < previous => {
                warn!(
                    "Skipping {} record at {timestamp:.3}: older than last processed {previous:.3}",
                    parsed.kind()
                );
                self.result.stats.skipped += 1;
                return Ok(StepOutcome::Stale);
            }
            Some(previous) => timestamp - previous,
            None => 0.0,
        };

        if let SensorRecord::Orientation(reading) = &parsed {
            self.result.heading_observations.push((timestamp, reading.yaw()));
        }
        let fix = match &parsed {
            SensorRecord::PositionFix(reading) => Some(self.log_position_fix(reading)?),
            _ => None,
        };

        let correction = self.correction_for(&parsed, fix)?;

        if !self.filter.is_initialized() {
            return match correction {
                Some(measurement) => {
                    self.filter.bootstrap(&measurement)?;
                    self.last_timestamp = Some(timestamp);
                    info!("Bootstrapped from {} record at {timestamp:.3}", parsed.kind());
                    Ok(StepOutcome::Bootstrapped)
                }
                None => {
                    debug!("Waiting for a bootstrap measurement, skipping {}", parsed.kind());
                    self.result.stats.skipped += 1;
                    Ok(StepOutcome::Skipped)
                }
            };
        }

        self.filter.predict(dt)?;
        self.last_timestamp = Some(timestamp);
        self.result.stats.predictions += 1;

        match correction {
            Some(measurement) => {
                let estimate = self.filter.correct(&measurement)?;
                self.result.trajectory.push(timestamp, estimate);
                self.result.stats.corrections += 1;
                Ok(StepOutcome::Corrected)
            }
            None => Ok(StepOutcome::Predicted),
        }
    }

    /// Measurement a record contributes, if its kind and the options call for one.
    fn correction_for(
        &self,
        record: &SensorRecord,
        fix: Option<PositionFixSample>,
    ) -> Result<Option<Measurement>> {
        let options = &self.config.fusion;
        match record {
            SensorRecord::Velocity(reading) => {
                if reading.mode == VelocityMode::WaterTrack && !options.correct_with_water_track {
                    debug!("Water-track velocity at {:.3} not used", reading.timestamp);
                    return Ok(None);
                }
                velocity_measurement(reading, &self.config.velocity).map(Some)
            }
            SensorRecord::Orientation(reading) => orientation_measurement(
                reading,
                &self.config.orientation,
                options.observe_yaw_rate,
            )
            .map(Some),
            SensorRecord::PositionFix(_) => match fix {
                Some(sample) if options.correct_with_position_fix => {
                    position_fix_measurement(sample.x, sample.y, &self.config.position)
                        .map(Some)
                }
                _ => Ok(None),
            },
            SensorRecord::Scan { .. } => Ok(None),
        }
    }

    /// Project a fix and express it relative to the odometry origin.
    ///
    /// The first fix pins the offset between the projection and the odometry frame so that it
    /// coincides with the current position estimate.
    fn log_position_fix(&mut self, reading: &PositionFixReading) -> Result<PositionFixSample> {
        let projection = match self.projection.take() {
            Some(p) => p,
            None => LocalTangentPlane::new(reading.latitude, reading.longitude)?,
        };
        let projected = position_fix(reading, &projection);
        self.projection = Some(projection);
        let (easting, northing) = projected?;

        let (north0, east0) = match self.fix_offset {
            Some(offset) => offset,
            None => {
                let (x, y) = match self.filter.estimate() {
                    Some(est) => (est.state[X], est.state[Y]),
                    None => (0.0, 0.0),
                };
                let offset = (northing - x, easting - y);
                self.fix_offset = Some(offset);
                offset
            }
        };
        let sample = PositionFixSample {
            timestamp: reading.timestamp,
            x: northing - north0,
            y: easting - east0,
        };
        self.result.position_fixes.push(sample);
        Ok(sample)
    }
}

impl std::fmt::Debug for FusionEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionEngine")
            .field("filter", &self.filter)
            .field("last_timestamp", &self.last_timestamp)
            .field("stats", &self.result.stats)
            .finish()
    }
}

/// Run a complete fusion over already-loaded streams.
pub fn fuse(config: &OdometryConfig, mux: &mut StreamMultiplexer) -> Result<FusionResult> {
    FusionEngine::new(config)?.run(mux)
}

impl From<&TrajectoryEntry> for Estimate {
    fn from(entry: &TrajectoryEntry) -> Self {
        Estimate {
            state: entry.state.clone(),
            covariance: entry.covariance.clone(),
        }
    }
}
