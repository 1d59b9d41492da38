//! Sensor configurations, raw record layouts and measurement adapters.
//!
//! Each sensor kind logs a fixed-layout numeric row whose first field is the timestamp. Parsing a
//! row into its typed reading checks the field count first, so an adapter never indexes past the
//! end of a short or truncated record.
//!
//! | Sensor | Fields | Layout |
//! |---|---|---|
//! | Velocity (DVL) | 27 | `[0]` time, `[11..14]` bottom velocity (cm/s), `[14]` bottom-lock flag, `[15..18]` water velocity (cm/s), `[26]` pressure counts |
//! | Orientation (AHRS) | 10 | `[0]` time, `[1..4]` roll/pitch/yaw (deg), `[4..7]` angular velocity (rad/s), `[7..10]` linear acceleration (m/s²) |
//! | Position fix (GPS) | 3 | `[0]` time, `[1]` latitude (NMEA ddmm.mmmm), `[2]` longitude (NMEA dddmm.mmmm) |
//! | Scan | ≥ 1 | `[0]` time; used only to advance the filter clock |
use std::f64::consts::PI;
use std::fmt::{self, Display};

use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{OdometryError, Result};
use crate::frames::{Pose3, normalize_angle};
use crate::geodesy::{PlanarProjection, nmea_to_degrees};
use crate::measurements::Measurement;
use crate::state_index::{HEAVE, SURGE, SWAY, X, Y, YAW, YAW_RATE, Z};
use crate::stream::{RawRecord, SensorKind};
use crate::STATE_SIZE;

/// Number of fields in a velocity sensor row.
pub const VELOCITY_FIELDS: usize = 27;
/// Number of fields in an orientation sensor row.
pub const ORIENTATION_FIELDS: usize = 10;
/// Number of fields in a position fix row.
pub const POSITION_FIX_FIELDS: usize = 3;

mod velocity_layout {
    pub const BOTTOM_VELOCITY: usize = 11;
    pub const BOTTOM_LOCK: usize = 14;
    pub const WATER_VELOCITY: usize = 15;
    pub const PRESSURE: usize = 26;
}

mod orientation_layout {
    pub const ORIENTATION: usize = 1;
    pub const ANGULAR_VELOCITY: usize = 4;
    pub const LINEAR_ACCELERATION: usize = 7;
}

/// Doppler velocity log configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocitySensorConfig {
    /// Sensor frame relative to the vehicle body frame
    pub mounting: Pose3,
    /// Standard deviation of bottom-lock velocity per axis (m/s)
    pub bottom_lock_stdev: [f64; 3],
    /// Standard deviation of water-track velocity per axis (m/s)
    pub water_track_stdev: [f64; 3],
    /// Standard deviation of the derived depth (m)
    pub depth_stdev: f64,
    /// Meters of depth per pressure count
    pub depth_scale: f64,
    /// Pressure reading at the surface
    pub pressure_offset: f64,
    /// Factor converting logged velocity to m/s
    pub velocity_scale: f64,
}
impl Default for VelocitySensorConfig {
    fn default() -> Self {
        VelocitySensorConfig {
            mounting: Pose3::new(0.0, 0.0, 0.0, PI, 0.0, PI / 3.0),
            bottom_lock_stdev: [0.3, 0.3, 0.15],
            water_track_stdev: [0.6, 0.6, 0.3],
            depth_stdev: 0.02,
            depth_scale: 0.003772250,
            pressure_offset: 1440.0,
            velocity_scale: 0.01,
        }
    }
}

/// Attitude and heading sensor configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationSensorConfig {
    /// Sensor frame relative to the vehicle body frame; only the yaw offset is applied
    pub mounting: Pose3,
    /// Standard deviation of heading (rad)
    pub yaw_stdev: f64,
    /// Standard deviation of heading rate (rad/s)
    pub yaw_rate_stdev: f64,
}
impl Default for OrientationSensorConfig {
    fn default() -> Self {
        OrientationSensorConfig {
            mounting: Pose3::new(0.0, 0.0, -0.04, 0.0, 0.0, -PI / 2.0),
            yaw_stdev: 0.2,
            yaw_rate_stdev: 0.2,
        }
    }
}

/// Satellite position fix configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionFixConfig {
    /// Horizontal standard deviation used when fixes are folded into the filter (m)
    pub horizontal_stdev: f64,
    /// Projection origin as (latitude, longitude) in degrees; the first fix when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<[f64; 2]>,
}
impl Default for PositionFixConfig {
    fn default() -> Self {
        PositionFixConfig {
            horizontal_stdev: 2.0,
            origin: None,
        }
    }
}

/// Which velocity sub-reading the sensor reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VelocityMode {
    BottomLock,
    WaterTrack,
}

/// Parsed velocity sensor row, still in the sensor frame.
#[derive(Clone, Debug, PartialEq)]
pub struct VelocityReading {
    pub timestamp: f64,
    pub mode: VelocityMode,
    /// Selected velocity in the sensor frame (m/s)
    pub velocity: Vector3<f64>,
    /// Depth derived from the pressure field (m)
    pub depth: f64,
}
impl Display for VelocityReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityReading(t: {:.3}, mode: {:?}, v: [{:.3}, {:.3}, {:.3}], depth: {:.3})",
            self.timestamp, self.mode, self.velocity.x, self.velocity.y, self.velocity.z, self.depth
        )
    }
}

impl VelocityReading {
    pub fn parse(row: &[f64], config: &VelocitySensorConfig) -> Result<Self> {
        check_fields(SensorKind::Velocity, row, VELOCITY_FIELDS)?;
        let (mode, start) = if row[velocity_layout::BOTTOM_LOCK] == 1.0 {
            (VelocityMode::BottomLock, velocity_layout::BOTTOM_VELOCITY)
        } else {
            (VelocityMode::WaterTrack, velocity_layout::WATER_VELOCITY)
        };
        let velocity = Vector3::from_column_slice(&row[start..start + 3]) * config.velocity_scale;
        let depth = config.depth_scale * (row[velocity_layout::PRESSURE] - config.pressure_offset);
        Ok(VelocityReading {
            timestamp: row[0],
            mode,
            velocity,
            depth,
        })
    }

    /// Velocity rotated into the vehicle body frame.
    pub fn body_velocity(&self, config: &VelocitySensorConfig) -> Vector3<f64> {
        config.mounting.rotation() * self.velocity
    }
}

/// Parsed orientation sensor row, re-aligned to the vehicle body axes.
#[derive(Clone, Debug, PartialEq)]
pub struct OrientationReading {
    pub timestamp: f64,
    /// Roll, pitch and yaw of the body (rad), each in (-π, π]
    pub orientation: Vector3<f64>,
    /// Body angular velocity (rad/s)
    pub angular_velocity: Vector3<f64>,
    /// Body linear acceleration (m/s²)
    pub linear_acceleration: Vector3<f64>,
}
impl Display for OrientationReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrientationReading(t: {:.3}, rpy: [{:.2}, {:.2}, {:.2}] deg, yaw rate: {:.3} rad/s)",
            self.timestamp,
            self.orientation.x.to_degrees(),
            self.orientation.y.to_degrees(),
            self.orientation.z.to_degrees(),
            self.angular_velocity.z
        )
    }
}

impl OrientationReading {
    /// The sensor's x axis points along the body's -y axis, so roll and pitch swap with a sign flip.
    pub fn parse(row: &[f64], config: &OrientationSensorConfig) -> Result<Self> {
        check_fields(SensorKind::Orientation, row, ORIENTATION_FIELDS)?;
        let o = orientation_layout::ORIENTATION;
        let a = orientation_layout::ANGULAR_VELOCITY;
        let l = orientation_layout::LINEAR_ACCELERATION;
        let orientation = Vector3::new(
            (-row[o + 1]).to_radians(),
            row[o].to_radians(),
            row[o + 2].to_radians() + config.mounting.yaw,
        )
        .map(normalize_angle);
        Ok(OrientationReading {
            timestamp: row[0],
            orientation,
            angular_velocity: Vector3::new(row[a + 1], -row[a], row[a + 2]),
            linear_acceleration: Vector3::new(row[l + 1], -row[l], row[l + 2]),
        })
    }

    pub fn yaw(&self) -> f64 {
        self.orientation.z
    }

    pub fn yaw_rate(&self) -> f64 {
        self.angular_velocity.z
    }
}

/// Parsed position fix in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionFixReading {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionFixReading {
    pub fn parse(row: &[f64]) -> Result<Self> {
        check_fields(SensorKind::PositionFix, row, POSITION_FIX_FIELDS)?;
        Ok(PositionFixReading {
            timestamp: row[0],
            latitude: nmea_to_degrees(row[1]),
            longitude: nmea_to_degrees(row[2]),
        })
    }
}

/// Raw record decoded according to its sensor kind.
#[derive(Clone, Debug, PartialEq)]
pub enum SensorRecord {
    Velocity(VelocityReading),
    Orientation(OrientationReading),
    PositionFix(PositionFixReading),
    Scan { timestamp: f64 },
}

impl SensorRecord {
    /// Decode a raw row with the layout of its sensor kind.
    pub fn parse(
        record: &RawRecord,
        velocity: &VelocitySensorConfig,
        orientation: &OrientationSensorConfig,
    ) -> Result<Self> {
        let row = record.fields.as_slice();
        match record.kind {
            SensorKind::Velocity => VelocityReading::parse(row, velocity).map(SensorRecord::Velocity),
            SensorKind::Orientation => {
                OrientationReading::parse(row, orientation).map(SensorRecord::Orientation)
            }
            SensorKind::PositionFix => {
                PositionFixReading::parse(row).map(SensorRecord::PositionFix)
            }
            SensorKind::Scan => {
                check_min_fields(SensorKind::Scan, row, 1)?;
                Ok(SensorRecord::Scan { timestamp: row[0] })
            }
        }
    }

    pub fn kind(&self) -> SensorKind {
        match self {
            SensorRecord::Velocity(_) => SensorKind::Velocity,
            SensorRecord::Orientation(_) => SensorKind::Orientation,
            SensorRecord::PositionFix(_) => SensorKind::PositionFix,
            SensorRecord::Scan { .. } => SensorKind::Scan,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            SensorRecord::Velocity(r) => r.timestamp,
            SensorRecord::Orientation(r) => r.timestamp,
            SensorRecord::PositionFix(r) => r.timestamp,
            SensorRecord::Scan { timestamp } => *timestamp,
        }
    }
}

/// Velocity sensor adapter.
///
/// Rotates the selected velocity into the body frame and observes `(u, v, w, z)`. Noise is the
/// bottom-lock or water-track variance set, matching the reading's mode, plus the depth variance.
pub fn velocity_measurement(
    reading: &VelocityReading,
    config: &VelocitySensorConfig,
) -> Result<Measurement> {
    let v = reading.body_velocity(config);
    let axis_stdev = match reading.mode {
        VelocityMode::BottomLock => config.bottom_lock_stdev,
        VelocityMode::WaterTrack => config.water_track_stdev,
    };
    Measurement::with_stdevs(
        DVector::from_vec(vec![v.x, v.y, v.z, reading.depth]),
        Measurement::selector(&[SURGE, SWAY, HEAVE, Z], STATE_SIZE),
        &[axis_stdev[0], axis_stdev[1], axis_stdev[2], config.depth_stdev],
    )
}

/// Orientation sensor adapter.
///
/// Observes heading alone, or heading and heading rate when `with_yaw_rate` is set. The heading
/// row is flagged angular so its innovation is wrapped.
pub fn orientation_measurement(
    reading: &OrientationReading,
    config: &OrientationSensorConfig,
    with_yaw_rate: bool,
) -> Result<Measurement> {
    let m = if with_yaw_rate {
        Measurement::with_stdevs(
            DVector::from_vec(vec![reading.yaw(), reading.yaw_rate()]),
            Measurement::selector(&[YAW, YAW_RATE], STATE_SIZE),
            &[config.yaw_stdev, config.yaw_rate_stdev],
        )?
    } else {
        Measurement::with_stdevs(
            DVector::from_vec(vec![reading.yaw()]),
            Measurement::selector(&[YAW], STATE_SIZE),
            &[config.yaw_stdev],
        )?
    };
    m.with_angular_components(&[0])
}

/// Position fix adapter: projects the fix onto the plane as (easting, northing).
pub fn position_fix<P: PlanarProjection + ?Sized>(
    reading: &PositionFixReading,
    projection: &P,
) -> Result<(f64, f64)> {
    projection.project(reading.latitude, reading.longitude)
}

/// Observation of the horizontal position from a fix already expressed in the odometry frame.
pub fn position_fix_measurement(x: f64, y: f64, config: &PositionFixConfig) -> Result<Measurement> {
    Measurement::with_stdevs(
        DVector::from_vec(vec![x, y]),
        Measurement::selector(&[X, Y], STATE_SIZE),
        &[config.horizontal_stdev, config.horizontal_stdev],
    )
}

fn check_fields(kind: SensorKind, row: &[f64], expected: usize) -> Result<()> {
    if row.len() != expected {
        return Err(OdometryError::field_count(kind, expected, row.len()));
    }
    Ok(())
}

fn check_min_fields(kind: SensorKind, row: &[f64], minimum: usize) -> Result<()> {
    if row.len() < minimum {
        return Err(OdometryError::field_count(kind, minimum, row.len()));
    }
    Ok(())
}
