//! Extended Kalman filter odometry for underwater vehicles
//!
//! This crate estimates a vehicle's pose and body-frame velocity by fusing asynchronous, multi-rate
//! sensor logs (a Doppler velocity log, an attitude and heading sensor, and occasional satellite
//! position fixes) with an Extended Kalman Filter. It also provides the rigid-transform algebra used
//! to relate sensor mounting frames to the vehicle body frame, with first-order uncertainty
//! propagation through those transforms.
//!
//! The crate is built primarily on:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the filter and transforms.
//! - [`nav-types`](https://crates.io/crates/nav-types): geodetic coordinate conversions for position fixes.
//! - [`csv`](https://crates.io/crates/csv) and [`serde`](https://crates.io/crates/serde): log and configuration I/O.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): synthetic sensor data.
//!
//! ## Crate overview
//!
//! - [frames]: angle normalization and 3-DOF / 6-DOF compose and inverse with covariance propagation.
//! - [motion]: the constant-velocity motion model and its analytic Jacobians.
//! - [kalman]: the Extended Kalman Filter (bootstrap, predict, correct).
//! - [measurements]: the validated `(z, H, R)` observation triplet.
//! - [sensors]: sensor configurations, raw record layouts and measurement adapters.
//! - [geodesy]: projection of geodetic position fixes onto a local plane.
//! - [stream]: sensor streams and the time-ordered multiplexer.
//! - [fusion]: the predict/correct loop that turns a multiplexed log into a trajectory.
//! - [config]: the run configuration and its JSON/YAML/TOML serialization.
//! - [logs]: reading delimited sensor logs and writing trajectories.
//! - [analysis]: uncertainty extraction and error against a reference track.
//! - [sim]: synthetic sensor logs for testing.
//! - [linalg]: covariance helpers.
//!
//! ## State definition
//!
//! The filter tracks an eight-element state:
//!
//! $$
//! x = [x, y, z, \psi, u, v, w, r]
//! $$
//!
//! Where:
//! - $x$, $y$, $z$ are positions (m) in the local world frame, $z$ positive down (depth).
//! - $\psi$ is the heading (rad), kept in $(-\pi, \pi]$.
//! - $u$, $v$, $w$ are surge, sway and heave velocities (m/s) in the body frame.
//! - $r$ is the yaw rate (rad/s).
//!
//! Roll and pitch are not estimated. Horizontal velocity is rotated into the world frame by heading only.
pub mod analysis;
pub mod config;
pub mod error;
pub mod frames;
pub mod fusion;
pub mod geodesy;
pub mod kalman;
pub mod linalg;
pub mod logs;
pub mod measurements;
pub mod motion;
pub mod sensors;
pub mod sim;
pub mod stream;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use std::convert::{From, TryFrom};
use std::fmt::{self, Display};

pub use crate::error::{OdometryError, Result};
pub use crate::kalman::{Estimate, ExtendedKalmanFilter};
pub use crate::measurements::Measurement;
pub use crate::motion::{ConstantVelocityModel, MotionModel};

/// Number of elements in the filter state.
pub const STATE_SIZE: usize = 8;
/// Number of acceleration noise sources driving the motion model.
pub const NOISE_SIZE: usize = 4;

/// Positions of each quantity in the state vector.
pub mod state_index {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const Z: usize = 2;
    pub const YAW: usize = 3;
    pub const SURGE: usize = 4;
    pub const SWAY: usize = 5;
    pub const HEAVE: usize = 6;
    pub const YAW_RATE: usize = 7;
}

/// Named view of the eight-element filter state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// World-frame position x in meters
    pub x: f64,
    /// World-frame position y in meters
    pub y: f64,
    /// Depth in meters
    pub z: f64,
    /// Heading in radians
    pub yaw: f64,
    /// Body-frame forward velocity in m/s
    pub surge: f64,
    /// Body-frame lateral velocity in m/s
    pub sway: f64,
    /// Body-frame vertical velocity in m/s
    pub heave: f64,
    /// Heading rate in rad/s
    pub yaw_rate: f64,
}
impl Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VehicleState {{ x: {:.3} m, y: {:.3} m, z: {:.3} m, yaw: {:.2} deg, u: {:.3} m/s, v: {:.3} m/s, w: {:.3} m/s, r: {:.3} deg/s }}",
            self.x,
            self.y,
            self.z,
            self.yaw.to_degrees(),
            self.surge,
            self.sway,
            self.heave,
            self.yaw_rate.to_degrees()
        )
    }
}
impl From<&VehicleState> for Vec<f64> {
    fn from(s: &VehicleState) -> Self {
        vec![
            s.x, s.y, s.z, s.yaw, s.surge, s.sway, s.heave, s.yaw_rate,
        ]
    }
}
impl From<VehicleState> for DVector<f64> {
    fn from(state: VehicleState) -> Self {
        DVector::from_vec((&state).into())
    }
}
impl From<&VehicleState> for DVector<f64> {
    fn from(state: &VehicleState) -> Self {
        DVector::from_vec(state.into())
    }
}
impl TryFrom<&[f64]> for VehicleState {
    type Error = OdometryError;
    /// Builds a state from a slice of exactly [`STATE_SIZE`] elements.
    fn try_from(slice: &[f64]) -> std::result::Result<Self, Self::Error> {
        if slice.len() != STATE_SIZE {
            return Err(OdometryError::DimensionMismatch {
                context: "vehicle state",
                expected: STATE_SIZE,
                found: slice.len(),
            });
        }
        Ok(VehicleState {
            x: slice[0],
            y: slice[1],
            z: slice[2],
            yaw: slice[3],
            surge: slice[4],
            sway: slice[5],
            heave: slice[6],
            yaw_rate: slice[7],
        })
    }
}
impl TryFrom<&DVector<f64>> for VehicleState {
    type Error = OdometryError;
    fn try_from(v: &DVector<f64>) -> std::result::Result<Self, Self::Error> {
        Self::try_from(v.as_slice())
    }
}
