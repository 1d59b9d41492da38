//! Linear observation models used by the filter's correction step.
//!
//! Every sensor adapter reduces a raw reading to a [`Measurement`]: an observation vector `z`, a
//! linear observation matrix `H` mapping the filter state to `z`'s space, and a noise covariance
//! `R`. Dimensions are checked once, at construction, so the filter never sees a mismatched triplet.

use std::fmt::{self, Display};

use nalgebra::{DMatrix, DVector};

use crate::error::{OdometryError, Result};
use crate::frames::normalize_angle;
use crate::linalg::is_positive_semi_definite;

/// Generic measurement model trait consumed by the filter.
pub trait MeasurementModel {
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the observation matrix `H`
    fn get_jacobian(&self) -> DMatrix<f64>;
    /// Get the measurement noise covariance `R`
    fn get_noise(&self) -> DMatrix<f64>;
    /// Components of the measurement vector that are angles
    fn angular_components(&self) -> &[usize] {
        &[]
    }
    /// Expected measurement for a given state, `H x`.
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        self.get_jacobian() * state
    }
    /// Residual `z - H x`, with angular components wrapped into (-π, π].
    fn innovation(&self, state: &DVector<f64>) -> DVector<f64> {
        let mut y = self.get_vector() - self.get_expected_measurement(state);
        for &i in self.angular_components() {
            y[i] = normalize_angle(y[i]);
        }
        y
    }
}

/// Observation triplet `(z, H, R)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    z: DVector<f64>,
    h: DMatrix<f64>,
    r: DMatrix<f64>,
    angular: Vec<usize>,
}

impl Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Measurement(dim: {}, z: {:?}, sigma: {:?})",
            self.z.len(),
            self.z.as_slice(),
            self.r.diagonal().map(f64::sqrt).as_slice()
        )
    }
}

impl Measurement {
    /// Build a triplet, checking that `H` has one row per observation and `R` is square over `z`.
    ///
    /// `R` must also be symmetric positive semi-definite, otherwise a correction could leave the
    /// filter with an indefinite covariance.
    pub fn new(z: DVector<f64>, h: DMatrix<f64>, r: DMatrix<f64>) -> Result<Self> {
        let n = z.len();
        if n == 0 {
            return Err(OdometryError::DimensionMismatch {
                context: "measurement vector",
                expected: 1,
                found: 0,
            });
        }
        if h.nrows() != n {
            return Err(OdometryError::DimensionMismatch {
                context: "observation matrix rows",
                expected: n,
                found: h.nrows(),
            });
        }
        if r.nrows() != n || r.ncols() != n {
            return Err(OdometryError::DimensionMismatch {
                context: "measurement noise",
                expected: n,
                found: if r.nrows() != n { r.nrows() } else { r.ncols() },
            });
        }
        if z.iter().chain(h.iter()).chain(r.iter()).any(|v| !v.is_finite()) {
            return Err(OdometryError::InvalidNoise(
                "measurement contains non-finite values".to_string(),
            ));
        }
        if !is_positive_semi_definite(&r, 1e-12) {
            return Err(OdometryError::InvalidNoise(
                "measurement noise must be symmetric and positive semi-definite".to_string(),
            ));
        }
        Ok(Measurement {
            z,
            h,
            r,
            angular: Vec::new(),
        })
    }

    /// Build a triplet whose noise is diagonal with the given standard deviations.
    ///
    /// Standard deviations must be finite and non-negative.
    pub fn with_stdevs(z: DVector<f64>, h: DMatrix<f64>, stdevs: &[f64]) -> Result<Self> {
        if let Some(bad) = stdevs.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(OdometryError::InvalidNoise(format!(
                "standard deviation must be finite and non-negative, got {bad}"
            )));
        }
        Measurement::new(z, h, diagonal_noise(stdevs))
    }

    /// Mark components of `z` as angles so the innovation is wrapped.
    pub fn with_angular_components(mut self, components: &[usize]) -> Result<Self> {
        if let Some(&bad) = components.iter().find(|&&i| i >= self.z.len()) {
            return Err(OdometryError::DimensionMismatch {
                context: "angular component index",
                expected: self.z.len(),
                found: bad,
            });
        }
        self.angular = components.to_vec();
        Ok(self)
    }

    /// Observation matrix with a single 1 per row selecting `rows` from a state of `state_size`.
    pub fn selector(rows: &[usize], state_size: usize) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(rows.len(), state_size);
        for (i, &j) in rows.iter().enumerate() {
            h[(i, j)] = 1.0;
        }
        h
    }

    pub fn z(&self) -> &DVector<f64> {
        &self.z
    }

    pub fn h(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }
}

impl MeasurementModel for Measurement {
    fn get_dimension(&self) -> usize {
        self.z.len()
    }
    fn get_vector(&self) -> DVector<f64> {
        self.z.clone()
    }
    fn get_jacobian(&self) -> DMatrix<f64> {
        self.h.clone()
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.r.clone()
    }
    fn angular_components(&self) -> &[usize] {
        &self.angular
    }
}

/// Diagonal covariance from standard deviations.
pub fn diagonal_noise(stdevs: &[f64]) -> DMatrix<f64> {
    DMatrix::from_diagonal(&DVector::from_iterator(
        stdevs.len(),
        stdevs.iter().map(|s| s * s),
    ))
}
