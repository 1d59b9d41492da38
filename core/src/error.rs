//! Error types shared by the filter, the sensor adapters and the fusion loop.
use std::io;

use thiserror::Error;

use crate::stream::SensorKind;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OdometryError>;

#[derive(Error, Debug)]
pub enum OdometryError {
    /// `S = H P Hᵀ + R` could not be inverted; the prior estimate is kept.
    #[error("innovation covariance is numerically singular")]
    SingularInnovationCovariance,

    /// The bootstrap measurement's observation matrix has no pseudo-inverse.
    #[error("observation matrix cannot be inverted to seed the filter")]
    DegenerateObservation,

    /// `predict` or `correct` was called before `bootstrap`.
    #[error("filter used before it was bootstrapped")]
    UninitializedFilterUse,

    #[error("filter is already initialized")]
    AlreadyInitialized,

    #[error("malformed {record} record: {reason}")]
    MalformedRecord { record: String, reason: String },

    /// Raised by the multiplexer once its exhaustion policy says the merge is over.
    #[error("sensor stream exhausted")]
    StreamExhausted,

    #[error("{context}: expected dimension {expected}, found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("time step must be finite and non-negative, got {0}")]
    InvalidTimeStep(f64),

    #[error("invalid noise parameters: {0}")]
    InvalidNoise(String),

    #[error("a {0} stream was already registered")]
    DuplicateStream(SensorKind),

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl OdometryError {
    /// Shorthand for a record whose row length does not match the expected layout.
    pub fn field_count(kind: SensorKind, expected: usize, found: usize) -> Self {
        OdometryError::MalformedRecord {
            record: kind.to_string(),
            reason: format!("expected {expected} fields, found {found}"),
        }
    }

    /// True for the error kind that ends a fusion run normally.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, OdometryError::StreamExhausted)
    }
}
