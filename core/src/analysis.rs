//! Error analysis of an estimated trajectory against a reference.
use nalgebra::{DMatrix, DVector};

use crate::frames::normalize_angle;
use crate::fusion::Trajectory;
use crate::sim::TruthRecord;
use crate::state_index::{SURGE, X, Y, YAW, Z};

/// One-sigma values (square roots of the diagonals) of a covariance history.
pub fn sigma(covariances: &[DMatrix<f64>]) -> Vec<DVector<f64>> {
    covariances
        .iter()
        .map(|p| p.diagonal().map(|v| v.max(0.0).sqrt()))
        .collect()
}

/// Linear interpolation of `(t, v)` at `at`; `NaN` outside `[t[0], t[n-1]]`.
///
/// `t` must be nondecreasing.
pub fn interpolate(t: &[f64], v: &[f64], at: f64) -> f64 {
    let n = t.len().min(v.len());
    if n == 0 || !at.is_finite() || at < t[0] || at > t[n - 1] {
        return f64::NAN;
    }
    let upper = t[..n].partition_point(|&ti| ti < at);
    if upper == 0 {
        return v[0];
    }
    let (t0, t1) = (t[upper - 1], t[upper]);
    let (v0, v1) = (v[upper - 1], v[upper]);
    if t1 == t0 {
        return v1;
    }
    v0 + (v1 - v0) * (at - t0) / (t1 - t0)
}

/// `v1 - v2'` where `v2'` is `v2` linearly interpolated at the timestamps `t1`.
///
/// Samples of `t1` outside the span of `t2` yield `NaN`.
pub fn interpolated_error(t1: &[f64], v1: &[f64], t2: &[f64], v2: &[f64]) -> Vec<f64> {
    t1.iter()
        .zip(v1)
        .map(|(&t, &v)| v - interpolate(t2, v2, t))
        .collect()
}

/// Like [`interpolated_error`] for an angle; the result is wrapped into (−π, π].
///
/// The reference is interpolated on its unwrapped form so that crossings of ±π do not produce
/// spurious half-turn errors.
pub fn interpolated_angle_error(t1: &[f64], v1: &[f64], t2: &[f64], v2: &[f64]) -> Vec<f64> {
    let unwrapped = unwrap_angles(v2);
    interpolated_error(t1, v1, t2, &unwrapped)
        .into_iter()
        .map(|e| if e.is_nan() { e } else { normalize_angle(e) })
        .collect()
}

/// Remove 2π jumps between consecutive angles.
pub fn unwrap_angles(angles: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(angles.len());
    let mut offset = 0.0;
    for (i, &a) in angles.iter().enumerate() {
        if i > 0 {
            offset += normalize_angle(a - angles[i - 1]) - (a - angles[i - 1]);
        }
        out.push(a + offset);
    }
    out
}

/// Summary statistics of an error series, ignoring `NaN` samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorSummary {
    pub samples: usize,
    pub mean: f64,
    pub rms: f64,
    pub max_abs: f64,
}

impl ErrorSummary {
    pub fn from_errors(errors: &[f64]) -> Self {
        let valid: Vec<f64> = errors.iter().copied().filter(|e| !e.is_nan()).collect();
        if valid.is_empty() {
            return ErrorSummary {
                samples: 0,
                mean: f64::NAN,
                rms: f64::NAN,
                max_abs: f64::NAN,
            };
        }
        let n = valid.len() as f64;
        ErrorSummary {
            samples: valid.len(),
            mean: valid.iter().sum::<f64>() / n,
            rms: (valid.iter().map(|e| e * e).sum::<f64>() / n).sqrt(),
            max_abs: valid.iter().fold(0.0, |m, e| f64::max(m, e.abs())),
        }
    }
}

/// Fraction of samples whose error lies within `k` sigma; `NaN` samples are ignored.
pub fn fraction_within(errors: &[f64], sigmas: &[f64], k: f64) -> f64 {
    let (inside, total) = errors
        .iter()
        .zip(sigmas)
        .filter(|(e, _)| !e.is_nan())
        .fold((0usize, 0usize), |(inside, total), (e, s)| {
            (inside + usize::from(e.abs() <= k * s), total + 1)
        });
    if total == 0 {
        f64::NAN
    } else {
        inside as f64 / total as f64
    }
}

/// Error summaries of the logged x, y, z, yaw and surge against a truth record.
pub fn trajectory_errors(
    trajectory: &Trajectory,
    truth: &[TruthRecord],
) -> Vec<(&'static str, ErrorSummary)> {
    let t1 = trajectory.timestamps();
    let t2: Vec<f64> = truth.iter().map(|r| r.time).collect();
    let reference = |f: fn(&TruthRecord) -> f64| truth.iter().map(f).collect::<Vec<f64>>();
    let linear = [
        ("x", X, reference(|r| r.x)),
        ("y", Y, reference(|r| r.y)),
        ("z", Z, reference(|r| r.z)),
        ("surge", SURGE, reference(|r| r.surge)),
    ];
    let mut summaries: Vec<(&'static str, ErrorSummary)> = linear
        .iter()
        .map(|(name, index, v2)| {
            let errors = interpolated_error(&t1, &trajectory.component(*index), &t2, v2);
            (*name, ErrorSummary::from_errors(&errors))
        })
        .collect();
    let yaw_errors =
        interpolated_angle_error(&t1, &trajectory.component(YAW), &t2, &reference(|r| r.yaw));
    summaries.push(("yaw", ErrorSummary::from_errors(&yaw_errors)));
    summaries
}
