//! Extended Kalman filter
//!
//! The filter is generic over a [`MotionModel`] strategy that supplies the nonlinear state transition
//! and its Jacobians; corrections accept any [`MeasurementModel`], so the engine knows nothing about
//! specific sensors.
//!
//! The filter starts uninitialized. The first measurement is used to [bootstrap](ExtendedKalmanFilter::bootstrap)
//! the estimate through the pseudo-inverse of its observation matrix; only then do
//! [predict](ExtendedKalmanFilter::predict) and [correct](ExtendedKalmanFilter::correct) become valid.
//! Calling them earlier is reported as [`OdometryError::UninitializedFilterUse`].

use crate::error::{OdometryError, Result};
use crate::linalg::{is_positive_semi_definite, pseudo_inverse, solve_spd, symmetrize};
use crate::measurements::MeasurementModel;
use crate::motion::{ConstantVelocityModel, MotionModel};
use crate::NOISE_SIZE;

use std::fmt::{self, Debug, Display};

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::frames::normalize_angle;

/// State estimate and its covariance, always replaced together.
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate {
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl Estimate {
    /// One-sigma uncertainty of each state element.
    pub fn sigma(&self) -> DVector<f64> {
        self.covariance.diagonal().map(|v| v.max(0.0).sqrt())
    }
}

/// Extended Kalman filter over an injected motion model.
#[derive(Clone)]
pub struct ExtendedKalmanFilter<M: MotionModel = ConstantVelocityModel> {
    /// State transition strategy
    model: M,
    /// Process noise covariance Q over the model's noise inputs
    process_noise: DMatrix<f64>,
    /// Variance assigned at bootstrap to states the first measurement does not observe
    unobserved_variance: Option<f64>,
    /// None until bootstrapped
    estimate: Option<Estimate>,
}

impl<M: MotionModel + Debug> Debug for ExtendedKalmanFilter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF")
            .field("model", &self.model)
            .field("process_noise", &self.process_noise)
            .field("unobserved_variance", &self.unobserved_variance)
            .field("estimate", &self.estimate)
            .finish()
    }
}

impl<M: MotionModel> Display for ExtendedKalmanFilter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.estimate {
            Some(est) => f
                .debug_struct("ExtendedKalmanFilter")
                .field("state", &est.state.as_slice())
                .field("sigma", &est.sigma().as_slice())
                .finish(),
            None => write!(f, "ExtendedKalmanFilter(uninitialized)"),
        }
    }
}

impl ExtendedKalmanFilter<ConstantVelocityModel> {
    /// Constant-velocity filter with diagonal process noise from surge, sway, heave and yaw
    /// acceleration standard deviations.
    ///
    /// # Example
    ///
    /// ```rust
    /// use odometry::kalman::ExtendedKalmanFilter;
    ///
    /// let ekf = ExtendedKalmanFilter::constant_velocity([0.1, 0.05, 0.1, 0.25]).unwrap();
    /// assert!(!ekf.is_initialized());
    /// ```
    pub fn constant_velocity(acceleration_stdevs: [f64; NOISE_SIZE]) -> Result<Self> {
        let q = DMatrix::from_diagonal(&DVector::from_iterator(
            NOISE_SIZE,
            acceleration_stdevs.iter().map(|s| s * s),
        ));
        ExtendedKalmanFilter::new(ConstantVelocityModel, q)
    }
}

impl<M: MotionModel> ExtendedKalmanFilter<M> {
    /// Create an uninitialized filter.
    ///
    /// `process_noise` must be a symmetric positive semi-definite matrix sized to the model's noise
    /// dimension. It is fixed for the lifetime of the filter.
    pub fn new(model: M, process_noise: DMatrix<f64>) -> Result<Self> {
        let n = model.noise_dimension();
        if process_noise.nrows() != n || process_noise.ncols() != n {
            return Err(OdometryError::DimensionMismatch {
                context: "process noise",
                expected: n,
                found: process_noise.nrows(),
            });
        }
        if process_noise.iter().any(|v| !v.is_finite())
            || !is_positive_semi_definite(&process_noise, 1e-12)
        {
            return Err(OdometryError::InvalidNoise(
                "process noise must be finite, symmetric and positive semi-definite".to_string(),
            ));
        }
        Ok(ExtendedKalmanFilter {
            model,
            process_noise,
            unobserved_variance: None,
            estimate: None,
        })
    }

    /// Seed states left unobserved by the bootstrap measurement with this variance instead of zero.
    pub fn with_unobserved_variance(mut self, variance: f64) -> Self {
        self.unobserved_variance = Some(variance);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }

    pub fn is_initialized(&self) -> bool {
        self.estimate.is_some()
    }

    /// Current estimate, if bootstrapped.
    pub fn estimate(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    /// Current state vector.
    pub fn get_estimate(&self) -> Result<DVector<f64>> {
        self.current().map(|e| e.state.clone())
    }

    /// Current state covariance.
    pub fn get_certainty(&self) -> Result<DMatrix<f64>> {
        self.current().map(|e| e.covariance.clone())
    }

    fn current(&self) -> Result<&Estimate> {
        self.estimate.as_ref().ok_or(OdometryError::UninitializedFilterUse)
    }

    fn check_columns(&self, h: &DMatrix<f64>) -> Result<()> {
        let n = self.model.state_dimension();
        if h.ncols() != n {
            return Err(OdometryError::DimensionMismatch {
                context: "observation matrix columns",
                expected: n,
                found: h.ncols(),
            });
        }
        Ok(())
    }

    fn wrap_angles(&self, state: &mut DVector<f64>) {
        for &i in self.model.angular_states() {
            state[i] = normalize_angle(state[i]);
        }
    }

    /// Initialize the estimate from a single measurement.
    ///
    /// $$
    /// x = H^{+} z, \qquad P = H^{+} R (H^{+})^T
    /// $$
    ///
    /// where $H^{+}$ is the Moore-Penrose pseudo-inverse. States the measurement does not observe
    /// start at zero with zero variance, or with the variance given to
    /// [`with_unobserved_variance`](Self::with_unobserved_variance).
    pub fn bootstrap<Z: MeasurementModel + ?Sized>(&mut self, measurement: &Z) -> Result<&Estimate> {
        if self.estimate.is_some() {
            return Err(OdometryError::AlreadyInitialized);
        }
        let h = measurement.get_jacobian();
        self.check_columns(&h)?;
        let r = checked_noise(measurement)?;
        let h_pinv = pseudo_inverse(&h).ok_or(OdometryError::DegenerateObservation)?;

        let mut state = &h_pinv * measurement.get_vector();
        self.wrap_angles(&mut state);
        let mut covariance = symmetrize(&(&h_pinv * r * h_pinv.transpose()));

        if let Some(variance) = self.unobserved_variance {
            let observed = &h_pinv * &h;
            for i in 0..state.len() {
                if observed[(i, i)] < 0.5 {
                    covariance[(i, i)] += variance;
                }
            }
        }

        info!("Filter bootstrapped from a {}-row measurement", h.nrows());
        debug!("Initial state: {:?}", state.as_slice());
        Ok(&*self.estimate.insert(Estimate { state, covariance }))
    }

    /// Propagate the estimate by `dt` seconds.
    ///
    /// $$
    /// x' = f(x, \Delta t), \qquad P' = J_x P J_x^T + J_q Q J_q^T
    /// $$
    ///
    /// `dt` must be finite and non-negative. A zero step leaves the estimate unchanged.
    pub fn predict(&mut self, dt: f64) -> Result<&Estimate> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(OdometryError::InvalidTimeStep(dt));
        }
        let current = self.current()?;
        let (state, jx) = self.model.predict_state(&current.state, dt);
        let jq = self.model.noise_jacobian(&current.state, dt);
        let covariance = symmetrize(
            &(&jx * &current.covariance * jx.transpose()
                + &jq * &self.process_noise * jq.transpose()),
        );
        debug!("Predicted {dt:.3} s ahead, trace(P) = {:.6}", covariance.trace());
        Ok(&*self.estimate.insert(Estimate { state, covariance }))
    }

    /// Fold a measurement into the estimate.
    ///
    /// $$
    /// y = z - H x, \quad S = H P H^T + R, \quad K = P H^T S^{-1}, \quad
    /// x' = x + K y, \quad P' = (I - K H) P
    /// $$
    ///
    /// $P'$ is symmetrized before it is stored. If $S$ is numerically singular the prior estimate is
    /// kept and [`OdometryError::SingularInnovationCovariance`] is returned.
    pub fn correct<Z: MeasurementModel + ?Sized>(&mut self, measurement: &Z) -> Result<&Estimate> {
        let h = measurement.get_jacobian();
        self.check_columns(&h)?;
        let current = self.current()?;
        let r = checked_noise(measurement)?;

        let innovation = measurement.innovation(&current.state);
        let hp = &h * &current.covariance;
        let s = &hp * h.transpose() + r;
        // S and P are symmetric, so Kᵀ = S⁻¹ H P.
        let gain = solve_spd(&s, &hp)
            .ok_or(OdometryError::SingularInnovationCovariance)?
            .transpose();

        let mut state = &current.state + &gain * innovation;
        self.wrap_angles(&mut state);
        let n = state.len();
        let covariance =
            symmetrize(&((DMatrix::identity(n, n) - &gain * &h) * &current.covariance));

        debug!(
            "Corrected with {}-row measurement, trace(P) = {:.6}",
            h.nrows(),
            covariance.trace()
        );
        Ok(&*self.estimate.insert(Estimate { state, covariance }))
    }
}

/// Noise covariance of `measurement`, rejected unless it is finite, square over the observation
/// rows and positive semi-definite.
fn checked_noise<Z: MeasurementModel + ?Sized>(measurement: &Z) -> Result<DMatrix<f64>> {
    let r = measurement.get_noise();
    let rows = measurement.get_jacobian().nrows();
    if r.nrows() != rows || r.ncols() != rows {
        return Err(OdometryError::DimensionMismatch {
            context: "measurement noise",
            expected: rows,
            found: r.nrows(),
        });
    }
    if r.iter().any(|v| !v.is_finite()) || !is_positive_semi_definite(&r, 1e-12) {
        return Err(OdometryError::InvalidNoise(
            "measurement noise must be finite, symmetric and positive semi-definite".to_string(),
        ));
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::Measurement;
    use crate::state_index::{SURGE, SWAY, X, YAW, YAW_RATE, Z};
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn ekf() -> ExtendedKalmanFilter {
        ExtendedKalmanFilter::constant_velocity([0.1, 0.05, 0.1, 0.25]).unwrap()
    }

    fn velocity_measurement(u: f64, v: f64, w: f64, depth: f64) -> Measurement {
        Measurement::with_stdevs(
            DVector::from_vec(vec![u, v, w, depth]),
            Measurement::selector(&[4, 5, 6, 2], 8),
            &[0.3, 0.3, 0.15, 0.02],
        )
        .unwrap()
    }

    fn initialized_at(state: [f64; 8], variance: f64) -> ExtendedKalmanFilter {
        let mut filter = ekf();
        let m = Measurement::new(
            DVector::from_row_slice(&state),
            DMatrix::identity(8, 8),
            DMatrix::identity(8, 8) * variance,
        )
        .unwrap();
        filter.bootstrap(&m).unwrap();
        filter
    }

    #[test]
    fn ekf_construction() {
        let filter = ekf();
        assert!(!filter.is_initialized());
        assert_approx_eq!(filter.process_noise()[(3, 3)], 0.0625, 1e-15);
        assert!(format!("{filter}").contains("uninitialized"));
    }

    #[test]
    fn ekf_rejects_bad_process_noise() {
        assert!(matches!(
            ExtendedKalmanFilter::new(ConstantVelocityModel, DMatrix::identity(3, 3)),
            Err(OdometryError::DimensionMismatch { .. })
        ));
        let mut q = DMatrix::identity(4, 4);
        q[(0, 0)] = -1.0;
        assert!(matches!(
            ExtendedKalmanFilter::new(ConstantVelocityModel, q),
            Err(OdometryError::InvalidNoise(_))
        ));
    }

    #[test]
    fn ekf_uninitialized_use_is_an_error() {
        let mut filter = ekf();
        assert!(matches!(filter.predict(1.0), Err(OdometryError::UninitializedFilterUse)));
        let m = velocity_measurement(1.0, 0.0, 0.0, 5.0);
        assert!(matches!(filter.correct(&m), Err(OdometryError::UninitializedFilterUse)));
        assert!(matches!(filter.get_estimate(), Err(OdometryError::UninitializedFilterUse)));
    }

    #[test]
    fn ekf_bootstrap_uses_pseudo_inverse() {
        let mut filter = ekf();
        let est = filter.bootstrap(&velocity_measurement(1.0, 0.5, -0.1, 5.0)).unwrap().clone();
        assert_approx_eq!(est.state[SURGE], 1.0, 1e-12);
        assert_approx_eq!(est.state[SWAY], 0.5, 1e-12);
        assert_approx_eq!(est.state[Z], 5.0, 1e-12);
        assert_approx_eq!(est.state[X], 0.0, 1e-12);
        assert_approx_eq!(est.covariance[(SURGE, SURGE)], 0.09, 1e-12);
        assert_approx_eq!(est.covariance[(Z, Z)], 0.0004, 1e-12);
        assert_approx_eq!(est.covariance[(X, X)], 0.0, 1e-12);
        assert!(filter.is_initialized());
        assert!(matches!(
            filter.bootstrap(&velocity_measurement(0.0, 0.0, 0.0, 0.0)),
            Err(OdometryError::AlreadyInitialized)
        ));
    }

    #[test]
    fn ekf_bootstrap_seeds_unobserved_states() {
        let mut filter = ekf().with_unobserved_variance(100.0);
        let est = filter.bootstrap(&velocity_measurement(1.0, 0.0, 0.0, 2.0)).unwrap();
        assert_approx_eq!(est.covariance[(X, X)], 100.0, 1e-12);
        assert_approx_eq!(est.covariance[(YAW, YAW)], 100.0, 1e-12);
        assert_approx_eq!(est.covariance[(SURGE, SURGE)], 0.09, 1e-12);
    }

    #[test]
    fn ekf_bootstrap_rejects_wrong_state_width() {
        let mut filter = ekf();
        let m = Measurement::with_stdevs(
            DVector::from_vec(vec![1.0]),
            Measurement::selector(&[0], 6),
            &[1.0],
        )
        .unwrap();
        assert!(matches!(filter.bootstrap(&m), Err(OdometryError::DimensionMismatch { .. })));
        assert!(!filter.is_initialized());
    }

    #[test]
    fn ekf_predict_unit_surge() {
        let mut filter = initialized_at([0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 0.01);
        let before = filter.get_certainty().unwrap();
        let est = filter.predict(1.0).unwrap();
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        for i in 0..8 {
            assert_approx_eq!(est.state[i], expected[i], 1e-12);
            assert!(est.covariance[(i, i)] > before[(i, i)], "diagonal {i} did not grow");
        }
    }

    #[test]
    fn ekf_predict_zero_step_is_a_no_op() {
        let mut filter = initialized_at([1.0, 2.0, 3.0, 0.4, 1.0, 0.1, 0.0, 0.02], 0.5);
        let before = filter.estimate().unwrap().clone();
        let after = filter.predict(0.0).unwrap();
        assert_eq!(after, &before);
    }

    #[test]
    fn ekf_predict_rejects_negative_step() {
        let mut filter = initialized_at([0.0; 8], 1.0);
        assert!(matches!(filter.predict(-0.1), Err(OdometryError::InvalidTimeStep(_))));
        assert!(matches!(filter.predict(f64::NAN), Err(OdometryError::InvalidTimeStep(_))));
    }

    #[test]
    fn ekf_correct_never_increases_trace() {
        let mut filter = initialized_at([0.0, 0.0, 1.0, 0.3, 1.0, 0.0, 0.0, 0.0], 1.0);
        filter.predict(0.5).unwrap();
        for m in [
            velocity_measurement(1.2, 0.1, 0.0, 1.1),
            Measurement::with_stdevs(
                DVector::from_vec(vec![0.35, 0.01]),
                Measurement::selector(&[YAW, YAW_RATE], 8),
                &[0.2, 0.2],
            )
            .unwrap(),
        ] {
            let before = filter.get_certainty().unwrap().trace();
            let est = filter.correct(&m).unwrap();
            assert!(est.covariance.trace() <= before + 1e-12);
            assert_eq!(est.covariance, est.covariance.transpose());
        }
    }

    #[test]
    fn ekf_correct_moves_toward_measurement() {
        let mut filter = initialized_at([0.0; 8], 1.0);
        let est = filter.correct(&velocity_measurement(2.0, 0.0, 0.0, 0.0)).unwrap();
        assert!(est.state[SURGE] > 1.5 && est.state[SURGE] < 2.0);
    }

    #[test]
    fn ekf_singular_innovation_keeps_prior() {
        let mut filter = ekf();
        let exact = Measurement::new(
            DVector::from_vec(vec![1.0]),
            Measurement::selector(&[SURGE], 8),
            DMatrix::zeros(1, 1),
        )
        .unwrap();
        filter.bootstrap(&exact).unwrap();
        let prior = filter.estimate().unwrap().clone();
        // Both P and R are zero along surge.
        let result = filter.correct(&exact);
        assert!(matches!(result, Err(OdometryError::SingularInnovationCovariance)));
        assert_eq!(filter.estimate().unwrap(), &prior);
    }

    /// Observation that skips the checks `Measurement` performs at construction.
    struct Unchecked {
        z: DVector<f64>,
        h: DMatrix<f64>,
        r: DMatrix<f64>,
    }

    impl MeasurementModel for Unchecked {
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
    }

    #[test]
    fn ekf_negative_measurement_noise_is_rejected() {
        let mut filter = initialized_at([0.0; 8], 1.0);
        let prior = filter.estimate().unwrap().clone();
        let negative = Unchecked {
            z: DVector::from_vec(vec![1.0]),
            h: Measurement::selector(&[SURGE], 8),
            r: DMatrix::from_element(1, 1, -0.5),
        };
        assert!(matches!(filter.correct(&negative), Err(OdometryError::InvalidNoise(_))));
        assert_eq!(filter.estimate().unwrap(), &prior);
        assert!(filter.estimate().unwrap().covariance[(SURGE, SURGE)] >= 0.0);

        let mut fresh = ekf();
        assert!(matches!(fresh.bootstrap(&negative), Err(OdometryError::InvalidNoise(_))));
        assert!(!fresh.is_initialized());
    }

    #[test]
    fn ekf_bootstrap_reports_degenerate_observation() {
        let mut filter = ekf();
        let mut h = Measurement::selector(&[SURGE], 8);
        h[(0, X)] = f64::NAN;
        let m = Unchecked {
            z: DVector::from_vec(vec![1.0]),
            h,
            r: DMatrix::identity(1, 1),
        };
        assert!(matches!(filter.bootstrap(&m), Err(OdometryError::DegenerateObservation)));
        assert!(!filter.is_initialized());
    }

    #[test]
    fn ekf_heading_correction_wraps() {
        let mut filter = initialized_at([0.0, 0.0, 0.0, PI - 0.05, 0.0, 0.0, 0.0, 0.0], 0.04);
        let m = Measurement::with_stdevs(
            DVector::from_vec(vec![-PI + 0.05]),
            Measurement::selector(&[YAW], 8),
            &[0.2],
        )
        .unwrap()
        .with_angular_components(&[0])
        .unwrap();
        let est = filter.correct(&m).unwrap();
        // The short way round crosses ±π rather than swinging through zero.
        assert!(est.state[YAW].abs() > PI - 0.05);
    }

    #[test]
    fn ekf_debug_display() {
        let filter = initialized_at([0.0; 8], 1.0);
        let debug_str = format!("{filter:?}");
        assert!(debug_str.contains("EKF"));
        let display_str = format!("{filter}");
        assert!(display_str.contains("ExtendedKalmanFilter"));
        assert!(display_str.contains("sigma"));
    }
}
