//! Motion models for the filter's prediction step
//!
//! A [`MotionModel`] supplies the nonlinear state transition $x_{k+1} = f(x_k, \Delta t)$ together with
//! its Jacobian with respect to the state, $J_x = \partial f / \partial x$, and the Jacobian $J_q$ that
//! maps the process noise vector into a state increment. The filter is generic over this trait, so a
//! different kinematic model can be injected without touching the predict/correct engine.
//!
//! # Constant velocity
//!
//! [`ConstantVelocityModel`] holds the body-frame rates constant and integrates position using the
//! current heading only:
//!
//! $$
//! \begin{aligned}
//! x' &= x + (u \cos\psi - v \sin\psi)\,\Delta t \\\\
//! y' &= y + (u \sin\psi + v \cos\psi)\,\Delta t \\\\
//! z' &= z + w\,\Delta t \\\\
//! \psi' &= \psi + r\,\Delta t
//! \end{aligned}
//! $$
//!
//! Model error enters as white acceleration on surge, sway, heave and yaw. Position terms scale with
//! $\Delta t^2 / 2$ (rotated into the world frame for the horizontal axes) and rate terms with $\Delta t$.
use nalgebra::{DMatrix, DVector};

use crate::frames::normalize_angle;
use crate::state_index::{HEAVE, SURGE, SWAY, X, Y, YAW, YAW_RATE, Z};
use crate::{NOISE_SIZE, STATE_SIZE};

/// State transition strategy injected into [`crate::kalman::ExtendedKalmanFilter`].
pub trait MotionModel {
    /// Length of the state vector the model propagates.
    fn state_dimension(&self) -> usize;
    /// Length of the process noise vector.
    fn noise_dimension(&self) -> usize;
    /// Propagate `state` by `dt` seconds, returning the new state and the state Jacobian.
    fn predict_state(&self, state: &DVector<f64>, dt: f64) -> (DVector<f64>, DMatrix<f64>);
    /// Jacobian of the propagated state with respect to the process noise, evaluated at `state`.
    fn noise_jacobian(&self, state: &DVector<f64>, dt: f64) -> DMatrix<f64>;
    /// State indices holding angles that must stay in $(-\pi, \pi]$.
    fn angular_states(&self) -> &[usize] {
        &[]
    }
}

/// Eight-state constant-velocity model driven by four acceleration noise sources.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantVelocityModel;

impl MotionModel for ConstantVelocityModel {
    fn state_dimension(&self) -> usize {
        STATE_SIZE
    }

    fn noise_dimension(&self) -> usize {
        NOISE_SIZE
    }

    fn predict_state(&self, state: &DVector<f64>, dt: f64) -> (DVector<f64>, DMatrix<f64>) {
        let (sy, cy) = state[YAW].sin_cos();
        let u_dt = state[SURGE] * dt;
        let v_dt = state[SWAY] * dt;

        let mut next = state.clone();
        next[X] += u_dt * cy - v_dt * sy;
        next[Y] += u_dt * sy + v_dt * cy;
        next[Z] += state[HEAVE] * dt;
        next[YAW] = normalize_angle(state[YAW] + state[YAW_RATE] * dt);

        let mut jx = DMatrix::<f64>::identity(STATE_SIZE, STATE_SIZE);
        jx[(X, YAW)] = -u_dt * sy - v_dt * cy;
        jx[(X, SURGE)] = dt * cy;
        jx[(X, SWAY)] = -dt * sy;
        jx[(Y, YAW)] = u_dt * cy - v_dt * sy;
        jx[(Y, SURGE)] = dt * sy;
        jx[(Y, SWAY)] = dt * cy;
        jx[(Z, HEAVE)] = dt;
        jx[(YAW, YAW_RATE)] = dt;

        (next, jx)
    }

    fn noise_jacobian(&self, state: &DVector<f64>, dt: f64) -> DMatrix<f64> {
        let (sy, cy) = state[YAW].sin_cos();
        let u_dt = state[SURGE] * dt;
        let v_dt = state[SWAY] * dt;
        let half_dt2 = 0.5 * dt * dt;

        let mut jq = DMatrix::<f64>::zeros(STATE_SIZE, NOISE_SIZE);
        jq[(X, 0)] = half_dt2 * cy;
        jq[(X, 1)] = -half_dt2 * sy;
        jq[(X, 3)] = -half_dt2 * (u_dt * sy + v_dt * cy);
        jq[(Y, 0)] = half_dt2 * sy;
        jq[(Y, 1)] = half_dt2 * cy;
        jq[(Y, 3)] = half_dt2 * (u_dt * cy - v_dt * sy);
        jq[(Z, 2)] = half_dt2;
        jq[(YAW, 3)] = half_dt2;
        jq[(SURGE, 0)] = dt;
        jq[(SWAY, 1)] = dt;
        jq[(HEAVE, 2)] = dt;
        jq[(YAW_RATE, 3)] = dt;
        jq
    }

    fn angular_states(&self) -> &[usize] {
        &[YAW]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn state(values: [f64; 8]) -> DVector<f64> {
        DVector::from_row_slice(&values)
    }

    #[test]
    fn unit_surge_advances_along_heading() {
        let model = ConstantVelocityModel;
        let (next, _) = model.predict_state(&state([0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]), 1.0);
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];
        for i in 0..8 {
            assert_approx_eq!(next[i], expected[i], 1e-12);
        }
    }

    #[test]
    fn surge_is_rotated_by_heading() {
        let model = ConstantVelocityModel;
        let (next, _) = model.predict_state(
            &state([1.0, 1.0, 2.0, PI / 2.0, 2.0, 0.5, -0.1, 0.0]),
            0.5,
        );
        assert_approx_eq!(next[X], 1.0 - 0.25, 1e-12);
        assert_approx_eq!(next[Y], 1.0 + 1.0, 1e-12);
        assert_approx_eq!(next[Z], 2.0 - 0.05, 1e-12);
        assert_approx_eq!(next[YAW], PI / 2.0, 1e-12);
    }

    #[test]
    fn yaw_is_wrapped() {
        let model = ConstantVelocityModel;
        let (next, _) =
            model.predict_state(&state([0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 1.0]), 1.0);
        assert_approx_eq!(next[YAW], 4.0 - 2.0 * PI, 1e-12);
    }

    #[test]
    fn zero_step_is_identity() {
        let model = ConstantVelocityModel;
        let x = state([3.0, -2.0, 10.0, 1.2, 0.7, -0.3, 0.1, 0.05]);
        let (next, jx) = model.predict_state(&x, 0.0);
        assert_eq!(next, x);
        assert_eq!(jx, DMatrix::identity(8, 8));
        let jq = model.noise_jacobian(&x, 0.0);
        assert!(jq.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn state_jacobian_matches_finite_differences() {
        let model = ConstantVelocityModel;
        let x = state([3.0, -2.0, 10.0, 1.2, 0.7, -0.3, 0.1, 0.05]);
        let dt = 0.8;
        let (_, jx) = model.predict_state(&x, dt);
        let h = 1e-6;
        for k in 0..8 {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[k] += h;
            minus[k] -= h;
            let fp = model.predict_state(&plus, dt).0;
            let fm = model.predict_state(&minus, dt).0;
            for i in 0..8 {
                assert_approx_eq!(jx[(i, k)], (fp[i] - fm[i]) / (2.0 * h), 1e-6);
            }
        }
    }

    #[test]
    fn noise_jacobian_shape_and_rate_rows() {
        let model = ConstantVelocityModel;
        let x = state([0.0, 0.0, 0.0, 0.4, 1.0, 0.2, 0.0, 0.0]);
        let jq = model.noise_jacobian(&x, 2.0);
        assert_eq!(jq.shape(), (8, 4));
        assert_eq!(jq[(SURGE, 0)], 2.0);
        assert_eq!(jq[(YAW_RATE, 3)], 2.0);
        assert_approx_eq!(jq[(Z, 2)], 2.0, 1e-12);
        assert_approx_eq!(jq[(YAW, 3)], 2.0, 1e-12);
        assert_approx_eq!(jq[(X, 0)], 2.0 * 0.4f64.cos(), 1e-12);
    }

    #[test]
    fn reports_dimensions() {
        let model = ConstantVelocityModel;
        assert_eq!(model.state_dimension(), 8);
        assert_eq!(model.noise_dimension(), 4);
        assert_eq!(model.angular_states(), &[YAW]);
    }
}
