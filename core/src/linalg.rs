//! Linear algebra helpers for the filter's covariance arithmetic.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn solve_spd(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn pseudo_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn is_positive_semi_definite(m: &DMatrix<f64>, tol: f64) -> bool
//!
//! Strategy for `solve_spd`:
//! 1) Symmetrize A ← 0.5 (A + Aᵀ)
//! 2) Reject A when its reciprocal condition number is below [`SINGULARITY_RCOND`]
//! 3) Cholesky solve
//!
//! There is deliberately no jitter ramp: a singular innovation covariance must surface to the caller.

use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// Matrices whose smallest-to-largest eigenvalue magnitude ratio falls below this are treated as singular.
pub const SINGULARITY_RCOND: f64 = 1e-12;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces round-off asymmetry after covariance updates. The result is exactly symmetric.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Ratio of the smallest to the largest absolute eigenvalue of a symmetric matrix.
///
/// Returns 0 for a zero or non-finite matrix.
pub fn reciprocal_condition(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() || m.iter().any(|v| !v.is_finite()) {
        return 0.0;
    }
    let lambdas = SymmetricEigen::new(symmetrize(m)).eigenvalues;
    let largest = lambdas.iter().fold(0.0f64, |acc, l| acc.max(l.abs()));
    if largest == 0.0 {
        return 0.0;
    }
    let smallest = lambdas.iter().fold(f64::INFINITY, |acc, l| acc.min(l.abs()));
    smallest / largest
}

/// Solve A X = B for symmetric positive definite A.
///
/// Returns None when A is not square, does not match B, is numerically singular or is not
/// positive definite.
pub fn solve_spd(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    let a_sym = symmetrize(a);
    if reciprocal_condition(&a_sym) < SINGULARITY_RCOND {
        return None;
    }
    Cholesky::new(a_sym).map(|ch| ch.solve(b))
}

/// Moore-Penrose pseudo-inverse via SVD.
///
/// Singular values below `max(rows, cols) · ε · σ_max` are treated as zero.
pub fn pseudo_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.is_empty() || m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let svd = m.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    let tol = m.nrows().max(m.ncols()) as f64 * f64::EPSILON * sigma_max;
    svd.pseudo_inverse(tol).ok()
}

/// True when `m` is square, symmetric and has no eigenvalue below `-tol`.
pub fn is_positive_semi_definite(m: &DMatrix<f64>, tol: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    if (m - m.transpose()).abs().max() > tol {
        return false;
    }
    SymmetricEigen::new(m.clone()).eigenvalues.min() >= -tol
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        let mut max_abs = 0.0f64;
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                max_abs = max_abs.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max_abs <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
        assert_eq!(s, s.transpose());
    }

    #[test]
    fn t_solve_spd_basic() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let x = solve_spd(&a, &b).expect("SPD system should solve");
        assert!(approx_eq(&(&a * &x), &b, 1e-12));
    }

    #[test]
    fn t_solve_spd_singular() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DMatrix::identity(2, 2);
        assert!(solve_spd(&a, &b).is_none());
        assert!(solve_spd(&DMatrix::zeros(3, 3), &DMatrix::identity(3, 3)).is_none());
    }

    #[test]
    fn t_solve_spd_indefinite_or_bad_shape() {
        let a = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        assert!(solve_spd(&a, &DMatrix::identity(2, 2)).is_none());
        let rect = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert!(solve_spd(&rect, &DMatrix::identity(2, 2)).is_none());
        assert!(solve_spd(&DMatrix::identity(2, 2), &DMatrix::identity(3, 3)).is_none());
    }

    #[test]
    fn t_solve_spd_nan() {
        let a = DMatrix::from_row_slice(2, 2, &[f64::NAN, 0.0, 0.0, 1.0]);
        assert!(solve_spd(&a, &DMatrix::identity(2, 2)).is_none());
    }

    #[test]
    fn t_reciprocal_condition() {
        let a = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![4.0, 2.0, 1.0]));
        assert!((reciprocal_condition(&a) - 0.25).abs() < 1e-12);
        assert_eq!(reciprocal_condition(&DMatrix::zeros(2, 2)), 0.0);
    }

    #[test]
    fn t_pseudo_inverse_selection() {
        // Row selector: H⁺ is its transpose.
        let mut h = DMatrix::zeros(2, 4);
        h[(0, 1)] = 1.0;
        h[(1, 3)] = 1.0;
        let pinv = pseudo_inverse(&h).expect("pinv");
        assert!(approx_eq(&pinv, &h.transpose(), 1e-12));
    }

    #[test]
    fn t_pseudo_inverse_square_invertible() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 1.0, 1.0]);
        let pinv = pseudo_inverse(&a).expect("pinv");
        let inv = a.clone().try_inverse().expect("invertible");
        assert!(approx_eq(&pinv, &inv, 1e-12));
    }

    #[test]
    fn t_pseudo_inverse_penrose_conditions() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 0.0, 1.0]);
        let p = pseudo_inverse(&a).expect("pinv");
        assert!(approx_eq(&(&a * &p * &a), &a, 1e-10));
        assert!(approx_eq(&(&p * &a * &p), &p, 1e-10));
    }

    #[test]
    fn t_is_psd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        assert!(is_positive_semi_definite(&symmetrize(&p), 1e-12));
        let indefinite = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        assert!(!is_positive_semi_definite(&indefinite, 1e-12));
        let asym = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(!is_positive_semi_definite(&asym, 1e-12));
    }
}
