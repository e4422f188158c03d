//! Linear algebra helpers for the filters
//!
//! Strategy for the EKF innovation solve:
//! 1) Symmetrize S ← 0.5 (S + Sᵀ) to scrub accumulated floating-point asymmetry
//! 2) Cholesky factorize; a singular or indefinite S fails the factorization and the
//!    caller skips the correction for that cycle instead of propagating garbage
//!
//! The filters in this crate run on small fixed-size matrices (4×4 state, 3×3
//! innovation), so everything here is generic over compile-time dimensions and never
//! allocates.

use nalgebra::SMatrix;

/// Re-symmetrize a nominally symmetric matrix.
///
/// Covariance propagation accumulates floating-point asymmetry over many cycles; the
/// filters re-symmetrize after every predict and correct so the covariance stays a valid
/// input to the Cholesky solve.
pub fn symmetrize<const N: usize>(matrix: &SMatrix<f64, N, N>) -> SMatrix<f64, N, N> {
    0.5 * (matrix + matrix.transpose())
}

/// Solve `A X = B` for a symmetric positive-definite `A` via Cholesky factorization.
///
/// Returns `None` when `A` is singular, indefinite, or non-finite; callers treat that
/// as "skip this correction" rather than an error. A naive matrix inverse is never
/// formed.
pub fn chol_solve_spd<const N: usize, const M: usize>(
    a: &SMatrix<f64, N, N>,
    b: &SMatrix<f64, N, M>,
) -> Option<SMatrix<f64, N, M>> {
    let factorization = symmetrize(a).cholesky()?;
    Some(factorization.solve(b))
}
