//! Weighted least squares solver.
//!
//! The GLM fitter repeatedly solves small penalized regression problems of the form:
//!
//! ```text
//! minimize Σ w_i (z_i - x_i^T β)^2 + Σ_j λ_j (β_j - m_j)^2
//! ```
//!
//! Implementation choices:
//! - We scale rows by `sqrt(w_i)` and append one pseudo-row per penalized
//!   coefficient, then solve an ordinary least squares problem.
//! - SVD keeps the solve robust when the design is tall and nearly collinear
//!   (control covariates often are).

use nalgebra::{DMatrix, DVector};

/// Ratio of smallest to largest singular value below which a design is treated
/// as rank-deficient.
pub const RANK_TOL: f64 = 1e-10;

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// `min σ / max σ` of the design; `0.0` for an empty or all-zero matrix.
pub fn inverse_condition(x: &DMatrix<f64>) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let sv = x.clone().svd(false, false).singular_values;
    let max = sv.iter().copied().fold(0.0_f64, f64::max);
    let min = sv.iter().copied().fold(f64::INFINITY, f64::min);
    if max <= 0.0 || !max.is_finite() {
        0.0
    } else {
        min / max
    }
}

/// Solve the penalized weighted problem in the module docs.
///
/// `penalty` holds `(λ_j, m_j)` per coefficient; `λ_j = 0` leaves `β_j` free.
pub fn solve_penalized_wls(
    x: &DMatrix<f64>,
    z: &DVector<f64>,
    w: &DVector<f64>,
    penalty: &[(f64, f64)],
) -> Option<DVector<f64>> {
    let (n, p) = x.shape();
    debug_assert_eq!(penalty.len(), p);
    let extra = penalty.iter().filter(|(lambda, _)| *lambda > 0.0).count();

    let mut xa = DMatrix::<f64>::zeros(n + extra, p);
    let mut za = DVector::<f64>::zeros(n + extra);
    for i in 0..n {
        let sw = w[i].max(0.0).sqrt();
        for j in 0..p {
            xa[(i, j)] = x[(i, j)] * sw;
        }
        za[i] = z[i] * sw;
    }
    let mut row = n;
    for (j, &(lambda, mean)) in penalty.iter().enumerate() {
        if lambda > 0.0 {
            let s = lambda.sqrt();
            xa[(row, j)] = s;
            za[row] = s * mean;
            row += 1;
        }
    }

    solve_least_squares(&xa, &za)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn penalty_shrinks_toward_prior_mean() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let z = DVector::from_row_slice(&[2.0, 5.0, 8.0]);
        let w = DVector::from_element(3, 1.0);

        let free = solve_penalized_wls(&x, &z, &w, &[(0.0, 0.0), (0.0, 0.0)]).unwrap();
        let shrunk = solve_penalized_wls(&x, &z, &w, &[(0.0, 0.0), (1e6, 0.0)]).unwrap();
        assert!((free[1] - 3.0).abs() < 1e-9);
        assert!(shrunk[1].abs() < 1e-3);
    }

    #[test]
    fn collinear_design_has_tiny_inverse_condition() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        assert!(inverse_condition(&x) < RANK_TOL);
    }
}
