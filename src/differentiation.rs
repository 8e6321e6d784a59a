//! Finite-difference derivatives on `nalgebra` vectors.
//!
//! The differencing itself is delegated to `finitediff`, which works on `Vec<f64>`; this
//! module only converts between the two representations and symmetrizes Hessians.

use finitediff::FiniteDiff;
use nalgebra::{DMatrix, DVector};

fn column(point: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(point)
}

/// Central-difference gradient of a scalar function.
pub fn gradient<F>(f: F, x: &DVector<f64>) -> DVector<f64>
where
    F: Fn(&DVector<f64>) -> f64,
{
    let point = x.as_slice().to_vec();
    let cost = |p: &Vec<f64>| f(&column(p));
    DVector::from_vec(point.central_diff(&cost))
}

/// Hessian as the central-difference Jacobian of `gradient`, symmetrized.
///
/// The result is only as good as `gradient`: pass an exact gradient whenever one exists.
pub fn hessian<G>(gradient: G, x: &DVector<f64>) -> DMatrix<f64>
where
    G: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n = x.len();
    let point = x.as_slice().to_vec();
    let grad = |p: &Vec<f64>| gradient(&column(p)).as_slice().to_vec();
    let rows = point.central_hessian(&grad);
    let mut hess = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
    symmetrize(&mut hess);
    hess
}

/// Replaces each off-diagonal pair with its average.
fn symmetrize(hess: &mut DMatrix<f64>) {
    for i in 0..hess.nrows() {
        for j in 0..i {
            let average = 0.5 * (hess[(i, j)] + hess[(j, i)]);
            hess[(i, j)] = average;
            hess[(j, i)] = average;
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn quadratic(x: &DVector<f64>) -> f64 {
        3.0 * x[0] * x[0] + 2.0 * x[0] * x[1] - x[1] * x[1] + 5.0 * x[1]
    }

    fn quadratic_gradient(x: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![6.0 * x[0] + 2.0 * x[1], 2.0 * x[0] - 2.0 * x[1] + 5.0])
    }

    #[test]
    fn gradient_of_quadratic() {
        let x = DVector::from_vec(vec![1.5, -2.0]);
        let g = gradient(quadratic, &x);
        assert_relative_eq!(g[0], 6.0 * 1.5 + 2.0 * -2.0, epsilon = 1e-5);
        assert_relative_eq!(g[1], 2.0 * 1.5 + 4.0 + 5.0, epsilon = 1e-5);
    }

    #[test]
    fn hessian_of_quadratic() {
        let x = DVector::from_vec(vec![10.0, 0.3]);
        let h = hessian(quadratic_gradient, &x);
        assert_relative_eq!(h[(0, 0)], 6.0, epsilon = 1e-5);
        assert_relative_eq!(h[(0, 1)], 2.0, epsilon = 1e-5);
        assert_eq!(h[(1, 0)], h[(0, 1)]);
        assert_relative_eq!(h[(1, 1)], -2.0, epsilon = 1e-5);
    }

    #[test]
    fn symmetrize_averages_off_diagonal_pairs() {
        let mut h = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        symmetrize(&mut h);
        assert_eq!(h, DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]));
    }
}
