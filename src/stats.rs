//! Numerically stable weight arithmetic and weighted moments.
//!
//! Distributed runs apply the same helpers to the whole population on the coordinator, so
//! a statistic never depends on how the particles are split across ranks.

use nalgebra as na;
use ndarray::prelude::*;

/// Computes `ln(Σ exp(v_i))` without overflow or underflow.
///
/// Returns `-inf` for an empty slice or when every value is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + shifted_exp_sum(values, max).ln()
}

/// `Σ exp(v_i - shift)`.
pub fn shifted_exp_sum(values: &[f64], shift: f64) -> f64 {
    values.iter().map(|v| (v - shift).exp()).sum()
}

/// `Σ w_i x_i` over the rows of `samples` (`n × d`).
pub fn weighted_sum(samples: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array1<f64> {
    samples.t().dot(&weights)
}

/// `Σ w_i (x_i - mean)(x_i - mean)ᵀ` over the rows of `samples`.
pub fn weighted_scatter(
    samples: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    mean: ArrayView1<f64>,
) -> Array2<f64> {
    let centered = &samples - &mean.insert_axis(Axis(0));
    let scaled = &centered * &weights.insert_axis(Axis(1));
    scaled.t().dot(&centered)
}

/// Turns a weighted scatter matrix into an unbiased covariance estimate.
///
/// `sum_w` and `sum_w2` are the sums of the weights and of their squares. The estimate is
/// `scatter / (sum_w - sum_w2 / sum_w)`, which reduces to the `ddof = 1` sample covariance
/// for uniform weights. When the result is not a finite positive-definite matrix the
/// identity matrix is returned instead, so that a proposal can always be built from it.
pub fn finalize_covariance(scatter: Array2<f64>, sum_w: f64, sum_w2: f64) -> Array2<f64> {
    let dim = scatter.nrows();
    let denominator = sum_w - sum_w2 / sum_w;
    if denominator.is_nan() || denominator <= 0.0 {
        log::warn!("degenerate weights (denominator {denominator}); using identity covariance");
        return Array2::eye(dim);
    }
    let cov = scatter / denominator;
    if cov.iter().all(|v| v.is_finite()) && is_positive_definite(&cov) {
        cov
    } else {
        log::warn!("weighted covariance is not positive-definite; using identity covariance");
        Array2::eye(dim)
    }
}

/// Lower Cholesky factor `L` with `L Lᵀ = matrix`, or `None` if `matrix` is not
/// positive-definite.
pub fn cholesky(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let dim = matrix.nrows();
    if dim == 0 || matrix.ncols() != dim {
        return None;
    }
    let dense = na::DMatrix::from_fn(dim, dim, |i, j| matrix[[i, j]]);
    let factor = dense.cholesky()?.l();
    if !factor.diagonal().iter().all(|d| d.is_finite() && *d > 0.0) {
        return None;
    }
    Some(Array2::from_shape_fn((dim, dim), |(i, j)| factor[(i, j)]))
}

pub fn is_positive_definite(matrix: &Array2<f64>) -> bool {
    cholesky(matrix).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn log_sum_exp_matches_naive_sum() {
        let values = [0.1, 0.2, 0.3, 0.4];
        let naive = values.iter().map(|v: &f64| v.exp()).sum::<f64>().ln();
        assert_abs_diff_eq!(log_sum_exp(&values), naive, epsilon = 1e-12);
    }

    #[test]
    fn log_sum_exp_survives_underflow() {
        let values = [-1.0e4, -1.0e4];
        assert_abs_diff_eq!(log_sum_exp(&values), -1.0e4 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn uniform_weights_give_sample_covariance() {
        let samples = arr2(&[[0.0, 1.0], [1.0, 3.0], [2.0, 4.0], [3.0, 8.0]]);
        let weights = Array1::from_elem(4, 0.25);
        let mean = weighted_sum(samples.view(), weights.view());
        let scatter = weighted_scatter(samples.view(), weights.view(), mean.view());
        let cov = finalize_covariance(scatter, 1.0, 0.25);
        // ddof = 1 reference values.
        assert_abs_diff_eq!(cov[[0, 0]], 5.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], cov[[1, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 11.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_scatter_falls_back_to_identity() {
        let cov = finalize_covariance(Array2::zeros((3, 3)), 1.0, 0.2);
        assert_eq!(cov, Array2::<f64>::eye(3));
        let cov = finalize_covariance(Array2::ones((2, 2)), 1.0, 1.0);
        assert_eq!(cov, Array2::<f64>::eye(2));
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let m = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let l = cholesky(&m).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), m, epsilon = 1e-12);
        assert!(cholesky(&arr2(&[[1.0, 2.0], [2.0, 1.0]])).is_none());
    }
}
