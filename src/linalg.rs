//! Dense linear algebra helpers for the per-voxel solvers
//!
//! Design matrices are small (subjects × regressors), so every voxel works on
//! `nalgebra` dynamic matrices. Least squares is SVD based and returns the
//! minimum-norm solution, which keeps rank-deficient Gram matrices usable.

use nalgebra::{DMatrix, DVector, SVD};

/// Maximum number of implicit QR sweeps before an SVD is declared failed
const SVD_MAX_ITER: usize = 1000;

/// True if every element of the matrix is finite
pub fn all_finite(a: &DMatrix<f64>) -> bool {
    a.iter().all(|v| v.is_finite())
}

fn svd(a: &DMatrix<f64>) -> Option<SVD<f64, nalgebra::Dyn, nalgebra::Dyn>> {
    if a.nrows() == 0 || a.ncols() == 0 || !all_finite(a) {
        return None;
    }
    SVD::try_new(a.clone(), true, true, f64::EPSILON, SVD_MAX_ITER)
}

/// Minimum-norm least-squares solution of `a x = b`
///
/// Singular values below `rcond * σ_max` are treated as zero, with
/// `rcond = ε · max(m, n)`.
///
/// # Arguments
/// * `a` - Coefficient matrix (m × n)
/// * `b` - Right-hand side (m × k)
///
/// # Returns
/// Solution (n × k), or `None` if the inputs are non-finite or the SVD fails
pub fn lstsq(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if a.nrows() != b.nrows() || !all_finite(b) {
        return None;
    }
    let decomposition = svd(a)?;
    let u = decomposition.u.as_ref()?;
    let v_t = decomposition.v_t.as_ref()?;
    let sv = &decomposition.singular_values;

    let sigma_max = sv.iter().cloned().fold(0.0, f64::max);
    let rcond = f64::EPSILON * a.nrows().max(a.ncols()) as f64;
    let cutoff = rcond * sigma_max;

    // x = V Σ⁺ Uᵀ b
    let mut utb = u.transpose() * b;
    for (i, &s) in sv.iter().enumerate() {
        let scale = if s > cutoff { 1.0 / s } else { 0.0 };
        utb.row_mut(i).scale_mut(scale);
    }
    Some(v_t.transpose() * utb)
}

/// Vector form of [`lstsq`]
pub fn lstsq_vec(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let b = DMatrix::from_column_slice(b.len(), 1, b.as_slice());
    lstsq(a, &b).map(|x| x.column(0).into_owned())
}

/// Log-determinant of a symmetric positive definite matrix via Cholesky
pub fn logdet_spd(a: &DMatrix<f64>) -> Option<f64> {
    if !all_finite(a) {
        return None;
    }
    let chol = a.clone().cholesky()?;
    let l = chol.l_dirty();
    let mut logdet = 0.0;
    for i in 0..a.nrows() {
        logdet += 2.0 * l[(i, i)].ln();
    }
    if logdet.is_finite() {
        Some(logdet)
    } else {
        None
    }
}

/// Smallest and largest singular values of a matrix
pub fn singular_value_range(a: &DMatrix<f64>) -> Option<(f64, f64)> {
    if a.nrows() == 0 || a.ncols() == 0 || !all_finite(a) {
        return None;
    }
    let sv = SVD::try_new(a.clone(), false, false, f64::EPSILON, SVD_MAX_ITER)?.singular_values;
    let min = sv.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = sv.iter().cloned().fold(0.0, f64::max);
    Some((min, max))
}

/// Numerical rank using the same cutoff as [`lstsq`]
pub fn rank(a: &DMatrix<f64>) -> usize {
    let Some(decomposition) = svd(a) else {
        return 0;
    };
    let sv = &decomposition.singular_values;
    let sigma_max = sv.iter().cloned().fold(0.0, f64::max);
    let cutoff = f64::EPSILON * a.nrows().max(a.ncols()) as f64 * sigma_max;
    sv.iter().filter(|&&s| s > cutoff).count()
}
