//! FLAME1 mixed-effects voxel fit
//!
//! Per voxel, the between-subject variance β is found by minimizing the
//! negative log marginal posterior of the generalized least squares model
//! with variances `s + β`. The regression weights and Gram matrix at that β
//! then give T and F statistics for every contrast.
//!
//! Reference: Woolrich et al. (2004). Multilevel linear modelling for FMRI
//! group analysis using Bayesian inference. NeuroImage 21(4):1732-1747.

use nalgebra::{DMatrix, DVector};

use super::brent::{minimize_scalar, BrentParams};
use super::prepare::{is_close_to_zero, population_std, prepare, VoxelData};
use super::{SkipReason, StatValue, Statistics, VoxelOutcome};
use crate::distributions::ZMethod;
use crate::error::Result;
use crate::linalg::{all_finite, logdet_spd, lstsq, lstsq_vec};

/// Energy returned for infeasible or non-finite candidates
pub const ENERGY_SENTINEL: f64 = 1e32;

/// Smallest variance component reported
const MIN_BETA: f64 = 1e-10;

/// Weighted least squares at a fixed variance component
#[derive(Debug, Clone)]
pub struct Gam {
    pub weights: DVector<f64>,
    pub inverse_variance: DVector<f64>,
    pub gram: DMatrix<f64>,
}

/// Generalized least squares with per-subject variances `s + beta`
///
/// # Returns
/// Regression weights, inverse variances and the Gram matrix `zᵀ V⁻¹ z`,
/// or `None` if the weighted system cannot be solved
pub fn calcgam(beta: f64, y: &DVector<f64>, z: &DMatrix<f64>, s: &DVector<f64>) -> Option<Gam> {
    let inverse_variance = s.map(|v| 1.0 / (v + beta));

    // zᵀ V⁻¹
    let mut scaled = z.transpose();
    for (mut column, &w) in scaled.column_iter_mut().zip(inverse_variance.iter()) {
        column.scale_mut(w);
    }
    let gram = &scaled * z;
    let rhs = &scaled * y;
    let weights = lstsq_vec(&gram, &rhs)?;

    Some(Gam {
        weights,
        inverse_variance,
        gram,
    })
}

/// Negative log marginal posterior at variance component `beta`
pub fn marginal_posterior_energy(
    beta: f64,
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    s: &DVector<f64>,
) -> Option<f64> {
    let gam = calcgam(beta, y, z, s)?;
    let logdet_inverse_variance: f64 = gam.inverse_variance.iter().map(|v| v.ln()).sum();
    let logdet_gram = logdet_spd(&gam.gram)?;

    let weighted_ss: f64 = y
        .iter()
        .zip(gam.inverse_variance.iter())
        .map(|(yi, wi)| yi * yi * wi)
        .sum();
    let explained = gam.weights.dot(&(&gam.gram * &gam.weights));

    Some(-0.5 * (logdet_inverse_variance - logdet_gram - (weighted_ss - explained)))
}

/// Energy with a barrier at zero and a finite sentinel for failures
pub fn energy(beta: f64, y: &DVector<f64>, z: &DMatrix<f64>, s: &DVector<f64>) -> f64 {
    if beta < 0.0 || is_close_to_zero(beta) {
        return ENERGY_SENTINEL;
    }
    match marginal_posterior_energy(beta, y, z, s) {
        Some(e) if e.is_finite() => e,
        _ => ENERGY_SENTINEL,
    }
}

/// Minimize the energy over β >= 0
pub fn solve_for_beta(
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    s: &DVector<f64>,
    params: &BrentParams,
) -> std::result::Result<f64, SkipReason> {
    let result = minimize_scalar(|beta| energy(beta, y, z, s), params)
        .ok_or(SkipReason::NonConvergence)?;
    if result.x.is_nan() {
        return Err(SkipReason::NonFinite);
    }
    Ok(result.x.max(MIN_BETA))
}

/// Stage one fit in original units
#[derive(Debug, Clone)]
pub struct Stage1 {
    pub weights: DVector<f64>,
    pub gram: DMatrix<f64>,
    /// Variance component in original units
    pub beta: f64,
}

/// Fit the mixed-effects model on prepared data
///
/// `y` and `s` are scaled by the standard deviation of `y` for the search,
/// and the weights and Gram matrix are scaled back afterwards.
pub fn flame_stage1_onvoxel(
    y: &DVector<f64>,
    z: &DMatrix<f64>,
    s: &DVector<f64>,
) -> std::result::Result<Stage1, SkipReason> {
    let norm = population_std(y);
    if !norm.is_finite() || is_close_to_zero(norm) {
        return Err(SkipReason::ZeroVariance);
    }
    let y = y / norm;
    let s = s / (norm * norm);
    if s.iter().any(|&v| v < 0.0) {
        return Err(SkipReason::NegativeVariance);
    }

    let beta = solve_for_beta(&y, z, &s, &BrentParams::default())?;
    let gam = calcgam(beta, &y, z, &s).ok_or(SkipReason::Singular)?;
    if !all_finite(&gam.gram) || gam.weights.iter().any(|v| !v.is_finite()) {
        return Err(SkipReason::Singular);
    }

    Ok(Stage1 {
        weights: gam.weights * norm,
        gram: gam.gram / (norm * norm),
        beta: beta * norm * norm,
    })
}

fn safe_ratio(cope: f64, var_cope: f64) -> f64 {
    if cope.is_finite() && var_cope.is_finite() && var_cope > 0.0 {
        cope / var_cope.sqrt()
    } else {
        f64::NAN
    }
}

/// T statistic of a single-row contrast
///
/// # Returns
/// `None` if `G⁻¹ cᵀ` cannot be solved
pub fn t_contrast(
    stage1: &Stage1,
    contrast: &DMatrix<f64>,
    dof: usize,
    z_method: ZMethod,
) -> Result<Option<Statistics>> {
    let cope = (contrast * &stage1.weights)[0];
    let Some(a) = lstsq(&stage1.gram, &contrast.transpose()) else {
        return Ok(None);
    };
    let var_cope = (contrast * a)[(0, 0)];
    let t = safe_ratio(cope, var_cope);
    let z = z_method.t2z(t, dof as f64)?;

    Ok(Some(vec![
        ("cope", StatValue::Scalar(cope)),
        ("var_cope", StatValue::Scalar(var_cope)),
        ("dof", StatValue::Scalar(dof as f64)),
        ("tstat", StatValue::Scalar(t)),
        ("zstat", StatValue::Scalar(z)),
        ("mask", StatValue::Flag(z.is_finite())),
    ]))
}

/// F statistic of a multi-row contrast
///
/// # Returns
/// `None` if either quadratic form cannot be solved
pub fn f_contrast(
    stage1: &Stage1,
    contrast: &DMatrix<f64>,
    dof2: usize,
    z_method: ZMethod,
) -> Result<Option<Statistics>> {
    let dof1 = contrast.nrows();
    let cope = contrast * &stage1.weights;
    let Some(solved) = lstsq(&stage1.gram, &contrast.transpose()) else {
        return Ok(None);
    };
    let a = contrast * solved;
    let var_cope: Vec<f64> = a.diagonal().iter().cloned().collect();
    let t: Vec<f64> = cope
        .iter()
        .zip(&var_cope)
        .map(|(&c, &v)| safe_ratio(c, v))
        .collect();

    let Some(b) = lstsq_vec(&a, &cope) else {
        return Ok(None);
    };
    let f = cope.dot(&b) / dof1 as f64;
    let z = if f.is_finite() {
        z_method.f2z(f, dof1 as f64, dof2 as f64)?
    } else {
        f64::NAN
    };

    Ok(Some(vec![
        ("cope", StatValue::Vector(cope.iter().cloned().collect())),
        ("var_cope", StatValue::Vector(var_cope)),
        ("tstat", StatValue::Vector(t)),
        ("fstat", StatValue::Scalar(f)),
        ("dof", StatValue::Vector(vec![dof1 as f64, dof2 as f64])),
        ("zstat", StatValue::Scalar(z)),
        ("mask", StatValue::Flag(z.is_finite())),
    ]))
}

/// Statistics of one contrast, T for a single row and F otherwise
pub fn flame1_contrast(
    stage1: &Stage1,
    n_subjects: usize,
    contrast: &DMatrix<f64>,
    z_method: ZMethod,
) -> Result<Option<Statistics>> {
    let dof = n_subjects.saturating_sub(stage1.weights.len());
    match contrast.nrows() {
        0 => Ok(None),
        1 => t_contrast(stage1, contrast, dof, z_method),
        _ => f_contrast(stage1, contrast, dof, z_method),
    }
}

/// FLAME1 fit and contrast statistics for one voxel
///
/// # Arguments
/// * `data` - Raw observations, missing values allowed
/// * `contrasts` - Contrast matrices in output order
/// * `z_method` - Conversion used for the z statistics
///
/// # Returns
/// Statistics per contrast that could be evaluated, or the skip reason.
/// Only a z conversion failure is an error.
pub fn voxel_calc(
    data: &VoxelData,
    contrasts: &[(String, DMatrix<f64>)],
    z_method: ZMethod,
) -> Result<VoxelOutcome> {
    let data = prepare(data);
    let n = data.n_subjects();
    if n < data.n_regressors() + 1 {
        return Ok(VoxelOutcome::Skipped(SkipReason::InsufficientData));
    }

    let stage1 = match flame_stage1_onvoxel(&data.y, &data.z, &data.s) {
        Ok(stage1) => stage1,
        Err(reason) => return Ok(VoxelOutcome::Skipped(reason)),
    };

    let mut results = Vec::with_capacity(contrasts.len());
    for (name, cmat) in contrasts {
        if let Some(statistics) = flame1_contrast(&stage1, n, cmat, z_method)? {
            results.push((name.clone(), statistics));
        }
    }

    if results.is_empty() && !contrasts.is_empty() {
        return Ok(VoxelOutcome::Skipped(SkipReason::AllContrastsFailed));
    }
    Ok(VoxelOutcome::Contrasts(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn scalar(stats: &Statistics, key: &str) -> f64 {
        match stats.iter().find(|(k, _)| *k == key) {
            Some((_, StatValue::Scalar(v))) => *v,
            other => panic!("{} is not a scalar: {:?}", key, other),
        }
    }

    fn design(n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { i as f64 })
    }

    fn response(n: usize) -> DVector<f64> {
        // slope 0.5 with deterministic scatter
        DVector::from_fn(n, |i, _| 2.0 + 0.5 * i as f64 + [0.3, -0.2, 0.1, -0.4, 0.25][i % 5])
    }

    fn contrasts() -> Vec<(String, DMatrix<f64>)> {
        vec![
            ("slope".to_string(), DMatrix::from_row_slice(1, 2, &[0.0, 1.0])),
            ("both".to_string(), DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0])),
        ]
    }

    #[test]
    fn test_calcgam_matches_ols_with_equal_variances() {
        let n = 10;
        let z = design(n);
        let y = response(n);
        let s = DVector::from_element(n, 0.0);
        let gam = calcgam(1.0, &y, &z, &s).unwrap();

        let ols = lstsq_vec(&(z.transpose() * &z), &(z.transpose() * &y)).unwrap();
        assert_abs_diff_eq!(gam.weights[0], ols[0], epsilon = 1e-10);
        assert_abs_diff_eq!(gam.weights[1], ols[1], epsilon = 1e-10);
        assert_abs_diff_eq!(gam.gram[(0, 0)], n as f64, epsilon = 1e-10);
    }

    #[test]
    fn test_energy_barrier() {
        let n = 6;
        let (y, z, s) = (response(n), design(n), DVector::from_element(n, 0.1));
        assert_eq!(energy(-1.0, &y, &z, &s), ENERGY_SENTINEL);
        assert_eq!(energy(0.0, &y, &z, &s), ENERGY_SENTINEL);
        assert!(energy(0.5, &y, &z, &s) < ENERGY_SENTINEL);
    }

    #[test]
    fn test_beta_is_positive() {
        let n = 12;
        let (y, z, s) = (response(n), design(n), DVector::from_element(n, 0.01));
        let y = &y / population_std(&y);
        let beta = solve_for_beta(&y, &z, &s, &BrentParams::default()).unwrap();
        assert!(beta >= MIN_BETA);
    }

    #[test]
    fn test_t_dof_and_f_dof() {
        let n = 12;
        let data = VoxelData::new(response(n), design(n), DVector::from_element(n, 0.05));
        let outcome = voxel_calc(&data, &contrasts(), ZMethod::Fast).unwrap();
        let VoxelOutcome::Contrasts(results) = outcome else {
            panic!("expected contrast results");
        };
        assert_eq!(results.len(), 2);

        let (name, t) = &results[0];
        assert_eq!(name, "slope");
        assert_eq!(scalar(t, "dof"), (n - 2) as f64);
        assert!(scalar(t, "cope") > 0.3 && scalar(t, "cope") < 0.7);
        assert!(scalar(t, "zstat") > 3.0);

        let (_, f) = &results[1];
        let dof = f.iter().find(|(k, _)| *k == "dof").map(|(_, v)| v.clone());
        assert_eq!(dof, Some(StatValue::Vector(vec![2.0, (n - 2) as f64])));
        assert!(scalar(f, "fstat") > 0.0);
        assert_eq!(
            f.iter().find(|(k, _)| *k == "mask").map(|(_, v)| v.clone()),
            Some(StatValue::Flag(true))
        );
    }

    #[test]
    fn test_insufficient_data_is_skipped() {
        let n = 5;
        let mut y = response(n);
        for i in 0..3 {
            y[i] = f64::NAN;
        }
        let data = VoxelData::new(y, design(n), DVector::from_element(n, 0.1));
        let outcome = voxel_calc(&data, &contrasts(), ZMethod::Fast).unwrap();
        assert_eq!(outcome, VoxelOutcome::Skipped(SkipReason::InsufficientData));
    }

    #[test]
    fn test_constant_response_is_skipped() {
        let n = 8;
        let data = VoxelData::new(DVector::from_element(n, 3.0), design(n), DVector::from_element(n, 0.1));
        let outcome = voxel_calc(&data, &contrasts(), ZMethod::Fast).unwrap();
        assert_eq!(outcome, VoxelOutcome::Skipped(SkipReason::ZeroVariance));
    }

    #[test]
    fn test_negative_variance_is_skipped() {
        let n = 8;
        let mut s = DVector::from_element(n, 0.1);
        s[2] = -0.5;
        let data = VoxelData::new(response(n), design(n), s);
        let outcome = voxel_calc(&data, &contrasts(), ZMethod::Fast).unwrap();
        assert_eq!(outcome, VoxelOutcome::Skipped(SkipReason::NegativeVariance));
    }

    #[test]
    fn test_zero_contrast_has_no_valid_z() {
        let n = 10;
        let data = VoxelData::new(response(n), design(n), DVector::from_element(n, 0.1));
        let zero = vec![("zero".to_string(), DMatrix::from_row_slice(1, 2, &[0.0, 0.0]))];
        let VoxelOutcome::Contrasts(results) = voxel_calc(&data, &zero, ZMethod::Fast).unwrap() else {
            panic!("expected contrast results");
        };
        let stats = &results[0].1;
        assert!(scalar(stats, "tstat").is_nan());
        assert_eq!(stats.last().map(|(_, v)| v.clone()), Some(StatValue::Flag(false)));
    }

    #[test]
    fn test_fast_and_reference_paths_agree() {
        let n = 10;
        let data = VoxelData::new(response(n), design(n), DVector::from_element(n, 0.2));
        let cs = contrasts();
        let fast = voxel_calc(&data, &cs[..1], ZMethod::Fast).unwrap();
        let reference = voxel_calc(&data, &cs[..1], ZMethod::Reference).unwrap();
        let (VoxelOutcome::Contrasts(a), VoxelOutcome::Contrasts(b)) = (fast, reference) else {
            panic!("expected contrast results");
        };
        assert_abs_diff_eq!(scalar(&a[0].1, "zstat"), scalar(&b[0].1, "zstat"), epsilon = 1e-6);
    }
}
