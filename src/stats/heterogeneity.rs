//! Between-subject heterogeneity of effect sizes
//!
//! Compares a fixed-effect model (no between-subject variance) with a
//! random-effects model whose variance component ϑ is fitted by restricted
//! maximum likelihood, and reports diagnostics of the sampling variances.
//!
//! References:
//! - Chen et al. (2012). A method of moments estimator for random effect
//!   multivariate meta-analysis. Biometrics 68(4):1278-1284.
//! - Viechtbauer (2005). Bias and efficiency of meta-analytic variance
//!   estimators in the random-effects model. J. Educ. Behav. Stat. 30(3).

use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::digamma;

use super::prepare::{is_close_to_zero, population_std, prepare, VoxelData};
use super::{SkipReason, StatValue, Statistics, VoxelOutcome};
use crate::linalg::{logdet_spd, lstsq};

const REML_MAX_ITER: usize = 100;
const REML_TOL: f64 = 1e-10;
const MAX_HALVINGS: usize = 40;

const INVGAMMA_MAX_ITER: usize = 100;
const INVGAMMA_TOL: f64 = 1e-10;

// ============================================================================
// Restricted likelihood
// ============================================================================

/// Quantities of the restricted likelihood at one ϑ
#[derive(Debug, Clone)]
struct RemlTerms {
    neg_log_lik: f64,
    gradient: f64,
    observed_hessian: f64,
    fisher: f64,
    /// yᵀPPPy, the curvature term used for the variance of ϑ
    ypppy: f64,
}

/// Projection `P = V⁻¹ - V⁻¹X (XᵀV⁻¹X)⁻¹ XᵀV⁻¹` and `XᵀV⁻¹X`
fn projection(theta: f64, x: &DMatrix<f64>, s: &DVector<f64>) -> Option<(DVector<f64>, DMatrix<f64>, DMatrix<f64>)> {
    if theta < 0.0 {
        return None;
    }
    let vinv = s.map(|v| 1.0 / (v + theta));
    if vinv.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut a = x.transpose();
    for (mut column, &w) in a.column_iter_mut().zip(vinv.iter()) {
        column.scale_mut(w);
    }
    let b = &a * x;
    let solved = lstsq(&b, &a)?;
    let p = DMatrix::from_diagonal(&vinv) - a.transpose() * solved;
    Some((vinv, p, b))
}

fn reml_terms(theta: f64, y: &DVector<f64>, x: &DMatrix<f64>, s: &DVector<f64>) -> Option<RemlTerms> {
    let (vinv, p, b) = projection(theta, x, s)?;

    let log_det_vinv: f64 = vinv.iter().map(|v| v.ln()).sum();
    let log_det_b = logdet_spd(&b)?;
    let py = &p * y;
    let ypy = y.dot(&py);
    let ppy = &p * &py;

    let pp = &p * &p;
    let trace_p = p.trace();
    let trace_pp = pp.trace();
    let yppy = py.dot(&py);
    let ypppy = py.dot(&ppy);

    let terms = RemlTerms {
        neg_log_lik: -0.5 * log_det_vinv + 0.5 * log_det_b + 0.5 * ypy,
        gradient: 0.5 * (trace_p - yppy),
        observed_hessian: ypppy - 0.5 * trace_pp,
        fisher: 0.5 * trace_pp,
        ypppy,
    };
    if terms.neg_log_lik.is_finite() {
        Some(terms)
    } else {
        None
    }
}

/// Restricted negative log-likelihood of the random-effects model
pub fn reml_neg_log_lik(theta: f64, y: &DVector<f64>, x: &DMatrix<f64>, s: &DVector<f64>) -> Option<f64> {
    reml_terms(theta, y, x, s).map(|t| t.neg_log_lik)
}

/// REML estimate of the variance component
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemlFit {
    pub theta: f64,
    pub neg_log_lik: f64,
    /// yᵀPPPy at the estimate
    pub curvature: f64,
}

/// Fit ϑ >= 0 by projected Newton iterations with step halving
///
/// The observed Hessian is used where it is positive, the expected
/// information elsewhere.
pub fn reml_fit(y: &DVector<f64>, x: &DMatrix<f64>, s: &DVector<f64>) -> std::result::Result<RemlFit, SkipReason> {
    let mut theta = (1.0 - s.mean()).max(0.0);
    let mut terms = reml_terms(theta, y, x, s).ok_or(SkipReason::NonFinite)?;

    for _ in 0..REML_MAX_ITER {
        let curvature = if terms.observed_hessian > 0.0 && terms.observed_hessian.is_finite() {
            terms.observed_hessian
        } else {
            terms.fisher
        };
        if !(curvature > 0.0) || !terms.gradient.is_finite() {
            return Err(SkipReason::NonFinite);
        }

        // at the boundary with an uphill gradient
        if theta == 0.0 && terms.gradient >= 0.0 {
            return Ok(RemlFit {
                theta,
                neg_log_lik: terms.neg_log_lik,
                curvature: terms.ypppy,
            });
        }

        let mut step = terms.gradient / curvature;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = (theta - step).max(0.0);
            if let Some(next) = reml_terms(candidate, y, x, s) {
                if next.neg_log_lik <= terms.neg_log_lik + REML_TOL * terms.neg_log_lik.abs().max(1.0) {
                    accepted = Some((candidate, next));
                    break;
                }
            }
            step *= 0.5;
        }
        let Some((candidate, next)) = accepted else {
            return Err(SkipReason::NonConvergence);
        };

        let change = (candidate - theta).abs();
        theta = candidate;
        terms = next;
        if change <= REML_TOL * (1.0 + theta) {
            return Ok(RemlFit {
                theta,
                neg_log_lik: terms.neg_log_lik,
                curvature: terms.ypppy,
            });
        }
    }

    Err(SkipReason::NonConvergence)
}

// ============================================================================
// Method of moments I²
// ============================================================================

/// I² heterogeneity index from the method of moments estimator
///
/// # Returns
/// `None` without residual degrees of freedom or if the weighted system
/// cannot be solved
pub fn mom_i2(y: &DVector<f64>, x: &DMatrix<f64>, s: &DVector<f64>) -> Option<f64> {
    let (n, p) = x.shape();
    let dof = n as f64 - p as f64 - 1.0;
    if dof <= 0.0 {
        return None;
    }
    let w0 = s.map(|v| 1.0 / v);
    if w0.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut w0x = x.clone();
    for (i, mut row) in w0x.row_iter_mut().enumerate() {
        row.scale_mut(w0[i]);
    }
    let hat = lstsq(&(x.transpose() * &w0x), &w0x.transpose())?;
    let a0 = &hat * y;
    let r = y - x * a0;
    let q: f64 = r.iter().zip(w0.iter()).map(|(ri, wi)| ri * ri * wi).sum();

    let p0 = DMatrix::from_diagonal(&w0) - &w0x * &hat;
    let trace_p0 = p0.trace();

    let tau2 = ((q - dof) / trace_p0).max(0.0);
    let h2 = tau2 * trace_p0 / dof + 1.0;
    let i2 = (h2 - 1.0) / h2;
    i2.is_finite().then_some(i2)
}

// ============================================================================
// Inverse gamma fit of the sampling variances
// ============================================================================

/// Trigamma function ψ'(x) for x > 0
pub fn trigamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut value = 0.0;
    while x < 10.0 {
        value += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    value
        + inv
        + 0.5 * inv2
        + inv
            * inv2
            * (1.0 / 6.0
                - inv2
                    * (1.0 / 30.0
                        - inv2
                            * (1.0 / 42.0
                                - inv2 * (1.0 / 30.0 - inv2 * (5.0 / 66.0 - inv2 * (691.0 / 2730.0 - inv2 * 7.0 / 6.0))))))
}

/// Maximum likelihood inverse gamma shape and scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvGammaFit {
    pub shape: f64,
    pub scale: f64,
    /// Inverse of the negative log-likelihood Hessian, row-major
    pub covariance: [f64; 4],
}

/// Fit an inverse gamma distribution (location 0) to positive values
///
/// The scale is profiled out as `b = n a / Σ 1/x`, leaving a Newton
/// iteration on the shape.
pub fn invgamma_fit(x: &DVector<f64>) -> Option<InvGammaFit> {
    let n = x.len() as f64;
    if x.len() < 2 || x.iter().any(|&v| !(v > 0.0) || !v.is_finite()) {
        return None;
    }
    let u: f64 = x.iter().map(|v| v.ln()).sum();
    let v: f64 = x.iter().map(|v| 1.0 / v).sum();

    let mean = x.mean();
    let variance = x.iter().map(|xi| (xi - mean).powi(2)).sum::<f64>() / (n - 1.0);
    if !(variance > 0.0) {
        return None;
    }

    // method of moments start
    let mut a = mean * mean / variance + 2.0;
    let mut converged = false;
    for _ in 0..INVGAMMA_MAX_ITER {
        let g = n * digamma(a) - n * (n * a / v).ln() + u;
        let dg = n * trigamma(a) - n / a;
        if !g.is_finite() || !dg.is_finite() || dg == 0.0 {
            return None;
        }
        let mut next = a - g / dg;
        if next <= 0.0 {
            next = 0.5 * a;
        }
        let change = (next - a).abs();
        a = next;
        if change <= INVGAMMA_TOL * a {
            converged = true;
            break;
        }
    }
    if !converged {
        return None;
    }
    let b = n * a / v;

    let h = [
        n * trigamma(a),
        -n / b,
        -n / b,
        n * a / (b * b),
    ];
    let det = h[0] * h[3] - h[1] * h[2];
    if !det.is_finite() || det == 0.0 {
        return None;
    }
    let covariance = [h[3] / det, -h[1] / det, -h[2] / det, h[0] / det];

    Some(InvGammaFit {
        shape: a,
        scale: b,
        covariance,
    })
}

/// Typical within-study variance `(n-1) Σw / ((Σw)² - Σw²)` with `w = 1/s`
pub fn typical_variance(s: &DVector<f64>) -> Option<f64> {
    let n = s.len() as f64;
    let u: f64 = s.iter().map(|v| 1.0 / v).sum();
    let v: f64 = s.iter().map(|v| 1.0 / (v * v)).sum();
    let typical = (n - 1.0) * u / (u * u - v);
    typical.is_finite().then_some(typical)
}

// ============================================================================
// Voxel entry point
// ============================================================================

/// Heterogeneity statistics on prepared data
pub fn het_on_voxel(y: &DVector<f64>, z: &DMatrix<f64>, s: &DVector<f64>) -> std::result::Result<Statistics, SkipReason> {
    if s.iter().any(|&v| v < 0.0) {
        return Err(SkipReason::NegativeVariance);
    }
    if s.iter().any(|&v| v == 0.0) {
        return Err(SkipReason::ZeroSamplingVariance);
    }

    let norm = population_std(y);
    if !norm.is_finite() || is_close_to_zero(norm) {
        return Err(SkipReason::ZeroVariance);
    }
    let norm2 = norm * norm;
    let y_norm = y / norm;
    let s_norm = s / norm2;

    let neg_log_lik_fe = reml_neg_log_lik(0.0, &y_norm, z, &s_norm).ok_or(SkipReason::Singular)?;
    let mut me = reml_fit(&y_norm, z, &s_norm)?;
    if neg_log_lik_fe < me.neg_log_lik {
        let at_zero = reml_terms(0.0, &y_norm, z, &s_norm).ok_or(SkipReason::Singular)?;
        me = RemlFit {
            theta: 0.0,
            neg_log_lik: at_zero.neg_log_lik,
            curvature: at_zero.ypppy,
        };
    }

    let var_theta = 1.0 / me.curvature;
    let beta = vec![me.theta * norm2, var_theta * norm2 * norm2];

    let chisq = 2.0 * (neg_log_lik_fe - me.neg_log_lik);
    let pseudo_r2 = (1.0 - me.neg_log_lik / neg_log_lik_fe).clamp(0.0, 1.0);

    let mut statistics: Statistics = vec![
        ("hetnorm", StatValue::Scalar(norm)),
        ("hetbeta", StatValue::Vector(beta)),
    ];
    if let Some(gamma) = invgamma_fit(s) {
        let mut values = vec![gamma.shape, gamma.scale];
        values.extend_from_slice(&gamma.covariance);
        statistics.push(("hetgamma", StatValue::Vector(values)));
    }
    if let Some(typical) = typical_variance(s) {
        statistics.push(("hettypical", StatValue::Scalar(typical)));
    }
    if let Some(i2) = mom_i2(&y_norm, z, &s_norm) {
        statistics.push(("heti2", StatValue::Scalar(i2)));
    }
    statistics.push(("hetpseudor2", StatValue::Scalar(pseudo_r2)));
    statistics.push(("hetchisq", StatValue::Scalar(chisq)));

    Ok(statistics)
}

/// Heterogeneity statistics for one voxel
pub fn voxel_calc(data: &VoxelData) -> VoxelOutcome {
    let data = prepare(data);
    if data.n_subjects() < data.n_regressors() + 1 {
        return VoxelOutcome::Skipped(SkipReason::InsufficientData);
    }
    match het_on_voxel(&data.y, &data.z, &data.s) {
        Ok(statistics) => VoxelOutcome::Model(statistics),
        Err(reason) => VoxelOutcome::Skipped(reason),
    }
}
