//! Test whether missing observations are predicted by the design
//!
//! A logistic regression of the per-subject missingness indicator on the
//! demeaned design is compared with the intercept-only model. Under
//! missingness completely at random the likelihood ratio is χ² distributed
//! with one degree of freedom per non-intercept regressor.

use nalgebra::{DMatrix, DVector};

use super::prepare::{available, demean, fill_missing, VoxelData};
use super::{SkipReason, StatValue, VoxelOutcome};
use crate::distributions::ZMethod;
use crate::error::Result;
use crate::linalg::lstsq_vec;

/// Iteration settings of the logistic regression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrlsConfig {
    pub max_iter: usize,
    /// Convergence tolerance on the relative deviance change
    pub tol: f64,
    /// Linear predictor magnitude treated as perfect separation
    pub eta_limit: f64,
    /// Distance of a fitted probability from 0 or 1 treated as perfect separation
    pub prob_eps: f64,
}

impl Default for IrlsConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-10,
            eta_limit: 100.0,
            prob_eps: 1e-10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogitFit {
    pub params: DVector<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

const MAX_HALVINGS: usize = 30;
const MIN_WEIGHT: f64 = 1e-10;

/// log(1 + e^x) without overflow
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// Bernoulli log-likelihood of a linear predictor
fn log_likelihood(response: &DVector<f64>, eta: &DVector<f64>) -> f64 {
    response
        .iter()
        .zip(eta.iter())
        .map(|(&r, &e)| r * -softplus(-e) + (1.0 - r) * -softplus(e))
        .sum()
}

/// Maximum likelihood logistic regression by iteratively reweighted least squares
pub fn fit_logit(
    response: &DVector<f64>,
    x: &DMatrix<f64>,
    config: &IrlsConfig,
) -> std::result::Result<LogitFit, SkipReason> {
    let mut params = DVector::zeros(x.ncols());
    let mut eta = x * &params;
    let mut ll = log_likelihood(response, &eta);

    for iter in 1..=config.max_iter {
        let mu = eta.map(sigmoid);
        let weights = mu.map(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
        let working = DVector::from_fn(eta.len(), |i, _| eta[i] + (response[i] - mu[i]) / weights[i]);

        // XᵀWX b = XᵀW z
        let mut xtw = x.transpose();
        for (mut column, &w) in xtw.column_iter_mut().zip(weights.iter()) {
            column.scale_mut(w);
        }
        let proposal = lstsq_vec(&(&xtw * x), &(&xtw * working)).ok_or(SkipReason::Singular)?;

        let mut step = &proposal - &params;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = &params + &step;
            let eta_candidate = x * &candidate;
            let ll_candidate = log_likelihood(response, &eta_candidate);
            if ll_candidate.is_finite() && ll_candidate >= ll - config.tol * ll.abs() {
                accepted = Some((candidate, eta_candidate, ll_candidate));
                break;
            }
            step *= 0.5;
        }
        let Some((candidate, eta_candidate, ll_candidate)) = accepted else {
            return Err(SkipReason::NonConvergence);
        };

        let change = (ll_candidate - ll).abs();
        params = candidate;
        eta = eta_candidate;
        ll = ll_candidate;

        let max_abs_eta = eta.iter().map(|v| v.abs()).fold(0.0, f64::max);
        if max_abs_eta > config.eta_limit {
            return Err(SkipReason::PerfectSeparation);
        }

        // deviance is -2 ll
        if 2.0 * change <= config.tol * (2.0 * ll.abs() + 0.1) {
            let separated = eta
                .iter()
                .map(|&e| sigmoid(e))
                .any(|m| m < config.prob_eps || m > 1.0 - config.prob_eps);
            if separated {
                return Err(SkipReason::PerfectSeparation);
            }
            return Ok(LogitFit {
                params,
                log_likelihood: ll,
                iterations: iter,
            });
        }
    }

    Err(SkipReason::NonConvergence)
}

/// Log-likelihood of the intercept-only model
pub fn null_log_likelihood(response: &DVector<f64>) -> f64 {
    let n = response.len() as f64;
    let p = response.mean();
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    n * (p * p.ln() + (1.0 - p) * (1.0 - p).ln())
}

/// Missingness test for one voxel
pub fn voxel_calc(data: &VoxelData, z_method: ZMethod) -> Result<VoxelOutcome> {
    let filled = fill_missing(data);
    let keep = available(&filled.y, &filled.s);
    let response = DVector::from_iterator(keep.len(), keep.iter().map(|&k| if k { 0.0 } else { 1.0 }));

    let n_missing = keep.iter().filter(|&&k| !k).count();
    if n_missing == 0 || n_missing == keep.len() {
        return Ok(VoxelOutcome::Skipped(SkipReason::ConstantResponse));
    }

    let x = demean(&filled.z);
    let dof = x.ncols().saturating_sub(1);
    if dof == 0 {
        return Ok(VoxelOutcome::Skipped(SkipReason::InsufficientData));
    }

    let fit = match fit_logit(&response, &x, &IrlsConfig::default()) {
        Ok(fit) => fit,
        Err(reason) => return Ok(VoxelOutcome::Skipped(reason)),
    };

    let chisq = (2.0 * (fit.log_likelihood - null_log_likelihood(&response))).max(0.0);
    let zstat = z_method.chisq2z(chisq, dof as f64)?;

    Ok(VoxelOutcome::Model(vec![
        ("mcarchisq", StatValue::Scalar(chisq)),
        ("mcardof", StatValue::Scalar(dof as f64)),
        ("mcarzstat", StatValue::Scalar(zstat)),
    ]))
}
