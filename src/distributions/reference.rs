//! Adaptive-precision statistic to z conversion
//!
//! Each conversion is evaluated at a starting precision and re-evaluated at
//! twice the number of decimal digits until two successive results agree.
//! Failing to agree before the precision ceiling is a hard error: it would
//! otherwise corrupt a z value without any trace.
//!
//! The shape parameters of the incomplete beta and gamma functions are half
//! the degrees of freedom, so exact evaluation needs integer degrees of
//! freedom. Fractional degrees of freedom fall back to the [`fast`] path.
//!
//! [`fast`]: crate::distributions::fast

use std::sync::Once;

use log::warn;

use crate::distributions::bigfloat::{BigFloat, Context};
use crate::distributions::fast;
use crate::distributions::special::{beta_inc_tails, gamma_inc_tails, normal_upper_quantile};
use crate::error::{Error, Result};

static FRACTIONAL_DOF_WARNING: Once = Once::new();

/// Precision schedule of the reference conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceParams {
    /// Decimal digits of the first evaluation
    pub start_digits: u32,
    /// Largest precision that may be tried
    pub max_digits: u32,
    /// Two results a, b agree when |a - b| <= tolerance * max(1, |b|)
    pub tolerance: f64,
}

impl Default for ReferenceParams {
    fn default() -> Self {
        Self {
            start_digits: 32,
            max_digits: 65536,
            tolerance: 1e-13,
        }
    }
}

fn agree(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= tolerance * b.abs().max(1.0)
}

/// Twice the shape parameter `dof / 2`, i.e. the degrees of freedom as an integer
///
/// `None` for degrees of freedom without an exact half-integer shape.
fn twice_shape(dof: f64) -> Option<u64> {
    if dof >= 1.0 && dof.fract() == 0.0 && dof <= u32::MAX as f64 {
        Some(dof as u64)
    } else {
        FRACTIONAL_DOF_WARNING.call_once(|| {
            warn!(
                "Degrees of freedom {} are not an integer, using the double-precision z conversion",
                dof
            );
        });
        None
    }
}

fn converge<F>(statistic: f64, params: &ReferenceParams, eval: F) -> Result<f64>
where
    F: Fn(&Context) -> Result<f64>,
{
    let mut digits = params.start_digits.max(1);
    let mut previous = eval(&Context::with_digits(digits)?)?;
    loop {
        let next = digits.saturating_mul(2);
        if next > params.max_digits || next == digits {
            return Err(Error::ConversionNonConvergence {
                statistic,
                max_digits: params.max_digits,
            });
        }
        digits = next;
        let current = eval(&Context::with_digits(digits)?)?;
        if agree(previous, current, params.tolerance) {
            return Ok(current);
        }
        previous = current;
    }
}

/// z from the two tails of the statistic's distribution, using the smaller one
fn z_from_tails(lower: &BigFloat, upper: &BigFloat, ctx: &Context) -> Result<f64> {
    match upper.cmp_value(lower) {
        std::cmp::Ordering::Equal => Ok(0.0),
        std::cmp::Ordering::Less => Ok(normal_upper_quantile(upper, ctx)?.to_f64()),
        std::cmp::Ordering::Greater => Ok(-normal_upper_quantile(lower, ctx)?.to_f64()),
    }
}

fn exact(x: f64) -> Result<BigFloat> {
    BigFloat::from_f64(x).ok_or(Error::PrecisionDomain("statistic is not finite"))
}

/// t statistic to z with the default precision schedule
pub fn t2z(t: f64, dof: f64) -> Result<f64> {
    t2z_with(t, dof, &ReferenceParams::default())
}

/// t statistic to z
///
/// P(T > |t|) = I_x(ν/2, 1/2) / 2 with x = ν / (ν + t²).
pub fn t2z_with(t: f64, dof: f64, params: &ReferenceParams) -> Result<f64> {
    if t.is_nan() || !(dof > 0.0) || dof.is_infinite() {
        return Ok(f64::NAN);
    }
    if t == 0.0 {
        return Ok(0.0);
    }
    if t.is_infinite() {
        return Ok(t);
    }
    let Some(twice_a) = twice_shape(dof) else {
        return Ok(fast::t2z(t, dof));
    };

    converge(t, params, |ctx| {
        let t_abs = exact(t.abs())?;
        let t2 = t_abs.mul(&t_abs, ctx);
        let nu = exact(dof)?;
        let denom = nu.add(&t2, ctx);
        let x = nu.div(&denom, ctx)?;
        let one_minus_x = t2.div(&denom, ctx)?;

        let (incomplete, _) = beta_inc_tails(twice_a, 1, &x, &one_minus_x, ctx)?;
        let tail = incomplete.mul_pow2(-1);
        let z = normal_upper_quantile(&tail, ctx)?.to_f64();
        Ok(if t > 0.0 { z } else { -z })
    })
}

/// F statistic to z with the default precision schedule
pub fn f2z(f: f64, d1: f64, d2: f64) -> Result<f64> {
    f2z_with(f, d1, d2, &ReferenceParams::default())
}

/// F statistic to z
///
/// P(F <= f) = I_x(d1/2, d2/2) with x = d1 f / (d1 f + d2).
pub fn f2z_with(f: f64, d1: f64, d2: f64, params: &ReferenceParams) -> Result<f64> {
    if f.is_nan() || d1.is_nan() || d2.is_nan() {
        return Ok(f64::NAN);
    }
    if f <= 0.0 || d1 <= 0.0 || d2 <= 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if f.is_infinite() {
        return Ok(f64::INFINITY);
    }
    let (Some(twice_a), Some(twice_b)) = (twice_shape(d1), twice_shape(d2)) else {
        return Ok(fast::f2z(f, d1, d2));
    };

    converge(f, params, |ctx| {
        let d1f = exact(d1)?.mul(&exact(f)?, ctx);
        let d2b = exact(d2)?;
        let denom = d1f.add(&d2b, ctx);
        let x = d1f.div(&denom, ctx)?;
        let one_minus_x = d2b.div(&denom, ctx)?;

        let (lower, upper) = beta_inc_tails(twice_a, twice_b, &x, &one_minus_x, ctx)?;
        z_from_tails(&lower, &upper, ctx)
    })
}

/// Chi-square statistic to z with the default precision schedule
pub fn chisq2z(x: f64, k: f64) -> Result<f64> {
    chisq2z_with(x, k, &ReferenceParams::default())
}

/// Chi-square statistic to z
///
/// P(X <= x) = P(k/2, x/2), the regularized lower incomplete gamma function.
pub fn chisq2z_with(x: f64, k: f64, params: &ReferenceParams) -> Result<f64> {
    if x.is_nan() || k.is_nan() {
        return Ok(f64::NAN);
    }
    if x <= 0.0 || k <= 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if x.is_infinite() {
        return Ok(f64::INFINITY);
    }
    let Some(twice_a) = twice_shape(k) else {
        return Ok(fast::chisq2z(x, k));
    };

    converge(x, params, |ctx| {
        let half_x = exact(x)?.mul_pow2(-1);
        let (lower, upper) = gamma_inc_tails(twice_a, &half_x, ctx)?;
        z_from_tails(&lower, &upper, ctx)
    })
}
