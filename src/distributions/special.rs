//! Special functions at arbitrary precision
//!
//! Degrees of freedom of the t, F and χ² distributions enter the incomplete
//! beta and gamma functions as halves of integers, so all shape parameters
//! here are passed as `twice_a = 2a` and the complete gamma function is
//! evaluated exactly from factorials.

use crate::distributions::bigfloat::{factorial, BigFloat, Context};
use crate::error::{Error, Result};

/// Newton steps of the normal quantile; the double-precision start leaves
/// only a few quadratic steps at any precision
const NEWTON_MAX_ITER: usize = 64;

/// Γ(twice / 2) for a positive integer `twice`
///
/// Γ(n) = (n-1)! and Γ(m + 1/2) = (2m)! √π / (4^m m!)
pub fn gamma_half_integer(twice: u64, ctx: &Context) -> Result<BigFloat> {
    if twice == 0 {
        return Err(Error::PrecisionDomain("gamma function pole at zero"));
    }
    if twice % 2 == 0 {
        return Ok(BigFloat::from_biguint(factorial(twice / 2 - 1)));
    }
    let m = (twice - 1) / 2;
    let ratio = (m + 1..=2 * m).fold(num_bigint::BigUint::from(1u32), |acc, k| acc * k);
    let sqrt_pi = ctx.pi().sqrt(ctx)?;
    Ok(BigFloat::from_biguint(ratio)
        .mul_pow2(-2 * m as i64)
        .mul(&sqrt_pi, ctx))
}

/// B(a, b) = Γ(a)Γ(b)/Γ(a+b)
pub fn beta_half_integer(twice_a: u64, twice_b: u64, ctx: &Context) -> Result<BigFloat> {
    let ga = gamma_half_integer(twice_a, ctx)?;
    let gb = gamma_half_integer(twice_b, ctx)?;
    let gab = gamma_half_integer(twice_a + twice_b, ctx)?;
    ga.mul(&gb, ctx).div(&gab, ctx)
}

fn half(twice: u64) -> BigFloat {
    BigFloat::from_i64(twice as i64).mul_pow2(-1)
}

fn floor_tiny(x: BigFloat, ctx: &Context) -> BigFloat {
    let tiny_log2 = -4 * ctx.bits() as i64;
    if x.is_below(tiny_log2) {
        BigFloat::one().mul_pow2(tiny_log2)
    } else {
        x
    }
}

fn iteration_limit(ctx: &Context) -> usize {
    8 * ctx.bits() as usize + 10_000
}

/// Continued fraction for the incomplete beta function (modified Lentz)
fn beta_continued_fraction(twice_a: u64, twice_b: u64, x: &BigFloat, ctx: &Context) -> Result<BigFloat> {
    let one = BigFloat::one();
    let a = half(twice_a);
    let b = half(twice_b);
    let qab = a.add(&b, ctx);
    let qap = a.add(&one, ctx);
    let qam = a.sub(&one, ctx);
    let stop = ctx.series_tolerance_log2();

    let mut c = one.clone();
    let mut d = one.sub(&qab.mul(x, ctx).div(&qap, ctx)?, ctx);
    d = floor_tiny(d, ctx).recip(ctx)?;
    let mut h = d.clone();

    for m in 1..=iteration_limit(ctx) as i64 {
        let mf = BigFloat::from_i64(m);
        let m2 = BigFloat::from_i64(2 * m);

        // even step
        let num = mf.mul(&b.sub(&mf, ctx), ctx).mul(x, ctx);
        let den = qam.add(&m2, ctx).mul(&a.add(&m2, ctx), ctx);
        let aa = num.div(&den, ctx)?;
        d = floor_tiny(one.add(&aa.mul(&d, ctx), ctx), ctx).recip(ctx)?;
        c = floor_tiny(one.add(&aa.div(&c, ctx)?, ctx), ctx);
        h = h.mul(&d.mul(&c, ctx), ctx);

        // odd step
        let num = a.add(&mf, ctx).mul(&qab.add(&mf, ctx), ctx).mul(x, ctx).neg();
        let den = a.add(&m2, ctx).mul(&qap.add(&m2, ctx), ctx);
        let aa = num.div(&den, ctx)?;
        d = floor_tiny(one.add(&aa.mul(&d, ctx), ctx), ctx).recip(ctx)?;
        c = floor_tiny(one.add(&aa.div(&c, ctx)?, ctx), ctx);
        let del = d.mul(&c, ctx);
        h = h.mul(&del, ctx);

        if del.sub(&one, ctx).is_below(stop) {
            return Ok(h);
        }
    }
    Err(Error::SeriesNonConvergence("incomplete beta continued fraction"))
}

/// Both tails of the regularized incomplete beta function
///
/// `x` and `one_minus_x` are passed separately so that neither tail loses
/// precision to cancellation.
///
/// # Returns
/// `(I_x(a, b), 1 - I_x(a, b))`
pub fn beta_inc_tails(
    twice_a: u64,
    twice_b: u64,
    x: &BigFloat,
    one_minus_x: &BigFloat,
    ctx: &Context,
) -> Result<(BigFloat, BigFloat)> {
    if x.is_negative() || one_minus_x.is_negative() {
        return Err(Error::PrecisionDomain("incomplete beta argument outside [0, 1]"));
    }
    if x.is_zero() {
        return Ok((BigFloat::zero(), BigFloat::one()));
    }
    if one_minus_x.is_zero() {
        return Ok((BigFloat::one(), BigFloat::zero()));
    }

    let beta = beta_half_integer(twice_a, twice_b, ctx)?;
    let front = x
        .pow_half(twice_a, ctx)?
        .mul(&one_minus_x.pow_half(twice_b, ctx)?, ctx)
        .div(&beta, ctx)?;

    let (a, b) = (twice_a as f64 / 2.0, twice_b as f64 / 2.0);
    let one = BigFloat::one();
    if x.to_f64() < (a + 1.0) / (a + b + 2.0) {
        let lower = front
            .mul(&beta_continued_fraction(twice_a, twice_b, x, ctx)?, ctx)
            .div(&half(twice_a), ctx)?;
        let upper = one.sub(&lower, ctx);
        Ok((lower, upper))
    } else {
        let upper = front
            .mul(&beta_continued_fraction(twice_b, twice_a, one_minus_x, ctx)?, ctx)
            .div(&half(twice_b), ctx)?;
        let lower = one.sub(&upper, ctx);
        Ok((lower, upper))
    }
}

/// Both tails of the regularized incomplete gamma function
///
/// # Returns
/// `(P(a, x), Q(a, x))`
pub fn gamma_inc_tails(twice_a: u64, x: &BigFloat, ctx: &Context) -> Result<(BigFloat, BigFloat)> {
    if x.is_negative() {
        return Err(Error::PrecisionDomain("incomplete gamma argument below zero"));
    }
    if x.is_zero() {
        return Ok((BigFloat::zero(), BigFloat::one()));
    }

    let one = BigFloat::one();
    let a = half(twice_a);
    let front = x
        .neg()
        .exp(ctx)?
        .mul(&x.pow_half(twice_a, ctx)?, ctx)
        .div(&gamma_half_integer(twice_a, ctx)?, ctx)?;
    let stop = ctx.series_tolerance_log2();

    if x.to_f64() < twice_a as f64 / 2.0 + 1.0 {
        // series
        let mut ap = a.clone();
        let mut del = a.recip(ctx)?;
        let mut sum = del.clone();
        for _ in 0..iteration_limit(ctx) {
            ap = ap.add(&one, ctx);
            del = del.mul(x, ctx).div(&ap, ctx)?;
            sum = sum.add(&del, ctx);
            let scale = sum.magnitude().unwrap_or(0);
            if del.is_below(scale + stop) {
                let lower = sum.mul(&front, ctx);
                let upper = one.sub(&lower, ctx);
                return Ok((lower, upper));
            }
        }
        Err(Error::SeriesNonConvergence("incomplete gamma series"))
    } else {
        // continued fraction (modified Lentz)
        let two = BigFloat::from_i64(2);
        let mut b = x.add(&one, ctx).sub(&a, ctx);
        let mut c = BigFloat::one().mul_pow2(4 * ctx.bits() as i64);
        let mut d = b.recip(ctx)?;
        let mut h = d.clone();
        for i in 1..=iteration_limit(ctx) as i64 {
            let fi = BigFloat::from_i64(i);
            let an = fi.mul(&fi.sub(&a, ctx), ctx).neg();
            b = b.add(&two, ctx);
            d = floor_tiny(an.mul(&d, ctx).add(&b, ctx), ctx).recip(ctx)?;
            c = floor_tiny(b.add(&an.div(&c, ctx)?, ctx), ctx);
            let del = d.mul(&c, ctx);
            h = h.mul(&del, ctx);
            if del.sub(&one, ctx).is_below(stop) {
                let upper = front.mul(&h, ctx);
                let lower = one.sub(&upper, ctx);
                return Ok((lower, upper));
            }
        }
        Err(Error::SeriesNonConvergence("incomplete gamma continued fraction"))
    }
}

/// Standard normal upper tail P(Z > z)
pub fn normal_upper_tail(z: &BigFloat, ctx: &Context) -> Result<BigFloat> {
    if z.is_negative() {
        let lower = normal_upper_tail(&z.neg(), ctx)?;
        return Ok(BigFloat::one().sub(&lower, ctx));
    }
    // P(Z > z) = Q(1/2, z²/2) / 2
    let x = z.mul(z, ctx).mul_pow2(-1);
    let (_, q) = gamma_inc_tails(1, &x, ctx)?;
    Ok(q.mul_pow2(-1))
}

/// z >= 0 such that P(Z > z) = p, for 0 < p <= 1/2
///
/// Newton iterations on log P(Z > z), started from the double-precision
/// quantile of `log p`.
pub fn normal_upper_quantile(p: &BigFloat, ctx: &Context) -> Result<BigFloat> {
    if p.is_zero() || p.is_negative() {
        return Err(Error::PrecisionDomain("normal quantile of a non-positive probability"));
    }
    let log_p = p.ln(ctx)?;
    let start = super::fast::normal_quantile_log(log_p.to_f64(), false);
    let mut z = BigFloat::from_f64(start.max(0.0))
        .ok_or(Error::PrecisionDomain("normal quantile start is not finite"))?;

    // 1/√(2π)
    let inv_sqrt_2pi = ctx.pi().mul_pow2(1).sqrt(ctx)?.recip(ctx)?;
    let stop = ctx.newton_tolerance_log2();

    for _ in 0..NEWTON_MAX_ITER {
        let q = normal_upper_tail(&z, ctx)?;
        let g = q.ln(ctx)?.sub(&log_p, ctx);
        let density = z.mul(&z, ctx).mul_pow2(-1).neg().exp(ctx)?.mul(&inv_sqrt_2pi, ctx);
        let step = g.mul(&q, ctx).div(&density, ctx)?;
        z = z.add(&step, ctx);

        let scale = z.magnitude().unwrap_or(0).max(0);
        if step.is_below(scale + stop) {
            return Ok(z);
        }
    }
    Err(Error::SeriesNonConvergence("normal quantile Newton iteration"))
}
