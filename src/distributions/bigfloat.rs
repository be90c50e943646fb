//! Binary arbitrary-precision floating point
//!
//! A value is `mant · 2^exp` with a signed big-integer mantissa. Every
//! rounding operation truncates the mantissa to the working precision of a
//! [`Context`], so the same code runs at 32 or 65536 decimal digits.

use std::cmp::Ordering;

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::error::{Error, Result};

/// log2(10), used to turn decimal digits into mantissa bits
const LOG2_10: f64 = 3.321_928_094_887_362_3;

/// Extra mantissa bits carried beyond the requested decimal precision
///
/// Iterative refinements stop a fraction of these bits above the working
/// precision, where truncation noise of the arithmetic cannot reach.
const GUARD_BITS: u64 = 64;

/// Working precision plus the constants that depend on it
#[derive(Debug, Clone)]
pub struct Context {
    digits: u32,
    bits: u64,
    ln2: BigFloat,
    pi: BigFloat,
}

impl Context {
    /// Build a context for the given number of decimal digits
    pub fn with_digits(digits: u32) -> Result<Self> {
        let bits = (digits.max(1) as f64 * LOG2_10).ceil() as u64 + GUARD_BITS;
        let mut ctx = Self {
            digits,
            bits,
            ln2: BigFloat::zero(),
            pi: BigFloat::zero(),
        };

        // ln 2 = 2 atanh(1/3)
        let third = BigFloat::one().div(&BigFloat::from_i64(3), &ctx)?;
        ctx.ln2 = atanh_series(&third, &ctx)?.mul_pow2(1);

        // Machin: π = 16 atan(1/5) − 4 atan(1/239)
        let a5 = atan_recip(5, &ctx)?.mul_pow2(4);
        let a239 = atan_recip(239, &ctx)?.mul_pow2(2);
        ctx.pi = a5.sub(&a239, &ctx);

        Ok(ctx)
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    /// Mantissa bits kept by rounding operations
    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn ln2(&self) -> &BigFloat {
        &self.ln2
    }

    pub fn pi(&self) -> &BigFloat {
        &self.pi
    }

    /// log2 of the relative tolerance used to stop Taylor series
    pub(crate) fn stop_log2(&self) -> i64 {
        -(self.bits as i64) - 4
    }

    /// log2 of the relative tolerance of continued fractions and
    /// special-function series
    pub(crate) fn series_tolerance_log2(&self) -> i64 {
        -(self.bits as i64) + GUARD_BITS as i64 / 4
    }

    /// log2 of the relative step size that ends a Newton iteration
    pub(crate) fn newton_tolerance_log2(&self) -> i64 {
        -(self.bits as i64) + GUARD_BITS as i64 / 2
    }
}

/// Arbitrary-precision binary floating-point number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigFloat {
    mant: BigInt,
    exp: i64,
}

impl BigFloat {
    pub fn zero() -> Self {
        Self {
            mant: BigInt::zero(),
            exp: 0,
        }
    }

    pub fn one() -> Self {
        Self::from_i64(1)
    }

    pub fn from_i64(value: i64) -> Self {
        Self {
            mant: BigInt::from(value),
            exp: 0,
        }
        .trimmed()
    }

    pub fn from_biguint(value: BigUint) -> Self {
        Self {
            mant: BigInt::from_biguint(Sign::Plus, value),
            exp: 0,
        }
        .trimmed()
    }

    /// Exact conversion of a finite double; `None` for NaN and infinities
    pub fn from_f64(x: f64) -> Option<Self> {
        if !x.is_finite() {
            return None;
        }
        if x == 0.0 {
            return Some(Self::zero());
        }

        let bits = x.to_bits();
        let negative = (bits >> 63) != 0;
        let biased = ((bits >> 52) & 0x7ff) as i64;
        let fraction = bits & 0x000f_ffff_ffff_ffff;
        let (mantissa, exp) = if biased == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1u64 << 52), biased - 1075)
        };

        let mut mant = BigInt::from(mantissa);
        if negative {
            mant = -mant;
        }
        Some(Self { mant, exp }.trimmed())
    }

    /// Nearest double (up to truncation of the low mantissa bits)
    pub fn to_f64(&self) -> f64 {
        if self.mant.is_zero() {
            return 0.0;
        }
        let bits = self.mant.bits();
        let (mant, exp) = if bits > 62 {
            let shift = bits - 62;
            (&self.mant >> shift, self.exp + shift as i64)
        } else {
            (self.mant.clone(), self.exp)
        };
        let m = mant.to_i64().map(|v| v as f64).unwrap_or(f64::NAN);
        ldexp(m, exp)
    }

    pub fn is_zero(&self) -> bool {
        self.mant.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.mant.is_negative()
    }

    pub fn abs(&self) -> Self {
        Self {
            mant: self.mant.abs(),
            exp: self.exp,
        }
    }

    pub fn neg(&self) -> Self {
        Self {
            mant: -&self.mant,
            exp: self.exp,
        }
    }

    /// Multiply by 2^k (exact)
    pub fn mul_pow2(&self, k: i64) -> Self {
        Self {
            mant: self.mant.clone(),
            exp: self.exp + k,
        }
    }

    /// Position of the leading bit: |x| lies in [2^(m-1), 2^m). `None` for zero.
    pub fn magnitude(&self) -> Option<i64> {
        if self.mant.is_zero() {
            None
        } else {
            Some(self.exp + self.mant.bits() as i64)
        }
    }

    /// True if the value is zero or below 2^bound in magnitude
    pub fn is_below(&self, bound: i64) -> bool {
        self.magnitude().map_or(true, |m| m < bound)
    }

    fn trimmed(mut self) -> Self {
        match self.mant.trailing_zeros() {
            Some(tz) if tz > 0 => {
                self.mant >>= tz;
                self.exp += tz as i64;
                self
            }
            Some(_) => self,
            None => Self::zero(),
        }
    }

    fn rounded(mut self, ctx: &Context) -> Self {
        let bits = self.mant.bits();
        if bits > ctx.bits {
            let shift = bits - ctx.bits;
            self.mant >>= shift;
            self.exp += shift as i64;
        }
        self.trimmed()
    }

    pub fn add(&self, other: &Self, ctx: &Context) -> Self {
        let (Some(ma), Some(mb)) = (self.magnitude(), other.magnitude()) else {
            let nonzero = if self.is_zero() { other } else { self };
            return nonzero.clone().rounded(ctx);
        };

        // The smaller operand cannot reach the working precision of the larger
        let reach = ctx.bits as i64 + 2;
        if mb < ma - reach {
            return self.clone().rounded(ctx);
        }
        if ma < mb - reach {
            return other.clone().rounded(ctx);
        }

        let exp = self.exp.min(other.exp);
        let a = &self.mant << (self.exp - exp) as u64;
        let b = &other.mant << (other.exp - exp) as u64;
        Self { mant: a + b, exp }.rounded(ctx)
    }

    pub fn sub(&self, other: &Self, ctx: &Context) -> Self {
        self.add(&other.neg(), ctx)
    }

    pub fn mul(&self, other: &Self, ctx: &Context) -> Self {
        Self {
            mant: &self.mant * &other.mant,
            exp: self.exp + other.exp,
        }
        .rounded(ctx)
    }

    pub fn mul_i64(&self, k: i64, ctx: &Context) -> Self {
        Self {
            mant: &self.mant * BigInt::from(k),
            exp: self.exp,
        }
        .rounded(ctx)
    }

    pub fn div(&self, other: &Self, ctx: &Context) -> Result<Self> {
        if other.is_zero() {
            return Err(Error::DivisionByZero);
        }
        if self.is_zero() {
            return Ok(Self::zero());
        }
        let shift = (ctx.bits as i64 + other.mant.bits() as i64 - self.mant.bits() as i64 + 2).max(0);
        let num = &self.mant << shift as u64;
        Ok(Self {
            mant: num / &other.mant,
            exp: self.exp - shift - other.exp,
        }
        .rounded(ctx))
    }

    pub fn div_i64(&self, k: i64, ctx: &Context) -> Result<Self> {
        self.div(&Self::from_i64(k), ctx)
    }

    pub fn recip(&self, ctx: &Context) -> Result<Self> {
        Self::one().div(self, ctx)
    }

    pub fn sqrt(&self, ctx: &Context) -> Result<Self> {
        if self.is_negative() {
            return Err(Error::PrecisionDomain("square root of a negative number"));
        }
        if self.is_zero() {
            return Ok(Self::zero());
        }
        let mut shift = (2 * ctx.bits as i64 + 2 - self.mant.bits() as i64).max(0);
        if (self.exp - shift) % 2 != 0 {
            shift += 1;
        }
        let scaled = self.mant.magnitude() << shift as u64;
        Ok(Self {
            mant: BigInt::from_biguint(Sign::Plus, scaled.sqrt()),
            exp: (self.exp - shift) / 2,
        }
        .rounded(ctx))
    }

    /// Integer power by repeated squaring
    pub fn powi(&self, n: u64, ctx: &Context) -> Self {
        let mut result = Self::one();
        let mut base = self.clone();
        let mut n = n;
        while n > 0 {
            if n & 1 == 1 {
                result = result.mul(&base, ctx);
            }
            n >>= 1;
            if n > 0 {
                base = base.mul(&base, ctx);
            }
        }
        result
    }

    /// x^(twice/2) for x >= 0
    pub fn pow_half(&self, twice: u64, ctx: &Context) -> Result<Self> {
        let whole = self.powi(twice / 2, ctx);
        if twice % 2 == 1 {
            Ok(whole.mul(&self.sqrt(ctx)?, ctx))
        } else {
            Ok(whole)
        }
    }

    pub fn exp(&self, ctx: &Context) -> Result<Self> {
        if self.is_zero() {
            return Ok(Self::one());
        }
        let x = self.to_f64();
        if !x.is_finite() || x.abs() > 1e15 {
            return Err(Error::PrecisionDomain("exponent out of range"));
        }

        // x = k ln2 + r, |r| <= ln2/2, then r / 2^SQUARINGS for the series
        const SQUARINGS: i64 = 10;
        let k = (x / std::f64::consts::LN_2).round() as i64;
        let r = self.sub(&ctx.ln2.mul_i64(k, ctx), ctx).mul_pow2(-SQUARINGS);

        let stop = ctx.stop_log2();
        let mut sum = Self::one();
        let mut term = Self::one();
        for n in 1..=(ctx.bits as i64 + 16) {
            term = term.mul(&r, ctx).div_i64(n, ctx)?;
            if term.is_below(stop) {
                break;
            }
            sum = sum.add(&term, ctx);
        }
        for _ in 0..SQUARINGS {
            sum = sum.mul(&sum, ctx);
        }
        Ok(sum.mul_pow2(k))
    }

    pub fn ln(&self, ctx: &Context) -> Result<Self> {
        let Some(mut m) = self.magnitude().filter(|_| !self.is_negative()) else {
            return Err(Error::PrecisionDomain("logarithm of a non-positive number"));
        };

        // f in [1/√2, √2)
        let mut f = self.mul_pow2(-m);
        if f.to_f64() < std::f64::consts::FRAC_1_SQRT_2 {
            f = f.mul_pow2(1);
            m -= 1;
        }

        let one = Self::one();
        let t = f.sub(&one, ctx).div(&f.add(&one, ctx), ctx)?;
        let log_f = atanh_series(&t, ctx)?.mul_pow2(1);
        Ok(log_f.add(&ctx.ln2.mul_i64(m, ctx), ctx))
    }

    /// Numeric comparison
    pub fn cmp_value(&self, other: &Self) -> Ordering {
        let sa = self.mant.sign();
        let sb = other.mant.sign();
        if sa != sb {
            return sa.cmp(&sb);
        }
        let (Some(ma), Some(mb)) = (self.magnitude(), other.magnitude()) else {
            return Ordering::Equal;
        };
        if ma != mb {
            let by_magnitude = ma.cmp(&mb);
            return if sa == Sign::Minus { by_magnitude.reverse() } else { by_magnitude };
        }
        let exp = self.exp.min(other.exp);
        let a = &self.mant << (self.exp - exp) as u64;
        let b = &other.mant << (other.exp - exp) as u64;
        a.cmp(&b)
    }
}

/// atanh(t) = Σ t^(2k+1) / (2k+1), for |t| well below one
fn atanh_series(t: &BigFloat, ctx: &Context) -> Result<BigFloat> {
    let stop = ctx.stop_log2();
    let t2 = t.mul(t, ctx);
    let mut power = t.clone();
    let mut sum = t.clone();
    for k in 1..=(4 * ctx.bits as i64 + 16) {
        power = power.mul(&t2, ctx);
        let term = power.div_i64(2 * k + 1, ctx)?;
        if term.is_below(stop) {
            return Ok(sum);
        }
        sum = sum.add(&term, ctx);
    }
    Err(Error::SeriesNonConvergence("atanh series"))
}

/// atan(1/n) = Σ (-1)^k / ((2k+1) n^(2k+1))
fn atan_recip(n: i64, ctx: &Context) -> Result<BigFloat> {
    let stop = ctx.stop_log2();
    let inv_n = BigFloat::one().div_i64(n, ctx)?;
    let inv_n2 = inv_n.mul(&inv_n, ctx);
    let mut power = inv_n.clone();
    let mut sum = inv_n;
    for k in 1..=(ctx.bits as i64 + 16) {
        power = power.mul(&inv_n2, ctx);
        let term = power.div_i64(2 * k + 1, ctx)?;
        if term.is_below(stop) {
            return Ok(sum);
        }
        sum = if k % 2 == 1 { sum.sub(&term, ctx) } else { sum.add(&term, ctx) };
    }
    Err(Error::SeriesNonConvergence("arctangent series"))
}

/// x · 2^e without intermediate overflow of the power of two
fn ldexp(mut x: f64, mut e: i64) -> f64 {
    while e > 1000 {
        x *= 2f64.powi(1000);
        e -= 1000;
        if x.is_infinite() {
            return x;
        }
    }
    while e < -1000 {
        x *= 2f64.powi(-1000);
        e += 1000;
        if x == 0.0 {
            return x;
        }
    }
    x * 2f64.powi(e as i32)
}

/// n! as a big integer
pub(crate) fn factorial(n: u64) -> BigUint {
    (2..=n).fold(BigUint::one(), |acc, k| acc * k)
}
