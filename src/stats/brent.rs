//! Scalar minimization by downhill bracketing followed by Brent's method
//!
//! The bracketing search expands from an initial pair of points using
//! golden-ratio steps and parabolic extrapolation until the middle point is
//! lower than both ends. Brent's method then refines the minimum inside the
//! bracket by combining golden-section steps and parabolic interpolation.

/// Golden ratio used to grow the bracket
const GOLD: f64 = 1.618034;

/// Guard against a vanishing parabolic denominator
const VERY_SMALL: f64 = 1e-21;

/// Absolute part of the Brent convergence tolerance
const MIN_TOL: f64 = 1.0e-11;

/// Golden-section fraction (3 - √5) / 2
const CGOLD: f64 = 0.3819660;

/// Parameters of the bracket and Brent searches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentParams {
    /// Starting points of the bracket search
    pub start: (f64, f64),
    /// Maximum parabolic extrapolation, in multiples of the current step
    pub grow_limit: f64,
    /// Maximum bracket expansion steps
    pub bracket_max_iter: usize,
    /// Relative tolerance on the abscissa
    pub tol: f64,
    /// Maximum Brent iterations
    pub max_iter: usize,
}

impl Default for BrentParams {
    fn default() -> Self {
        Self {
            start: (0.0, 1.0),
            grow_limit: 110.0,
            bracket_max_iter: 1000,
            tol: 1.48e-8,
            max_iter: 500,
        }
    }
}

/// Three points with `f(b) <= f(a)` and `f(b) <= f(c)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub fa: f64,
    pub fb: f64,
    pub fc: f64,
    pub function_calls: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrentResult {
    pub x: f64,
    pub fun: f64,
    pub iterations: usize,
    pub function_calls: usize,
    /// False if the iteration limit was hit before the tolerance was met
    pub converged: bool,
}

/// Search downhill from two starting points for a bracketing triple
///
/// # Returns
/// The bracket, or `None` if the expansion limit is exceeded or the
/// function produced NaN
pub fn bracket<F>(f: &mut F, params: &BrentParams) -> Option<Bracket>
where
    F: FnMut(f64) -> f64,
{
    let (mut xa, mut xb) = params.start;
    let mut fa = f(xa);
    let mut fb = f(xb);
    if fa < fb {
        std::mem::swap(&mut xa, &mut xb);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut xc = xb + GOLD * (xb - xa);
    let mut fc = f(xc);
    let mut calls = 3;
    let mut iter = 0;

    while fc < fb {
        let tmp1 = (xb - xa) * (fb - fc);
        let tmp2 = (xb - xc) * (fb - fa);
        let val = tmp2 - tmp1;
        let denom = if val.abs() < VERY_SMALL {
            2.0 * VERY_SMALL
        } else {
            2.0 * val
        };
        let mut w = xb - ((xb - xc) * tmp2 - (xb - xa) * tmp1) / denom;
        let wlim = xb + params.grow_limit * (xc - xb);
        if iter > params.bracket_max_iter {
            return None;
        }
        iter += 1;

        let mut fw;
        if (w - xc) * (xb - w) > 0.0 {
            // parabolic minimum between b and c
            fw = f(w);
            calls += 1;
            if fw < fc {
                xa = xb;
                xb = w;
                fa = fb;
                fb = fw;
                break;
            } else if fw > fb {
                xc = w;
                fc = fw;
                break;
            }
            w = xc + GOLD * (xc - xb);
            fw = f(w);
            calls += 1;
        } else if (w - wlim) * (wlim - xc) >= 0.0 {
            w = wlim;
            fw = f(w);
            calls += 1;
        } else if (w - wlim) * (xc - w) > 0.0 {
            fw = f(w);
            calls += 1;
            if fw < fc {
                xb = xc;
                xc = w;
                w = xc + GOLD * (xc - xb);
                fb = fc;
                fc = fw;
                fw = f(w);
                calls += 1;
            }
        } else {
            w = xc + GOLD * (xc - xb);
            fw = f(w);
            calls += 1;
        }
        xa = xb;
        xb = xc;
        xc = w;
        fa = fb;
        fb = fc;
        fc = fw;
    }

    if fa.is_nan() || fb.is_nan() || fc.is_nan() {
        return None;
    }

    Some(Bracket {
        a: xa,
        b: xb,
        c: xc,
        fa,
        fb,
        fc,
        function_calls: calls,
    })
}

/// Minimize a scalar function with Brent's method inside a bracket
pub fn brent_in_bracket<F>(f: &mut F, bracket: &Bracket, params: &BrentParams) -> BrentResult
where
    F: FnMut(f64) -> f64,
{
    let mut x = bracket.b;
    let mut w = x;
    let mut v = x;
    let mut fx = bracket.fb;
    let mut fw = fx;
    let mut fv = fx;
    let (mut a, mut b) = if bracket.a < bracket.c {
        (bracket.a, bracket.c)
    } else {
        (bracket.c, bracket.a)
    };

    let mut deltax: f64 = 0.0;
    let mut rat: f64 = 0.0;
    let mut calls = bracket.function_calls;
    let mut iter = 0;
    let mut converged = false;

    while iter < params.max_iter {
        let tol1 = params.tol * x.abs() + MIN_TOL;
        let tol2 = 2.0 * tol1;
        let xmid = 0.5 * (a + b);
        if (x - xmid).abs() < tol2 - 0.5 * (b - a) {
            converged = true;
            break;
        }

        if deltax.abs() <= tol1 {
            // golden-section step
            deltax = if x >= xmid { a - x } else { b - x };
            rat = CGOLD * deltax;
        } else {
            // parabolic step
            let tmp1 = (x - w) * (fx - fv);
            let mut tmp2 = (x - v) * (fx - fw);
            let mut p = (x - v) * tmp2 - (x - w) * tmp1;
            tmp2 = 2.0 * (tmp2 - tmp1);
            if tmp2 > 0.0 {
                p = -p;
            }
            tmp2 = tmp2.abs();
            let dx_temp = deltax;
            deltax = rat;

            if p > tmp2 * (a - x) && p < tmp2 * (b - x) && p.abs() < (0.5 * tmp2 * dx_temp).abs() {
                rat = p / tmp2;
                let u = x + rat;
                if (u - a) < tol2 || (b - u) < tol2 {
                    rat = if xmid - x >= 0.0 { tol1 } else { -tol1 };
                }
            } else {
                deltax = if x >= xmid { a - x } else { b - x };
                rat = CGOLD * deltax;
            }
        }

        let u = if rat.abs() < tol1 {
            if rat >= 0.0 {
                x + tol1
            } else {
                x - tol1
            }
        } else {
            x + rat
        };
        let fu = f(u);
        calls += 1;

        if fu > fx {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        } else {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        }
        iter += 1;
    }

    BrentResult {
        x,
        fun: fx,
        iterations: iter,
        function_calls: calls,
        converged,
    }
}

/// Bracket and minimize a scalar function
///
/// # Arguments
/// * `f` - Objective, may return a large sentinel for infeasible points
/// * `params` - Search parameters
///
/// # Returns
/// The minimum found, or `None` if no bracket could be established
pub fn minimize_scalar<F>(mut f: F, params: &BrentParams) -> Option<BrentResult>
where
    F: FnMut(f64) -> f64,
{
    let bracket = bracket(&mut f, params)?;
    Some(brent_in_bracket(&mut f, &bracket, params))
}
