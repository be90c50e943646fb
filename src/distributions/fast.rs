//! Double-precision statistic to z conversion
//!
//! Tail probabilities come from `statrs`. The smaller of the two tails is
//! taken and pushed through a log-space normal quantile, so extreme
//! statistics keep their precision instead of rounding to p = 1.

use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};
use statrs::function::gamma::ln_gamma;

/// sqrt(-log p) beyond which the AS241 tail fit is refined
const EXTREME_TAIL_R: f64 = 27.0;
/// Tail probabilities below this are recomputed in log space
const UNDERFLOW_TAIL: f64 = 1e-300;
const GAMMA_EPS: f64 = 1e-16;
const GAMMA_MAX_ITER: usize = 100_000;

/// t statistic with `dof` degrees of freedom to z
pub fn t2z(t: f64, dof: f64) -> f64 {
    if t.is_nan() || !(dof > 0.0) {
        return f64::NAN;
    }
    if t == 0.0 {
        return 0.0;
    }
    if t.is_infinite() {
        return t;
    }
    let Ok(dist) = StudentsT::new(0.0, 1.0, dof) else {
        return f64::NAN;
    };
    let z = normal_quantile_log(dist.sf(t.abs()).ln(), false);
    if t > 0.0 {
        z
    } else {
        -z
    }
}

/// F statistic with (`d1`, `d2`) degrees of freedom to z
pub fn f2z(f: f64, d1: f64, d2: f64) -> f64 {
    if f.is_nan() || d1.is_nan() || d2.is_nan() {
        return f64::NAN;
    }
    if f <= 0.0 || d1 <= 0.0 || d2 <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if f.is_infinite() {
        return f64::INFINITY;
    }
    let Ok(dist) = FisherSnedecor::new(d1, d2) else {
        return f64::NAN;
    };
    smaller_tail_to_z(dist.cdf(f), dist.sf(f))
}

/// Chi-square statistic with `k` degrees of freedom to z
pub fn chisq2z(x: f64, k: f64) -> f64 {
    if x.is_nan() || k.is_nan() {
        return f64::NAN;
    }
    if x <= 0.0 || k <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if x.is_infinite() {
        return f64::INFINITY;
    }
    let Ok(dist) = ChiSquared::new(k) else {
        return f64::NAN;
    };
    let (lower, upper) = (dist.cdf(x), dist.sf(x));
    if lower.min(upper) > UNDERFLOW_TAIL {
        return smaller_tail_to_z(lower, upper);
    }
    let (log_lower, log_upper) = chisq_log_tails(x, k);
    if log_upper < log_lower {
        normal_quantile_log(log_upper, false)
    } else {
        normal_quantile_log(log_lower, true)
    }
}

/// Log of both chi-square tails, through the incomplete gamma series below
/// the mode and its continued fraction above
fn chisq_log_tails(x: f64, k: f64) -> (f64, f64) {
    let a = 0.5 * k;
    let x = 0.5 * x;
    let log_front = -x + a * x.ln() - ln_gamma(a);

    if x < a + 1.0 {
        let mut ap = a;
        let mut del = 1.0 / a;
        let mut sum = del;
        for _ in 0..GAMMA_MAX_ITER {
            ap += 1.0;
            del *= x / ap;
            sum += del;
            if del.abs() < sum.abs() * GAMMA_EPS {
                break;
            }
        }
        let log_lower = log_front + sum.ln();
        return (log_lower, (-log_lower.exp()).ln_1p());
    }

    // modified Lentz
    let tiny = f64::MIN_POSITIVE / GAMMA_EPS;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=GAMMA_MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < GAMMA_EPS {
            break;
        }
    }
    let log_upper = log_front + h.ln();
    ((-log_upper.exp()).ln_1p(), log_upper)
}

fn smaller_tail_to_z(lower: f64, upper: f64) -> f64 {
    if upper < lower {
        normal_quantile_log(upper.ln(), false)
    } else {
        normal_quantile_log(lower.ln(), true)
    }
}

/// Standard normal quantile from a log probability (Wichura, AS241)
///
/// # Arguments
/// * `log_p` - Natural log of the tail probability
/// * `lower_tail` - If true `log_p` is log P(Z <= z), otherwise log P(Z > z)
///
/// # Returns
/// The z value, ±inf for log probabilities of 0 or -inf
pub fn normal_quantile_log(log_p: f64, lower_tail: bool) -> f64 {
    if log_p.is_nan() || log_p > 0.0 {
        return f64::NAN;
    }
    if log_p == 0.0 {
        return if lower_tail { f64::INFINITY } else { f64::NEG_INFINITY };
    }
    if log_p == f64::NEG_INFINITY {
        return if lower_tail { f64::NEG_INFINITY } else { f64::INFINITY };
    }

    // p_ is the lower tail probability
    let p_ = if lower_tail { log_p.exp() } else { -log_p.exp_m1() };
    let q = p_ - 0.5;

    if q.abs() <= 0.425 {
        let r = 0.180625 - q * q;
        return q * (((((((r * 2509.0809287301226727 + 33430.575583588128105) * r
            + 67265.770927008700853) * r
            + 45921.953931549871457) * r
            + 13731.693765509461125) * r
            + 1971.5909503065514427) * r
            + 133.14166789178437745) * r
            + 3.387132872796366608)
            / (((((((r * 5226.495278852545925 + 28729.085735721942674) * r
                + 39307.89580009271061) * r
                + 21213.794301586595867) * r
                + 5394.1960214247511077) * r
                + 687.1870074920579083) * r
                + 42.313330701600911252) * r
                + 1.0);
    }

    // log of the smaller tail
    let log_tail = if (lower_tail && q <= 0.0) || (!lower_tail && q > 0.0) {
        log_p
    } else {
        (-log_p.exp_m1()).ln()
    };
    let r = (-log_tail).sqrt();

    let val = if r <= 5.0 {
        let r = r - 1.6;
        (((((((r * 7.7454501427834140764e-4 + 0.0227238449892691845833) * r
            + 0.24178072517745061177) * r
            + 1.27045825245236838258) * r
            + 3.64784832476320460504) * r
            + 5.7694972214606914055) * r
            + 4.6303378461565452959) * r
            + 1.42343711074968357734)
            / (((((((r * 1.05075007164441684324e-9 + 5.475938084995344946e-4) * r
                + 0.0151986665636164571966) * r
                + 0.14810397642748007459) * r
                + 0.68976733498510000455) * r
                + 1.6763848301838038494) * r
                + 2.05319162663775882187) * r
                + 1.0)
    } else if r >= 816.0 {
        refine_extreme_tail(r * std::f64::consts::SQRT_2, log_tail)
    } else if r > EXTREME_TAIL_R {
        let r = r - 5.0;
        refine_extreme_tail(
            (((((((r * 2.01033439929228813265e-7 + 2.71155556874348757815e-5) * r
                + 0.0012426609473880784386) * r
                + 0.026532189526576123093) * r
                + 0.29656057182850489123) * r
                + 1.7848265399172913358) * r
                + 5.4637849111641143699) * r
                + 6.6579046435011037772)
                / (((((((r * 2.04426310338993978564e-15 + 1.4215117583164458887e-7) * r
                    + 1.8463183175100546818e-5) * r
                    + 7.868691311456132591e-4) * r
                    + 0.0148753612908506148525) * r
                    + 0.13692988092273580531) * r
                    + 0.59983220655588793769) * r
                    + 1.0),
            log_tail,
        )
    } else {
        let r = r - 5.0;
        (((((((r * 2.01033439929228813265e-7 + 2.71155556874348757815e-5) * r
            + 0.0012426609473880784386) * r
            + 0.026532189526576123093) * r
            + 0.29656057182850489123) * r
            + 1.7848265399172913358) * r
            + 5.4637849111641143699) * r
            + 6.6579046435011037772)
            / (((((((r * 2.04426310338993978564e-15 + 1.4215117583164458887e-7) * r
                + 1.8463183175100546818e-5) * r
                + 7.868691311456132591e-4) * r
                + 0.0148753612908506148525) * r
                + 0.13692988092273580531) * r
                + 0.59983220655588793769) * r
                + 1.0)
    };

    if q < 0.0 {
        -val
    } else {
        val
    }
}

/// Newton steps on the asymptotic log upper tail of the normal, for
/// quantiles past the fitted range of AS241
fn refine_extreme_tail(mut z: f64, log_tail: f64) -> f64 {
    let half_log_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
    for _ in 0..3 {
        let u = 1.0 / (z * z);
        let series = 1.0 - u * (1.0 - 3.0 * u * (1.0 - 5.0 * u * (1.0 - 7.0 * u)));
        let d_series = 2.0 * u / z * (1.0 - 6.0 * u * (1.0 - 7.5 * u * (1.0 - 28.0 / 3.0 * u)));
        let log_q = -0.5 * z * z - z.ln() - half_log_2pi + series.ln();
        let slope = -z - 1.0 / z + d_series / series;
        z -= (log_q - log_tail) / slope;
    }
    z
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_normal_quantile_known_values() {
        assert_abs_diff_eq!(normal_quantile_log(0.5f64.ln(), true), 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(normal_quantile_log(0.975f64.ln(), true), 1.959963984540054, epsilon = 1e-12);
        assert_abs_diff_eq!(normal_quantile_log(0.025f64.ln(), false), 1.959963984540054, epsilon = 1e-12);
        assert_abs_diff_eq!(normal_quantile_log(1e-10f64.ln(), false), 6.361340902404056, epsilon = 1e-9);
        assert_abs_diff_eq!(normal_quantile_log(1e-10f64.ln(), true), -6.361340902404056, epsilon = 1e-9);
    }

    #[test]
    fn test_normal_quantile_extreme_log() {
        // log p far below the double range of p itself
        let z = normal_quantile_log(-1000.0, false);
        assert!(z > 44.0 && z < 45.0, "z = {}", z);
        assert_eq!(normal_quantile_log(f64::NEG_INFINITY, false), f64::INFINITY);
        assert!(normal_quantile_log(0.1, true).is_nan());
        assert_abs_diff_eq!(normal_quantile_log(-5000.0, false), 99.94474817484109, epsilon = 1e-10);
        assert_abs_diff_eq!(normal_quantile_log(-1e8, true), -14142.134882976301, epsilon = 1e-7);
    }

    #[test]
    fn test_t2z_center_and_sign() {
        assert_eq!(t2z(0.0, 10.0), 0.0);
        let z = t2z(2.0, 10.0);
        assert!(z > 0.0);
        assert_abs_diff_eq!(t2z(-2.0, 10.0), -z, epsilon = 1e-12);
    }

    #[test]
    fn test_t2z_large_dof_approaches_identity() {
        assert_abs_diff_eq!(t2z(1.5, 1e5), 1.5, epsilon = 1e-4);
    }

    #[test]
    fn test_t2z_invalid() {
        assert!(t2z(f64::NAN, 10.0).is_nan());
        assert!(t2z(1.0, 0.0).is_nan());
        assert_eq!(t2z(f64::INFINITY, 5.0), f64::INFINITY);
    }

    #[test]
    fn test_f2z_edges() {
        assert_eq!(f2z(0.0, 2.0, 10.0), f64::NEG_INFINITY);
        assert_eq!(f2z(-1.0, 2.0, 10.0), f64::NEG_INFINITY);
        assert_eq!(f2z(1.0, 0.0, 10.0), f64::NEG_INFINITY);
        assert!(f2z(f64::NAN, 2.0, 10.0).is_nan());
        assert_eq!(f2z(f64::INFINITY, 2.0, 10.0), f64::INFINITY);
    }

    #[test]
    fn test_f2z_matches_t2z_squared() {
        // F(1, ν) = t², and the upper tail of F is the two-sided t tail
        let t: f64 = 2.5;
        let dof = 12.0;
        let z_f = f2z(t * t, 1.0, dof);
        let p_two_sided = 2.0 * StudentsT::new(0.0, 1.0, dof).unwrap().sf(t);
        let expected = normal_quantile_log(p_two_sided.ln(), false);
        assert_abs_diff_eq!(z_f, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_chisq2z() {
        // χ²(1) at 3.841459 is the 95th percentile
        assert_abs_diff_eq!(chisq2z(3.841458820694124, 1.0), 1.6448536269514722, epsilon = 1e-8);
        assert_eq!(chisq2z(0.0, 1.0), f64::NEG_INFINITY);
        assert_eq!(chisq2z(1.0, 0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_chisq2z_beyond_double_tail() {
        // the upper tail is exp(-5000), far below the smallest double
        let z = chisq2z(10000.0, 2.0);
        assert!(z.is_finite());
        assert_abs_diff_eq!(z, 99.944748174841092, epsilon = 1e-9);
        assert!(chisq2z(20000.0, 2.0) > z);
        // the lower tail underflows at the other end
        let z = chisq2z(1e-300, 3.0);
        assert!(z.is_finite() && z < -37.0, "z = {}", z);
    }

    #[test]
    fn test_chisq_log_tails_match_statrs() {
        let dist = ChiSquared::new(5.0).unwrap();
        for x in [0.5, 3.0, 12.0, 40.0] {
            let (log_lower, log_upper) = chisq_log_tails(x, 5.0);
            assert_abs_diff_eq!(log_lower.exp(), dist.cdf(x), epsilon = 1e-12);
            assert_abs_diff_eq!(log_upper.exp(), dist.sf(x), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_t2z_exactly_odd() {
        for (t, dof) in [(0.3, 3.0), (4.0, 17.0), (25.0, 2.0)] {
            assert_eq!(t2z(-t, dof), -t2z(t, dof));
        }
    }
}
