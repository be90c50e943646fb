//! Conversion of t, F and χ² statistics to z scores
//!
//! Two implementations with the same semantics:
//! - [`reference`]: arbitrary precision with adaptive convergence
//! - [`fast`]: double-precision special functions
//!
//! Degrees of freedom at or below zero give NaN for t and -inf for F and χ²,
//! as do non-positive F and χ² statistics.

pub mod bigfloat;
pub mod fast;
pub mod reference;
pub mod special;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which conversion path the model fits use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZMethod {
    /// Double-precision tails from `statrs`
    #[default]
    Fast,
    /// Arbitrary precision for integer degrees of freedom; fractional
    /// degrees of freedom are converted by [`ZMethod::Fast`] with a warning
    Reference,
}

impl ZMethod {
    pub fn t2z(self, t: f64, dof: f64) -> Result<f64> {
        match self {
            ZMethod::Fast => Ok(fast::t2z(t, dof)),
            ZMethod::Reference => reference::t2z(t, dof),
        }
    }

    pub fn f2z(self, f: f64, d1: f64, d2: f64) -> Result<f64> {
        match self {
            ZMethod::Fast => Ok(fast::f2z(f, d1, d2)),
            ZMethod::Reference => reference::f2z(f, d1, d2),
        }
    }

    pub fn chisq2z(self, x: f64, k: f64) -> Result<f64> {
        match self {
            ZMethod::Fast => Ok(fast::chisq2z(x, k)),
            ZMethod::Reference => reference::chisq2z(x, k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_methods_agree_on_moderate_values() {
        for &(t, dof) in &[(1.0, 5.0), (-3.5, 20.0), (8.0, 100.0)] {
            let a = ZMethod::Fast.t2z(t, dof).unwrap();
            let b = ZMethod::Reference.t2z(t, dof).unwrap();
            assert!((a - b).abs() < 1e-6, "t2z({}, {}): {} vs {}", t, dof, a, b);
        }
        let a = ZMethod::Fast.f2z(3.0, 2.0, 30.0).unwrap();
        let b = ZMethod::Reference.f2z(3.0, 2.0, 30.0).unwrap();
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_reference_falls_back_for_fractional_dof() {
        let a = ZMethod::Reference.t2z(2.0, 13.7).unwrap();
        assert_eq!(a, ZMethod::Fast.t2z(2.0, 13.7).unwrap());
        let a = ZMethod::Reference.f2z(2.0, 1.5, 20.0).unwrap();
        assert_eq!(a, ZMethod::Fast.f2z(2.0, 1.5, 20.0).unwrap());
    }

    #[test]
    fn test_serde_names() {
        let m: ZMethod = serde_json::from_str("\"reference\"").unwrap();
        assert_eq!(m, ZMethod::Reference);
        assert_eq!(serde_json::to_string(&ZMethod::Fast).unwrap(), "\"fast\"");
    }
}
