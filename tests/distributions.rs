//! Properties of the statistic to z conversions

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use voxstat_core::distributions::{fast, reference, ZMethod};

/// Largest z difference tolerated between the two conversion paths
const PATH_AGREEMENT: f64 = 1e-6;

proptest! {
    #[test]
    fn test_distribution_centers_map_to_zero(dof in 1u32..1000) {
        let dof = dof as f64;
        prop_assert_eq!(fast::t2z(0.0, dof), 0.0);
        // F(d, d) has its median at 1
        prop_assert!(fast::f2z(1.0, dof, dof).abs() < 1e-8);
    }

    #[test]
    fn test_t2z_is_odd(t in 0.01f64..30.0, dof in 1u32..500) {
        let dof = dof as f64;
        prop_assert_eq!(fast::t2z(-t, dof), -fast::t2z(t, dof));
    }

    #[test]
    fn test_t2z_monotone(t in -20.0f64..20.0, step in 0.05f64..2.0, dof in 1u32..200) {
        let dof = dof as f64;
        prop_assert!(fast::t2z(t + step, dof) > fast::t2z(t, dof));
    }

    #[test]
    fn test_t2z_shrinks_toward_zero(t in 0.5f64..10.0, dof in 1u32..200) {
        // heavier tails than the normal
        let z = fast::t2z(t, dof as f64);
        prop_assert!(z > 0.0 && z <= t);
    }

    #[test]
    fn test_chisq2z_monotone(x in 0.01f64..80.0, step in 0.05f64..5.0, k in 1u32..50) {
        let k = k as f64;
        prop_assert!(fast::chisq2z(x + step, k) > fast::chisq2z(x, k));
    }

    #[test]
    fn test_f2z_monotone(f in 0.01f64..30.0, step in 0.05f64..3.0, d1 in 1u32..10, d2 in 2u32..100) {
        let (d1, d2) = (d1 as f64, d2 as f64);
        prop_assert!(fast::f2z(f + step, d1, d2) > fast::f2z(f, d1, d2));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_t2z_paths_agree(t in -20.0f64..20.0, dof in 2u32..=200) {
        let dof = dof as f64;
        let a = fast::t2z(t, dof);
        let b = reference::t2z(t, dof).unwrap();
        prop_assert!((a - b).abs() < PATH_AGREEMENT, "t2z({}, {}): {} vs {}", t, dof, a, b);
    }

    #[test]
    fn test_f2z_paths_agree(f in 0.05f64..20.0, d1 in 1u32..6, d2 in 4u32..40) {
        let (d1, d2) = (d1 as f64, d2 as f64);
        let a = fast::f2z(f, d1, d2);
        let b = reference::f2z(f, d1, d2).unwrap();
        prop_assert!((a - b).abs() < PATH_AGREEMENT, "f2z({}, {}, {}): {} vs {}", f, d1, d2, a, b);
    }

    #[test]
    fn test_chisq2z_paths_agree(x in 0.05f64..40.0, k in 1u32..12) {
        let k = k as f64;
        let a = fast::chisq2z(x, k);
        let b = reference::chisq2z(x, k).unwrap();
        prop_assert!((a - b).abs() < PATH_AGREEMENT, "chisq2z({}, {}): {} vs {}", x, k, a, b);
    }
}

#[test]
fn test_degenerate_inputs() {
    for method in [ZMethod::Fast, ZMethod::Reference] {
        assert_eq!(method.t2z(0.0, 12.0).unwrap(), 0.0);
        assert!(method.t2z(f64::NAN, 12.0).unwrap().is_nan());
        assert!(method.t2z(1.5, 0.0).unwrap().is_nan());
        assert_eq!(method.f2z(0.0, 2.0, 10.0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(method.chisq2z(-1.0, 3.0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(method.chisq2z(f64::INFINITY, 3.0).unwrap(), f64::INFINITY);
    }
}

#[test]
fn test_extreme_t_keeps_precision() {
    // p is far below f64 resolution of 1 - p
    let z = reference::t2z(40.0, 30.0).unwrap();
    assert!(z.is_finite());
    assert!(z > 8.0);
    assert_abs_diff_eq!(fast::t2z(40.0, 30.0), z, epsilon = PATH_AGREEMENT);
}

#[test]
fn test_paths_agree_in_the_tails() {
    let t_cases = [
        (0.9, 2.0, 0.73374361303523298),
        (11.391, 2.0, 2.6685089318540334),
        (-19.9, 2.0, -3.0214509473567503),
        (20.0, 200.0, 14.806201975321537),
        (50.0, 200.0, 22.792671522455315),
        (1000.0, 10.0, 10.617881482628162),
    ];
    for (t, dof, expected) in t_cases {
        for method in [ZMethod::Fast, ZMethod::Reference] {
            let z = method.t2z(t, dof).unwrap();
            assert_abs_diff_eq!(z, expected, epsilon = PATH_AGREEMENT);
        }
    }
    for method in [ZMethod::Fast, ZMethod::Reference] {
        assert_abs_diff_eq!(method.f2z(1e6, 2.0, 10.0).unwrap(), 10.74509369003203, epsilon = PATH_AGREEMENT);
        assert_abs_diff_eq!(method.f2z(1e-9, 3.0, 10.0).unwrap(), -7.4493878537701357, epsilon = PATH_AGREEMENT);
        assert_abs_diff_eq!(method.chisq2z(1e-10, 3.0).unwrap(), -8.103974397718296, epsilon = PATH_AGREEMENT);
        assert_abs_diff_eq!(method.chisq2z(10000.0, 2.0).unwrap(), 99.944748174841092, epsilon = PATH_AGREEMENT);
    }
}

#[test]
fn test_reference_fractional_dof_matches_fast() {
    assert_eq!(reference::t2z(1.0, 2.5).unwrap(), fast::t2z(1.0, 2.5));
    assert_eq!(ZMethod::Reference.chisq2z(3.0, 0.5).unwrap(), fast::chisq2z(3.0, 0.5));
}
