//! Descriptive statistics of the observations at each voxel

use super::prepare::{available, fill_missing, VoxelData};
use super::{SkipReason, StatValue, VoxelOutcome};

/// Mean, sample standard deviation, count and missing fraction
pub fn voxel_calc(data: &VoxelData) -> VoxelOutcome {
    let filled = fill_missing(data);
    let keep = available(&filled.y, &filled.s);
    let values: Vec<f64> = filled
        .y
        .iter()
        .zip(&keep)
        .filter_map(|(&v, &k)| k.then_some(v))
        .collect();

    let total = keep.len();
    let count = values.len();
    if count == 0 {
        return VoxelOutcome::Skipped(SkipReason::InsufficientData);
    }

    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count > 1 {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (count - 1) as f64).sqrt()
    } else {
        f64::NAN
    };
    let missing = (total - count) as f64 / total as f64;

    VoxelOutcome::Model(vec![
        ("descmean", StatValue::Scalar(mean)),
        ("descstd", StatValue::Scalar(std)),
        ("desccount", StatValue::Scalar(count as f64)),
        ("descmissing", StatValue::Scalar(missing)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_descriptive_values() {
        let y = DVector::from_vec(vec![1.0, 2.0, f64::NAN, 3.0]);
        let data = VoxelData::new(y, DMatrix::from_element(4, 1, 1.0), DVector::from_element(4, f64::NAN));
        let VoxelOutcome::Model(stats) = voxel_calc(&data) else {
            panic!("expected model statistics");
        };
        assert_eq!(stats[0], ("descmean", StatValue::Scalar(2.0)));
        let StatValue::Scalar(std) = stats[1].1 else {
            panic!("std is not a scalar");
        };
        assert_abs_diff_eq!(std, 1.0, epsilon = 1e-12);
        assert_eq!(stats[2], ("desccount", StatValue::Scalar(3.0)));
        assert_eq!(stats[3], ("descmissing", StatValue::Scalar(0.25)));
    }

    #[test]
    fn test_missing_variance_excludes_subject() {
        let y = DVector::from_vec(vec![1.0, 5.0]);
        let s = DVector::from_vec(vec![0.1, f64::NAN]);
        let data = VoxelData::new(y, DMatrix::from_element(2, 1, 1.0), s);
        let VoxelOutcome::Model(stats) = voxel_calc(&data) else {
            panic!("expected model statistics");
        };
        assert_eq!(stats[0], ("descmean", StatValue::Scalar(1.0)));
        assert!(matches!(stats[1].1, StatValue::Scalar(v) if v.is_nan()));
    }

    #[test]
    fn test_all_missing_is_skipped() {
        let data = VoxelData::new(
            DVector::from_element(3, f64::NAN),
            DMatrix::from_element(3, 1, 1.0),
            DVector::from_element(3, 0.1),
        );
        assert_eq!(voxel_calc(&data), VoxelOutcome::Skipped(SkipReason::InsufficientData));
    }
}
