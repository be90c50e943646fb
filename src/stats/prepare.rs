//! Per-voxel data preparation shared by all algorithms

use nalgebra::{DMatrix, DVector};

/// Observations of one voxel across subjects
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelData {
    /// Effect size per subject
    pub y: DVector<f64>,
    /// Design matrix, subjects × regressors
    pub z: DMatrix<f64>,
    /// Sampling variance per subject
    pub s: DVector<f64>,
}

impl VoxelData {
    pub fn new(y: DVector<f64>, z: DMatrix<f64>, s: DVector<f64>) -> Self {
        Self { y, z, s }
    }

    pub fn n_subjects(&self) -> usize {
        self.y.len()
    }

    pub fn n_regressors(&self) -> usize {
        self.z.ncols()
    }
}

/// Subjects with a finite effect size and a finite variance
pub fn available(y: &DVector<f64>, s: &DVector<f64>) -> Vec<bool> {
    y.iter()
        .zip(s.iter())
        .map(|(a, b)| a.is_finite() && b.is_finite())
        .collect()
}

/// Design with NaN replaced by zero and variances defaulted to zero if none are known
pub fn fill_missing(data: &VoxelData) -> VoxelData {
    let z = data.z.map(|v| if v.is_nan() { 0.0 } else { v });
    let s = if data.s.iter().all(|v| v.is_nan()) {
        DVector::zeros(data.s.len())
    } else {
        data.s.clone()
    };
    VoxelData::new(data.y.clone(), z, s)
}

/// Drop every subject with a non-finite effect size or variance
pub fn listwise_deletion(data: &VoxelData) -> VoxelData {
    let keep = available(&data.y, &data.s);
    let rows: Vec<usize> = (0..keep.len()).filter(|&i| keep[i]).collect();

    let y = DVector::from_iterator(rows.len(), rows.iter().map(|&i| data.y[i]));
    let s = DVector::from_iterator(rows.len(), rows.iter().map(|&i| data.s[i]));
    let z = data.z.select_rows(rows.iter());
    VoxelData::new(y, z, s)
}

/// Subtract the column mean from every non-constant column
///
/// Constant columns such as the intercept are left unchanged.
pub fn demean(z: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = z.clone();
    if z.nrows() == 0 {
        return out;
    }
    for mut column in out.column_iter_mut() {
        let first = column[0];
        if column.iter().all(|&v| v == first) {
            continue;
        }
        let mean = column.mean();
        column.add_scalar_mut(-mean);
    }
    out
}

/// Fill, delete incomplete subjects, then demean the design
pub fn prepare(data: &VoxelData) -> VoxelData {
    let filled = fill_missing(data);
    let mut complete = listwise_deletion(&filled);
    complete.z = demean(&complete.z);
    complete
}

/// Population standard deviation (divisor n)
pub fn population_std(values: &DVector<f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    let mean = values.mean();
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / n as f64).sqrt()
}

/// Number of finite values
pub fn count_finite(values: &DVector<f64>) -> usize {
    values.iter().filter(|v| v.is_finite()).count()
}

/// Tolerance used when testing a scale for zero
pub fn is_close_to_zero(value: f64) -> bool {
    value.abs() <= 1e-8
}
