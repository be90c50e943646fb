//! Common test utilities for voxstat-core integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use voxstat_core::design::{Contrast, TContrast};
use voxstat_core::nifti_io::{read_nifti_file, save_nifti_to_file, Datatype, Geometry};

/// 2 mm isotropic geometry with an origin offset
pub fn geometry(dims: (usize, usize, usize)) -> Geometry {
    let mut affine = [0.0; 16];
    affine[0] = 2.0;
    affine[5] = 2.0;
    affine[10] = 2.0;
    affine[3] = -10.0;
    affine[7] = -12.0;
    affine[11] = -8.0;
    affine[15] = 1.0;
    Geometry {
        dims,
        voxel_size: (2.0, 2.0, 2.0),
        affine,
    }
}

/// Deterministic pseudo-random numbers in [-0.5, 0.5)
pub fn jitter(seed: usize) -> f64 {
    let mut x = (seed as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    (x % 1_000_000) as f64 / 1_000_000.0 - 0.5
}

/// Per-subject cope, varcope and mask files in a temporary directory
pub struct SyntheticStudy {
    pub dir: TempDir,
    pub geometry: Geometry,
    pub cope_files: Vec<PathBuf>,
    pub var_cope_files: Vec<PathBuf>,
    pub mask_files: Vec<PathBuf>,
    pub ages: Vec<f64>,
}

impl SyntheticStudy {
    /// Build a study where each voxel's cope depends linearly on age
    ///
    /// # Arguments
    /// * `n_subjects` - Number of subjects, one 3D file each
    /// * `dims` - Volume shape
    /// * `missing` - Returns true where a subject's voxel is outside its mask
    pub fn new(n_subjects: usize, dims: (usize, usize, usize), missing: impl Fn(usize, usize) -> bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let geometry = geometry(dims);
        let n = geometry.n_voxels();
        let ages: Vec<f64> = (0..n_subjects).map(|i| 20.0 + 2.5 * i as f64 + 3.0 * jitter(i)).collect();

        let mut study = Self {
            dir,
            geometry,
            cope_files: Vec::new(),
            var_cope_files: Vec::new(),
            mask_files: Vec::new(),
            ages,
        };

        for subject in 0..n_subjects {
            let mut cope = vec![0.0; n];
            let mut var_cope = vec![0.0; n];
            let mut mask = vec![1.0; n];
            for voxel in 0..n {
                let slope = 0.02 * (voxel % 5) as f64;
                cope[voxel] = 1.0 + slope * study.ages[subject] + jitter(subject * 7919 + voxel);
                var_cope[voxel] = 0.05 + 0.01 * (subject % 3) as f64;
                if missing(subject, voxel) {
                    mask[voxel] = 0.0;
                }
            }
            let cope_file = study.write(&format!("sub-{:02}_cope.nii.gz", subject), &cope, Datatype::Float64);
            let var_file = study.write(&format!("sub-{:02}_varcope.nii.gz", subject), &var_cope, Datatype::Float64);
            let mask_file = study.write(&format!("sub-{:02}_mask.nii.gz", subject), &mask, Datatype::Uint8);
            study.cope_files.push(cope_file);
            study.var_cope_files.push(var_file);
            study.mask_files.push(mask_file);
        }
        study
    }

    fn write(&self, name: &str, data: &[f64], datatype: Datatype) -> PathBuf {
        let path = self.dir.path().join(name);
        save_nifti_to_file(&path, data, &self.geometry, 1, datatype).unwrap();
        path
    }

    pub fn n_subjects(&self) -> usize {
        self.ages.len()
    }

    /// Intercept and age regressors
    pub fn regressors(&self) -> Vec<(String, Vec<f64>)> {
        vec![
            ("intercept".to_string(), vec![1.0; self.n_subjects()]),
            ("age".to_string(), self.ages.clone()),
        ]
    }

    pub fn output_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Single-column T contrast
pub fn t_contrast(name: &str, column: &str) -> Contrast {
    Contrast::T(TContrast {
        name: name.to_string(),
        columns: vec![column.to_string()],
        weights: vec![1.0],
    })
}

/// Load a written map
pub fn load_map(path: &Path) -> Vec<f64> {
    read_nifti_file(path).unwrap().data
}

/// Largest absolute difference over voxels finite in both maps, and whether
/// the NaN patterns agree
pub fn compare_maps(a: &[f64], b: &[f64]) -> (f64, bool) {
    let mut max_diff: f64 = 0.0;
    let mut same_pattern = a.len() == b.len();
    for (x, y) in a.iter().zip(b) {
        if x.is_nan() != y.is_nan() {
            same_pattern = false;
        } else if x.is_finite() && y.is_finite() {
            max_diff = max_diff.max((x - y).abs());
        }
    }
    (max_diff, same_pattern)
}
