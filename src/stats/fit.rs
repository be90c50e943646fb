//! Input loading and the voxelwise sweep
//!
//! Cope, varcope and mask images of all subjects are loaded into flat
//! buffers, every voxel with enough finite observations is handed to each
//! selected algorithm, and the collected statistics are written as maps
//! with the geometry of the first cope image.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{debug, info};
use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::algorithm::{Algorithm, SweepContext};
use super::output::{OutputFiles, OutputTarget, VoxelResults};
use super::prepare::{count_finite, VoxelData};
use super::{Coordinate, VoxelOutcome};
use crate::design::{parse_design, Contrast, ContrastMatrices, DesignMatrix};
use crate::distributions::ZMethod;
use crate::error::{Error, Result};
use crate::nifti_io::{read_nifti_file, Geometry, NiftiData};

/// Voxels handed to the pool per batch, progress is reported between batches
const CHUNK_SIZE: usize = 4096;

/// Environment variables that control threading of numeric libraries
const THREAD_LIMIT_VARS: [&str; 5] = [
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
    "NUMEXPR_NUM_THREADS",
];

// ============================================================================
// Configuration
// ============================================================================

/// Settings of a voxelwise fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Worker threads, values below 2 run the sweep on the calling thread
    pub num_threads: usize,
    pub algorithms: BTreeSet<Algorithm>,
    pub z_method: ZMethod,
    /// Directory receiving the output maps
    pub output_dir: PathBuf,
    /// Write .nii.gz instead of .nii
    pub compress: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            algorithms: BTreeSet::from([Algorithm::Flame1]),
            z_method: ZMethod::default(),
            output_dir: PathBuf::from("."),
            compress: true,
        }
    }
}

impl FitConfig {
    /// Load a configuration from JSON, missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Images and model of a fit, one entry per input unit in matching order
#[derive(Debug, Clone, Default)]
pub struct FitInputs {
    pub cope_files: Vec<PathBuf>,
    pub var_cope_files: Option<Vec<PathBuf>>,
    pub mask_files: Vec<PathBuf>,
    /// Column name and one value per subject
    pub regressors: Vec<(String, Vec<f64>)>,
    pub contrasts: Vec<Contrast>,
}

// ============================================================================
// Input loading
// ============================================================================

/// Masked observations of all subjects
#[derive(Debug, Clone)]
pub struct InputData {
    /// Cope values, one volume per subject, NaN outside the effective mask
    pub copes: Vec<f64>,
    /// Variance values, all NaN without varcope files
    pub var_copes: Vec<f64>,
    pub n_subjects: usize,
    /// Geometry of the first cope image, squeezed to 3D
    pub geometry: Geometry,
}

impl InputData {
    /// Observations of one voxel across subjects
    pub fn voxel(&self, index: usize) -> (DVector<f64>, DVector<f64>) {
        let n = self.geometry.n_voxels();
        let y = DVector::from_fn(self.n_subjects, |t, _| self.copes[t * n + index]);
        let s = DVector::from_fn(self.n_subjects, |t, _| self.var_copes[t * n + index]);
        (y, s)
    }
}

fn check_dims(image: &NiftiData, dims: (usize, usize, usize), path: &Path) -> Result<()> {
    if image.dims != dims {
        return Err(Error::Shape(format!(
            "'{}' has shape {:?}, expected {:?}",
            path.display(),
            image.dims,
            dims
        )));
    }
    Ok(())
}

/// Load copes, optional varcopes and masks
///
/// A file may hold one subject (3D) or several (4D); subjects are
/// concatenated in list order. A 3D mask applies to every volume of its
/// cope file. The effective mask of each subject is the mask and the
/// finite cope (and varcope) values; everything outside it becomes NaN.
///
/// # Arguments
/// * `cope_files` - Effect size images
/// * `var_cope_files` - Matching variance images, if available
/// * `mask_files` - Matching brain masks
pub fn load_data(
    cope_files: &[PathBuf],
    var_cope_files: Option<&[PathBuf]>,
    mask_files: &[PathBuf],
) -> Result<InputData> {
    if cope_files.len() != mask_files.len() {
        return Err(Error::Shape(format!(
            "number of cope files ({}) does not match number of mask files ({})",
            cope_files.len(),
            mask_files.len()
        )));
    }
    if let Some(var_cope_files) = var_cope_files {
        if var_cope_files.len() != cope_files.len() {
            return Err(Error::Shape(format!(
                "number of variance cope files ({}) does not match number of cope files ({})",
                var_cope_files.len(),
                cope_files.len()
            )));
        }
    }
    let Some(first_file) = cope_files.first() else {
        return Err(Error::Shape("no cope files".to_string()));
    };

    let first = read_nifti_file(first_file)?;
    let geometry = first.geometry();
    let n = geometry.n_voxels();

    let mut copes = Vec::new();
    let mut var_copes = Vec::new();
    let mut n_subjects = 0;

    for (i, cope_file) in cope_files.iter().enumerate() {
        let cope = if i == 0 { first.clone() } else { read_nifti_file(cope_file)? };
        check_dims(&cope, geometry.dims, cope_file)?;

        let mask = read_nifti_file(&mask_files[i])?;
        check_dims(&mask, geometry.dims, &mask_files[i])?;
        if mask.n_volumes != 1 && mask.n_volumes != cope.n_volumes {
            return Err(Error::Shape(format!(
                "'{}' has {} volumes, expected 1 or {}",
                mask_files[i].display(),
                mask.n_volumes,
                cope.n_volumes
            )));
        }

        let var_cope = match var_cope_files {
            Some(files) => {
                let image = read_nifti_file(&files[i])?;
                check_dims(&image, geometry.dims, &files[i])?;
                if image.n_volumes != cope.n_volumes {
                    return Err(Error::Shape(format!(
                        "'{}' has {} volumes, expected {}",
                        files[i].display(),
                        image.n_volumes,
                        cope.n_volumes
                    )));
                }
                Some(image)
            }
            None => None,
        };

        for t in 0..cope.n_volumes {
            let cope_volume = cope.volume(t);
            let mask_volume = mask.volume(if mask.n_volumes == 1 { 0 } else { t });
            let var_volume = var_cope.as_ref().map(|image| image.volume(t));

            for j in 0..n {
                let mut inside = mask_volume[j] != 0.0 && cope_volume[j].is_finite();
                if let Some(var_volume) = var_volume {
                    inside &= var_volume[j].is_finite();
                }
                if inside {
                    copes.push(cope_volume[j]);
                    var_copes.push(var_volume.map_or(f64::NAN, |v| v[j]));
                } else {
                    copes.push(f64::NAN);
                    var_copes.push(f64::NAN);
                }
            }
            n_subjects += 1;
        }
    }

    debug!("loaded {} subjects of shape {:?}", n_subjects, geometry.dims);
    Ok(InputData {
        copes,
        var_copes,
        n_subjects,
        geometry,
    })
}

// ============================================================================
// Thread limits
// ============================================================================

/// Pins numeric libraries to one thread until dropped
///
/// Previous values are restored on drop.
pub struct ThreadLimitGuard {
    previous: Vec<(&'static str, Option<String>)>,
}

impl ThreadLimitGuard {
    pub fn new() -> Self {
        let previous = THREAD_LIMIT_VARS
            .iter()
            .map(|&name| {
                let old = std::env::var(name).ok();
                std::env::set_var(name, "1");
                (name, old)
            })
            .collect();
        Self { previous }
    }
}

impl Default for ThreadLimitGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadLimitGuard {
    fn drop(&mut self) {
        for (name, old) in &self.previous {
            match old {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
    }
}

// ============================================================================
// Sweep
// ============================================================================

type VoxelResult = (Coordinate, Vec<(Algorithm, VoxelOutcome)>);

fn coordinate(index: usize, dims: (usize, usize, usize)) -> Coordinate {
    let (nx, ny, _) = dims;
    (index % nx, (index / nx) % ny, index / (nx * ny))
}

struct Sweep<'a> {
    input: &'a InputData,
    design: &'a DesignMatrix,
    contrasts: &'a ContrastMatrices,
    algorithms: &'a [Algorithm],
    context: &'a SweepContext,
}

impl Sweep<'_> {
    fn voxel_calc(&self, index: usize) -> Result<VoxelResult> {
        let c = coordinate(index, self.input.geometry.dims);
        let (y, s) = self.input.voxel(index);
        let data = VoxelData::new(y, self.design.matrix.clone(), s);

        let mut outcomes = Vec::with_capacity(self.algorithms.len());
        for &algorithm in self.algorithms {
            let outcome = algorithm.voxel_calc(c, &data, self.contrasts, self.context)?;
            outcomes.push((algorithm, outcome));
        }
        Ok((c, outcomes))
    }
}

/// Voxels with at least one observation more than there are regressors
fn candidate_voxels(input: &InputData, n_regressors: usize) -> Vec<usize> {
    (0..input.geometry.n_voxels())
        .filter(|&index| {
            let (y, _) = input.voxel(index);
            count_finite(&y) >= n_regressors + 1
        })
        .collect()
}

/// Fit every selected algorithm at every voxel and write the maps
pub fn fit(inputs: &FitInputs, config: &FitConfig) -> Result<OutputFiles> {
    fit_with_progress(inputs, config, |_, _| {})
}

/// Fit with a progress callback
///
/// # Arguments
/// * `inputs` - Images, regressors and contrasts
/// * `config` - Threads, algorithms, z conversion and output settings
/// * `progress_callback` - Called with (voxels done, voxels total) after each batch
///
/// # Returns
/// Written files per output name
pub fn fit_with_progress<F>(inputs: &FitInputs, config: &FitConfig, mut progress_callback: F) -> Result<OutputFiles>
where
    F: FnMut(usize, usize),
{
    let input = load_data(
        &inputs.cope_files,
        inputs.var_cope_files.as_deref(),
        &inputs.mask_files,
    )?;

    let (design, contrasts) = parse_design(&inputs.regressors, &inputs.contrasts)?;
    if design.n_rows() != input.n_subjects {
        return Err(Error::Shape(format!(
            "design has {} rows but {} subjects were loaded",
            design.n_rows(),
            input.n_subjects
        )));
    }

    let mut algorithm_set = config.algorithms.clone();
    if design.n_columns() == 1 {
        algorithm_set.remove(&Algorithm::McarTest);
    }
    let algorithms: Vec<Algorithm> = algorithm_set.into_iter().collect();

    let voxels = candidate_voxels(&input, design.n_columns());
    let total = voxels.len();
    info!(
        "Fitting {} of {} voxels with {:?} using {} thread(s)",
        total,
        input.geometry.n_voxels(),
        algorithms,
        config.num_threads.max(1)
    );

    let context = SweepContext::new(config.z_method);
    let sweep = Sweep {
        input: &input,
        design: &design,
        contrasts: &contrasts,
        algorithms: &algorithms,
        context: &context,
    };

    let mut results: BTreeMap<Algorithm, VoxelResults> = BTreeMap::new();
    let mut collect = |batch: Vec<VoxelResult>| {
        for (c, outcomes) in batch {
            for (algorithm, outcome) in outcomes {
                results.entry(algorithm).or_default().insert(c, outcome);
            }
        }
    };

    {
        let _limits = ThreadLimitGuard::new();
        let mut done = 0;

        if config.num_threads < 2 {
            for chunk in voxels.chunks(CHUNK_SIZE) {
                let batch = chunk
                    .iter()
                    .map(|&index| sweep.voxel_calc(index))
                    .collect::<Result<Vec<_>>>()?;
                collect(batch);
                done += chunk.len();
                progress_callback(done, total);
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .build()
                .map_err(|e| Error::ThreadPool(e.to_string()))?;

            for chunk in voxels.chunks(CHUNK_SIZE) {
                let batch = pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|&index| sweep.voxel_calc(index))
                        .collect::<Result<Vec<_>>>()
                })?;
                collect(batch);
                done += chunk.len();
                progress_callback(done, total);
            }
        }
    }

    std::fs::create_dir_all(&config.output_dir).map_err(|e| Error::io(&config.output_dir, e))?;
    let target = OutputTarget {
        geometry: &input.geometry,
        directory: &config.output_dir,
        compress: config.compress,
    };

    let mut output_files = OutputFiles::new();
    for (algorithm, voxel_results) in &results {
        if voxel_results.is_empty() {
            continue;
        }
        output_files.extend(algorithm.write_outputs(&target, &contrasts, voxel_results)?);
    }

    info!("Wrote {} outputs to {}", output_files.len(), config.output_dir.display());
    Ok(output_files)
}
