//! Reassemble per-voxel statistics into NIfTI maps

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;

use super::{Coordinate, StatValue, Statistics, VoxelOutcome};
use crate::error::{Error, Result};
use crate::nifti_io::{save_nifti_to_file, Datatype, Geometry};

/// Output name to one written file per contrast, `None` where not applicable
pub type OutputFiles = BTreeMap<String, Vec<Option<PathBuf>>>;

/// Statistics of one algorithm collected over the sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoxelResults {
    /// Contrast name to statistics per voxel
    pub contrasts: BTreeMap<String, BTreeMap<Coordinate, Statistics>>,
    /// Model statistics per voxel
    pub model: BTreeMap<Coordinate, Statistics>,
}

impl VoxelResults {
    /// Record the outcome of one voxel; skipped voxels leave no trace
    pub fn insert(&mut self, coordinate: Coordinate, outcome: VoxelOutcome) {
        match outcome {
            VoxelOutcome::Contrasts(results) => {
                for (name, statistics) in results {
                    self.contrasts
                        .entry(name)
                        .or_default()
                        .insert(coordinate, statistics);
                }
            }
            VoxelOutcome::Model(statistics) => {
                self.model.insert(coordinate, statistics);
            }
            VoxelOutcome::Skipped(_) => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contrasts.is_empty() && self.model.is_empty()
    }
}

/// Where and how maps are written
#[derive(Debug, Clone)]
pub struct OutputTarget<'a> {
    pub geometry: &'a Geometry,
    pub directory: &'a Path,
    pub compress: bool,
}

impl OutputTarget<'_> {
    fn path(&self, prefix: &str) -> PathBuf {
        let extension = if self.compress { "nii.gz" } else { "nii" };
        self.directory.join(format!("{}.{}", prefix, extension))
    }
}

/// Replace everything but ASCII letters and digits with underscores
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn voxel_index(coordinate: Coordinate, dims: (usize, usize, usize)) -> usize {
    let (x, y, z) = coordinate;
    x + y * dims.0 + z * dims.0 * dims.1
}

/// Write one statistic as a map
///
/// Flags become a UINT8 3D mask, scalars a FLOAT64 3D map and vectors a
/// FLOAT64 4D map with one volume per element. Voxels without a value are
/// false or NaN.
pub fn write_map(
    target: &OutputTarget<'_>,
    prefix: &str,
    series: &BTreeMap<Coordinate, &StatValue>,
) -> Result<PathBuf> {
    let geometry = target.geometry;
    let n = geometry.n_voxels();
    let path = target.path(prefix);

    let is_mask = series
        .values()
        .next()
        .map_or(false, |v| matches!(v, StatValue::Flag(_)));
    let n_volumes = series
        .values()
        .map(|v| match v {
            StatValue::Vector(values) => values.len(),
            _ => 1,
        })
        .max()
        .unwrap_or(1)
        .max(1);

    let fill = if is_mask { 0.0 } else { f64::NAN };
    let mut data = vec![fill; n * n_volumes];
    for (&coordinate, value) in series {
        let index = voxel_index(coordinate, geometry.dims);
        if index >= n {
            return Err(Error::Shape(format!(
                "voxel {:?} outside of volume {:?}",
                coordinate, geometry.dims
            )));
        }
        match value {
            StatValue::Scalar(v) => data[index] = *v,
            StatValue::Flag(b) => data[index] = if *b { 1.0 } else { 0.0 },
            StatValue::Vector(values) => {
                for (t, v) in values.iter().enumerate() {
                    data[index + t * n] = *v;
                }
            }
        }
    }

    let datatype = if is_mask { Datatype::Uint8 } else { Datatype::Float64 };
    save_nifti_to_file(&path, &data, geometry, n_volumes, datatype)?;
    debug!("wrote {}", path.display());
    Ok(path)
}

/// Statistic names in order of first appearance
fn statistic_names<'a>(voxels: impl Iterator<Item = &'a Statistics>) -> Vec<&'static str> {
    let mut names = Vec::new();
    for statistics in voxels {
        for (name, _) in statistics {
            if !names.contains(name) {
                names.push(*name);
            }
        }
    }
    names
}

fn series<'a>(voxels: &'a BTreeMap<Coordinate, Statistics>, name: &str) -> BTreeMap<Coordinate, &'a StatValue> {
    voxels
        .iter()
        .filter_map(|(&coordinate, statistics)| {
            statistics
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (coordinate, value))
        })
        .collect()
}

/// Output name of a per-contrast statistic
fn contrast_output_name(statistic: &str) -> String {
    match statistic {
        "dof" => statistic.to_string(),
        _ => format!("{}s", statistic),
    }
}

/// Write one map per (statistic, contrast) pair
///
/// Every contrast gets a mask and a z map, all false and all NaN if no
/// voxel produced them.
///
/// # Arguments
/// * `target` - Geometry and destination of the maps
/// * `contrast_names` - Contrasts in output order
/// * `outputs` - Output names reported to the caller
/// * `results` - Collected voxel statistics
pub fn write_contrast_outputs(
    target: &OutputTarget<'_>,
    contrast_names: &[String],
    outputs: &[&str],
    results: &VoxelResults,
) -> Result<OutputFiles> {
    let mut files: OutputFiles = outputs
        .iter()
        .map(|name| (name.to_string(), vec![None; contrast_names.len()]))
        .collect();

    let empty = BTreeMap::new();
    let empty_mask = StatValue::Flag(false);
    let empty_zstat = StatValue::Scalar(f64::NAN);

    for (i, contrast) in contrast_names.iter().enumerate() {
        let voxels = results.contrasts.get(contrast).unwrap_or(&empty);
        let mut names = statistic_names(voxels.values());
        for required in ["mask", "zstat"] {
            if !names.contains(&required) {
                names.push(required);
            }
        }

        for name in names {
            let mut values = series(voxels, name);
            if values.is_empty() {
                let placeholder = if name == "mask" { &empty_mask } else { &empty_zstat };
                values = voxels.keys().map(|&c| (c, placeholder)).collect();
                if name == "mask" && values.is_empty() {
                    // an all-false map still needs its datatype
                    values.insert((0, 0, 0), placeholder);
                }
            }
            let prefix = format!("{}_{}_{}", name, i + 1, sanitize(contrast));
            let path = write_map(target, &prefix, &values)?;

            if let Some(slots) = files.get_mut(&contrast_output_name(name)) {
                slots[i] = Some(path);
            }
        }
    }

    Ok(files)
}

/// Write one map per model statistic, named after the statistic
pub fn write_model_outputs(target: &OutputTarget<'_>, outputs: &[&str], results: &VoxelResults) -> Result<OutputFiles> {
    let mut files = OutputFiles::new();
    for name in statistic_names(results.model.values()) {
        if !outputs.contains(&name) {
            continue;
        }
        let values = series(&results.model, name);
        let path = write_map(target, name, &values)?;
        files.insert(name.to_string(), vec![Some(path)]);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::read_nifti_file;

    fn geometry() -> Geometry {
        let mut affine = [0.0; 16];
        for i in 0..4 {
            affine[i * 4 + i] = 1.0;
        }
        Geometry {
            dims: (2, 2, 2),
            voxel_size: (1.0, 1.0, 1.0),
            affine,
        }
    }

    fn t_result(z: f64) -> Statistics {
        vec![
            ("cope", StatValue::Scalar(1.0)),
            ("dof", StatValue::Scalar(10.0)),
            ("zstat", StatValue::Scalar(z)),
            ("mask", StatValue::Flag(z.is_finite())),
        ]
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Group_patient-control"), "Group_patient_control");
        assert_eq!(sanitize("a b.c"), "a_b_c");
    }

    #[test]
    fn test_contrast_outputs_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = geometry();
        let target = OutputTarget {
            geometry: &geometry,
            directory: dir.path(),
            compress: false,
        };

        let mut results = VoxelResults::default();
        results.insert((1, 0, 0), VoxelOutcome::Contrasts(vec![("age".to_string(), t_result(2.5))]));
        results.insert((0, 1, 1), VoxelOutcome::Contrasts(vec![("age".to_string(), t_result(-1.0))]));

        let contrasts = vec!["age".to_string(), "empty one".to_string()];
        let outputs = ["copes", "zstats", "dof", "masks", "fstats"];
        let files = write_contrast_outputs(&target, &contrasts, &outputs, &results).unwrap();

        let zstats = &files["zstats"];
        assert_eq!(zstats.len(), 2);
        let path = zstats[0].as_ref().unwrap();
        assert!(path.ends_with("zstat_1_age.nii"));
        let image = read_nifti_file(path).unwrap();
        assert_eq!(image.data[1], 2.5);
        assert_eq!(image.data[1 * 2 + 1 * 4], -1.0);
        assert!(image.data[0].is_nan());

        assert!(files["dof"][0].as_ref().unwrap().ends_with("dof_1_age.nii"));
        assert_eq!(files["fstats"], vec![None, None]);

        // contrast without any voxel still gets a mask and a z map
        let mask = files["masks"][1].as_ref().unwrap();
        assert!(mask.ends_with("mask_2_empty_one.nii"));
        assert!(read_nifti_file(mask).unwrap().data.iter().all(|&v| v == 0.0));
        assert!(files["zstats"][1].is_some());
        assert!(files["copes"][1].is_none());
    }

    #[test]
    fn test_vector_statistic_is_4d() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = geometry();
        let target = OutputTarget {
            geometry: &geometry,
            directory: dir.path(),
            compress: true,
        };
        let mut results = VoxelResults::default();
        results.insert(
            (1, 1, 1),
            VoxelOutcome::Model(vec![
                ("hetbeta", StatValue::Vector(vec![0.5, 0.1])),
                ("hetchisq", StatValue::Scalar(3.0)),
            ]),
        );
        let files = write_model_outputs(&target, &["hetbeta", "hetchisq"], &results).unwrap();
        let path = files["hetbeta"][0].as_ref().unwrap();
        assert!(path.to_string_lossy().ends_with("hetbeta.nii.gz"));
        let image = read_nifti_file(path).unwrap();
        assert_eq!(image.n_volumes, 2);
        assert_eq!(image.volume(0)[7], 0.5);
        assert_eq!(image.volume(1)[7], 0.1);
        assert_eq!(files["hetchisq"].len(), 1);
    }

    #[test]
    fn test_skipped_voxels_are_absent() {
        let mut results = VoxelResults::default();
        results.insert((0, 0, 0), VoxelOutcome::Skipped(crate::stats::SkipReason::Singular));
        assert!(results.is_empty());
    }
}
