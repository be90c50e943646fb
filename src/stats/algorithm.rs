//! The closed set of voxelwise algorithms

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

use super::output::{write_contrast_outputs, write_model_outputs, OutputFiles, OutputTarget, VoxelResults};
use super::prepare::VoxelData;
use super::{descriptive, flame1, heterogeneity, mcar, Coordinate, SkipReason, VoxelOutcome};
use crate::design::ContrastMatrices;
use crate::distributions::ZMethod;
use crate::error::{Error, Result};

/// Voxelwise algorithm selectable for a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Flame1,
    Heterogeneity,
    McarTest,
    Descriptive,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Flame1,
        Algorithm::Heterogeneity,
        Algorithm::McarTest,
        Algorithm::Descriptive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Flame1 => "flame1",
            Algorithm::Heterogeneity => "heterogeneity",
            Algorithm::McarTest => "mcartest",
            Algorithm::Descriptive => "descriptive",
        }
    }

    /// Outputs with one entry per contrast
    pub fn contrast_outputs(self) -> &'static [&'static str] {
        match self {
            Algorithm::Flame1 => &["copes", "var_copes", "zstats", "tstats", "fstats", "dof", "masks"],
            _ => &[],
        }
    }

    /// Outputs with a single entry for the whole model
    pub fn model_outputs(self) -> &'static [&'static str] {
        match self {
            Algorithm::Flame1 => &[],
            Algorithm::Heterogeneity => &[
                "hetnorm",
                "hetbeta",
                "hetgamma",
                "hettypical",
                "heti2",
                "hetpseudor2",
                "hetchisq",
            ],
            Algorithm::McarTest => &["mcarchisq", "mcardof", "mcarzstat"],
            Algorithm::Descriptive => &["descmean", "descstd", "desccount", "descmissing"],
        }
    }

    /// Run the algorithm on one voxel
    ///
    /// # Arguments
    /// * `coordinate` - Voxel position, used for diagnostics
    /// * `data` - Raw observations of the voxel
    /// * `contrasts` - Contrast matrices in output order
    /// * `context` - Settings and diagnostics shared by the sweep
    pub fn voxel_calc(
        self,
        coordinate: Coordinate,
        data: &VoxelData,
        contrasts: &ContrastMatrices,
        context: &SweepContext,
    ) -> Result<VoxelOutcome> {
        let outcome = match self {
            Algorithm::Flame1 => flame1::voxel_calc(data, contrasts, context.z_method)?,
            Algorithm::Heterogeneity => heterogeneity::voxel_calc(data),
            Algorithm::McarTest => mcar::voxel_calc(data, context.z_method)?,
            Algorithm::Descriptive => descriptive::voxel_calc(data),
        };

        if let VoxelOutcome::Skipped(reason) = outcome {
            let watched = matches!(self, Algorithm::Heterogeneity | Algorithm::McarTest);
            if watched && reason.is_unexpected() {
                context.warn_once(self, reason, coordinate);
            }
        }
        Ok(outcome)
    }

    /// Write the collected statistics as maps
    pub fn write_outputs(
        self,
        target: &OutputTarget<'_>,
        contrasts: &ContrastMatrices,
        results: &VoxelResults,
    ) -> Result<OutputFiles> {
        match self {
            Algorithm::Flame1 => {
                let names: Vec<String> = contrasts.iter().map(|(name, _)| name.clone()).collect();
                write_contrast_outputs(target, &names, self.contrast_outputs(), results)
            }
            _ => write_model_outputs(target, self.model_outputs(), results),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name() == lower)
            .ok_or_else(|| Error::UnknownAlgorithm(s.to_string()))
    }
}

/// Settings and diagnostics shared by all voxels of a sweep
#[derive(Debug, Default)]
pub struct SweepContext {
    pub z_method: ZMethod,
    warned: Mutex<HashSet<(Algorithm, SkipReason)>>,
}

impl SweepContext {
    pub fn new(z_method: ZMethod) -> Self {
        Self {
            z_method,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Log an unexpected failure the first time it occurs for an algorithm
    pub fn warn_once(&self, algorithm: Algorithm, reason: SkipReason, coordinate: Coordinate) {
        let first = match self.warned.lock() {
            Ok(mut warned) => warned.insert((algorithm, reason)),
            Err(poisoned) => poisoned.into_inner().insert((algorithm, reason)),
        };
        if first {
            warn!("Unexpected failure '{}' in {} for voxel {:?}", reason, algorithm, coordinate);
        }
    }

    /// Number of distinct unexpected failures seen so far
    pub fn n_warnings(&self) -> usize {
        match self.warned.lock() {
            Ok(warned) => warned.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("flame1".parse::<Algorithm>().unwrap(), Algorithm::Flame1);
        assert_eq!("MCARTest".parse::<Algorithm>().unwrap(), Algorithm::McarTest);
        assert!(matches!("ols".parse::<Algorithm>(), Err(Error::UnknownAlgorithm(_))));
    }

    #[test]
    fn test_serde_names_match_parse() {
        for algorithm in Algorithm::ALL {
            let json = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(json, format!("\"{}\"", algorithm.name()));
        }
    }

    #[test]
    fn test_warn_once_per_reason() {
        let context = SweepContext::new(ZMethod::Fast);
        context.warn_once(Algorithm::Heterogeneity, SkipReason::NonConvergence, (0, 0, 0));
        context.warn_once(Algorithm::Heterogeneity, SkipReason::NonConvergence, (1, 0, 0));
        context.warn_once(Algorithm::McarTest, SkipReason::NonConvergence, (1, 0, 0));
        assert_eq!(context.n_warnings(), 2);
    }

    #[test]
    fn test_output_lists() {
        assert_eq!(Algorithm::Flame1.contrast_outputs().len(), 7);
        assert!(Algorithm::Flame1.model_outputs().is_empty());
        assert!(Algorithm::McarTest.contrast_outputs().is_empty());
        assert!(Algorithm::Descriptive.model_outputs().contains(&"descstd"));
    }
}
