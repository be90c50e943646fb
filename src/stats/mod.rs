//! Voxelwise group statistics
//!
//! Every algorithm maps one voxel's observations to a [`VoxelOutcome`]:
//! statistics per contrast, statistics for the whole model, or a skip with
//! its reason. Skips are ordinary results, only genuine bugs are errors.
//!
//! - [`flame1`]: mixed-effects GLS with a random-effects variance component
//! - [`heterogeneity`]: REML likelihood-ratio test, I² and variance diagnostics
//! - [`mcar`]: logistic regression test of missingness on the design
//! - [`descriptive`]: mean, spread and missingness of the observations
//! - [`fit`]: input loading and the parallel voxel sweep
//! - [`output`]: statistical maps written back to NIfTI

pub mod algorithm;
pub mod brent;
pub mod descriptive;
pub mod fit;
pub mod flame1;
pub mod heterogeneity;
pub mod mcar;
pub mod output;
pub mod prepare;

use std::fmt;

pub use algorithm::Algorithm;
pub use fit::{fit, fit_with_progress, load_data, FitConfig, FitInputs, InputData};
pub use output::OutputFiles;

/// Voxel index (x, y, z) into the reference volume
pub type Coordinate = (usize, usize, usize);

/// Value of one statistic at one voxel
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Flag(bool),
}

/// Named statistics of one voxel, in output order
pub type Statistics = Vec<(&'static str, StatValue)>;

/// Why a voxel produced no result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    /// Fewer observations than design columns plus one
    InsufficientData,
    /// The dependent variable is constant
    ZeroVariance,
    /// A sampling variance is negative
    NegativeVariance,
    /// A sampling variance is zero where a model needs it positive
    ZeroSamplingVariance,
    /// A linear system could not be solved
    Singular,
    /// An iterative fit did not converge
    NonConvergence,
    /// Missingness is perfectly predicted by the design
    PerfectSeparation,
    /// Missingness is always or never present
    ConstantResponse,
    /// Every contrast failed for this voxel
    AllContrastsFailed,
    /// A likelihood or energy evaluated to a non-finite value
    NonFinite,
}

impl SkipReason {
    /// Failure modes outside the anticipated taxonomy of a model
    pub fn is_unexpected(self) -> bool {
        matches!(self, SkipReason::NonConvergence | SkipReason::NonFinite)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::InsufficientData => "insufficient data",
            SkipReason::ZeroVariance => "dependent variable has zero variance",
            SkipReason::NegativeVariance => "variance needs to be non-negative",
            SkipReason::ZeroSamplingVariance => "variance needs to be positive",
            SkipReason::Singular => "singular matrix",
            SkipReason::NonConvergence => "optimization did not converge",
            SkipReason::PerfectSeparation => "perfect separation",
            SkipReason::ConstantResponse => "response has zero variance",
            SkipReason::AllContrastsFailed => "all contrasts failed",
            SkipReason::NonFinite => "non-finite likelihood",
        };
        f.write_str(text)
    }
}

/// Result of one algorithm at one voxel
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelOutcome {
    /// Statistics per contrast name
    Contrasts(Vec<(String, Statistics)>),
    /// Statistics of the whole model
    Model(Statistics),
    Skipped(SkipReason),
}

impl VoxelOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, VoxelOutcome::Skipped(_))
    }
}
