//! Voxstat-Core: group-level voxelwise statistics for neuroimaging
//!
//! This crate combines per-subject effect size maps into group statistics.
//!
//! # Modules
//! - `distributions`: t, F and χ² to z conversion (arbitrary precision and fast paths)
//! - `design`: covariate spreadsheets, group design and contrast matrices
//! - `stats`: FLAME1, heterogeneity, MCAR and descriptive voxel fits, parallel sweep
//! - `linalg`: SVD least squares and Cholesky helpers
//! - `nifti_io`: NIfTI reading and map writing
//! - `cache`: bounded memoization owned by the caller

// Core modules
pub mod cache;
pub mod error;
pub mod linalg;

// Algorithm modules
pub mod distributions;
pub mod design;
pub mod stats;

// I/O modules
pub mod nifti_io;

pub use error::{Error, Result};
