//! Design matrices and contrasts
//!
//! - [`spreadsheet`]: covariate table reader with a caller-owned cache
//! - [`model`]: group-level design from declarative variables and contrasts
//! - [`parse`]: numeric design and contrast matrices for the fit

pub mod model;
pub mod parse;
pub mod spreadsheet;

pub use model::{group_design, group_design_from_table, intercept_only, ContrastSpec, Design, VariableSpec};
pub use parse::{parse_design, Contrast, ContrastMatrices, DesignMatrix, TContrast};
pub use spreadsheet::{read_spreadsheet, Spreadsheet, SpreadsheetCache};
