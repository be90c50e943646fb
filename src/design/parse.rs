//! Numeric design and contrast matrices for the voxelwise fit

use std::collections::HashSet;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single linear hypothesis over named design columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TContrast {
    pub name: String,
    pub columns: Vec<String>,
    pub weights: Vec<f64>,
}

/// T contrast, or F contrast tested jointly over its constituent T contrasts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Contrast {
    #[serde(rename = "T")]
    T(TContrast),
    #[serde(rename = "F")]
    F { name: String, contrasts: Vec<TContrast> },
}

impl Contrast {
    pub fn name(&self) -> &str {
        match self {
            Contrast::T(t) => &t.name,
            Contrast::F { name, .. } => name,
        }
    }
}

/// Regressors as an n_subjects × n_columns matrix with named columns
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    pub names: Vec<String>,
    pub matrix: DMatrix<f64>,
}

impl DesignMatrix {
    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.matrix.ncols()
    }
}

/// One k × n_columns matrix per contrast, in contrast order
pub type ContrastMatrices = Vec<(String, DMatrix<f64>)>;

fn contrast_row(t: &TContrast, names: &[String], owner: &str) -> Result<Vec<f64>> {
    if t.columns.len() != t.weights.len() {
        return Err(Error::InvalidContrast {
            name: owner.to_string(),
            reason: format!(
                "{} columns but {} weights",
                t.columns.len(),
                t.weights.len()
            ),
        });
    }
    let mut row = vec![0.0; names.len()];
    for (column, &weight) in t.columns.iter().zip(&t.weights) {
        let j = names
            .iter()
            .position(|n| n == column)
            .ok_or_else(|| Error::UnknownVariable {
                contrast: owner.to_string(),
                variable: column.clone(),
            })?;
        row[j] += weight;
    }
    Ok(row)
}

/// Convert regressors and contrasts into matrices
///
/// # Arguments
/// * `regressors` - Column name and one value per subject
/// * `contrasts` - T and F contrasts referring to regressor names
///
/// # Returns
/// The design matrix and one contrast matrix per contrast, in input order
pub fn parse_design(
    regressors: &[(String, Vec<f64>)],
    contrasts: &[Contrast],
) -> Result<(DesignMatrix, ContrastMatrices)> {
    let Some((_, first)) = regressors.first() else {
        return Err(Error::Shape("design has no regressors".to_string()));
    };
    let n = first.len();
    if let Some((name, values)) = regressors.iter().find(|(_, v)| v.len() != n) {
        return Err(Error::Shape(format!(
            "regressor '{}' has {} values, expected {}",
            name,
            values.len(),
            n
        )));
    }

    let names: Vec<String> = regressors.iter().map(|(name, _)| name.clone()).collect();
    let matrix = DMatrix::from_fn(n, names.len(), |i, j| regressors[j].1[i]);

    let mut seen = HashSet::new();
    let mut matrices = Vec::with_capacity(contrasts.len());
    for contrast in contrasts {
        let name = contrast.name();
        if !seen.insert(name.to_string()) {
            return Err(Error::DuplicateContrast(name.to_string()));
        }
        let rows = match contrast {
            Contrast::T(t) => vec![contrast_row(t, &names, name)?],
            Contrast::F { contrasts, .. } => {
                if contrasts.is_empty() {
                    return Err(Error::InvalidContrast {
                        name: name.to_string(),
                        reason: "F contrast without T contrasts".to_string(),
                    });
                }
                contrasts
                    .iter()
                    .map(|t| contrast_row(t, &names, name))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let cmat = DMatrix::from_fn(rows.len(), names.len(), |i, j| rows[i][j]);
        matrices.push((name.to_string(), cmat));
    }

    Ok((DesignMatrix { names, matrix }, matrices))
}
