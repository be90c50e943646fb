//! Group-level design matrix construction
//!
//! Turns a covariate spreadsheet plus declarative variable and contrast
//! declarations into named regressors and an ordered list of T and F
//! contrasts. Categorical variables use treatment coding against their first
//! level; explicit level contrasts are resolved through least-squares means.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use log::{info, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::design::parse::{Contrast, TContrast};
use crate::design::spreadsheet::{is_missing, parse_number, Spreadsheet, SpreadsheetCache};
use crate::error::{Error, Result};
use crate::linalg;

/// Declared type of a spreadsheet column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableSpec {
    Id {
        name: String,
    },
    Continuous {
        name: String,
    },
    Categorical {
        name: String,
        #[serde(default)]
        levels: Option<Vec<String>>,
    },
}

impl VariableSpec {
    pub fn name(&self) -> &str {
        match self {
            VariableSpec::Id { name }
            | VariableSpec::Continuous { name }
            | VariableSpec::Categorical { name, .. } => name,
        }
    }
}

/// Declared contrast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContrastSpec {
    /// Add a model term for these variables and test it
    Infer { variable: Vec<String> },
    /// Linear combination of the least-squares means of one categorical variable
    T {
        name: String,
        variable: Vec<String>,
        values: BTreeMap<String, f64>,
    },
}

/// A model ready for the voxelwise fit
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    /// Regressor name and one value per subject, in column order
    pub regressors: Vec<(String, Vec<f64>)>,
    /// T contrasts first, then each F contrast preceded by its constituents
    pub contrasts: Vec<Contrast>,
    /// Zero-padded ordinals for `contrast_names`
    pub contrast_numbers: Vec<String>,
    /// Names of the T and F contrasts, without F constituents
    pub contrast_names: Vec<String>,
}

/// Design with a single intercept column of `n` ones
pub fn intercept_only(n: usize) -> Design {
    Design {
        regressors: vec![("intercept".to_string(), vec![1.0; n])],
        contrasts: vec![Contrast::T(TContrast {
            name: "intercept".to_string(),
            columns: vec!["intercept".to_string()],
            weights: vec![1.0],
        })],
        contrast_numbers: vec!["01".to_string()],
        contrast_names: vec!["intercept".to_string()],
    }
}

// ============================================================================
// Data frame preparation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Column {
    /// Demeaned values, missing entries set to zero
    Continuous(Vec<f64>),
    /// Level index per subject, levels in coding order
    Categorical { codes: Vec<usize>, levels: Vec<String> },
}

impl Column {
    fn n_unique(&self) -> usize {
        match self {
            Column::Continuous(values) => {
                let mut sorted = values.clone();
                sorted.sort_by(f64::total_cmp);
                sorted.dedup();
                sorted.len()
            }
            Column::Categorical { codes, .. } => codes.iter().collect::<HashSet<_>>().len(),
        }
    }

    /// Coded design columns: (suffix, value per subject)
    fn coding(&self, name: &str) -> Vec<(String, Vec<f64>)> {
        match self {
            Column::Continuous(values) => vec![(name.to_string(), values.clone())],
            Column::Categorical { codes, levels } => levels
                .iter()
                .enumerate()
                .skip(1)
                .map(|(k, level)| {
                    let indicator = codes.iter().map(|&c| if c == k { 1.0 } else { 0.0 }).collect();
                    (format!("{}[T.{}]", name, level), indicator)
                })
                .collect(),
        }
    }
}

fn strip_subject_prefix(id: &str) -> &str {
    let id = id.trim();
    id.strip_prefix("sub-").unwrap_or(id)
}

/// Subset the spreadsheet to `subjects` and type its columns
fn prepare_columns(
    sheet: &Spreadsheet,
    variables: &[VariableSpec],
    subjects: &[String],
) -> Result<Vec<(String, Column)>> {
    let id_name = variables
        .iter()
        .find_map(|v| match v {
            VariableSpec::Id { name } => Some(name.as_str()),
            _ => None,
        })
        .ok_or(Error::MissingIdColumn)?;
    let ids = sheet
        .column(id_name)
        .ok_or_else(|| Error::Spreadsheet(format!("id column '{}' not found", id_name)))?;

    let mut row_of: HashMap<&str, usize> = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        row_of.entry(strip_subject_prefix(id)).or_insert(i);
    }
    let rows = subjects
        .iter()
        .map(|s| {
            row_of
                .get(strip_subject_prefix(s))
                .copied()
                .ok_or_else(|| Error::MissingSubject(s.clone()))
        })
        .collect::<Result<Vec<usize>>>()?;

    let mut columns = Vec::new();
    for variable in variables {
        let name = variable.name();
        let Some(j) = sheet.column_index(name) else {
            continue;
        };
        let cells: Vec<&str> = rows.iter().map(|&i| sheet.rows[i][j].as_str()).collect();

        match variable {
            VariableSpec::Id { .. } => {}
            VariableSpec::Continuous { .. } => {
                let values = cells
                    .iter()
                    .map(|cell| {
                        if is_missing(cell) {
                            Ok(f64::NAN)
                        } else {
                            parse_number(cell).ok_or_else(|| {
                                Error::Spreadsheet(format!(
                                    "non-numeric value '{}' in continuous column '{}'",
                                    cell, name
                                ))
                            })
                        }
                    })
                    .collect::<Result<Vec<f64>>>()?;
                columns.push((name.to_string(), Column::Continuous(demean_impute(&values))));
            }
            VariableSpec::Categorical { levels, .. } => {
                if let Some(column) = categorical_column(&cells, levels.as_deref()) {
                    columns.push((name.to_string(), column));
                } else {
                    warn!("Categorical variable \"{}\" has no valid values", name);
                }
            }
        }
    }
    Ok(columns)
}

/// Subtract the mean of the finite values, then set missing values to zero
fn demean_impute(values: &[f64]) -> Vec<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let mean = if finite.is_empty() {
        0.0
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };
    values
        .iter()
        .map(|&v| if v.is_finite() { v - mean } else { 0.0 })
        .collect()
}

/// Level codes with unknown values imputed by the most frequent level
fn categorical_column(cells: &[&str], declared: Option<&[String]>) -> Option<Column> {
    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| {
            let c = c.trim();
            if is_missing(c) {
                return None;
            }
            match declared {
                Some(levels) if !levels.iter().any(|l| l == c) => None,
                _ => Some(c.to_string()),
            }
        })
        .collect();

    // declared order, or sorted, restricted to levels that occur
    let mut levels: Vec<String> = match declared {
        Some(levels) => levels
            .iter()
            .filter(|l| values.iter().any(|v| v.as_deref() == Some(l.as_str())))
            .cloned()
            .collect(),
        None => {
            let mut unique: Vec<String> = values.iter().flatten().cloned().collect();
            unique.sort();
            unique.dedup();
            unique
        }
    };
    levels.dedup();
    if levels.is_empty() {
        return None;
    }

    let mut counts = vec![0usize; levels.len()];
    let mut codes: Vec<Option<usize>> = Vec::with_capacity(values.len());
    for v in &values {
        let code = v.as_ref().and_then(|v| levels.iter().position(|l| l == v));
        if let Some(k) = code {
            counts[k] += 1;
        }
        codes.push(code);
    }

    // ties go to the first level in order
    let mode = counts
        .iter()
        .enumerate()
        .fold(0, |best, (k, &c)| if c > counts[best] { k } else { best });

    Some(Column::Categorical {
        codes: codes.into_iter().map(|c| c.unwrap_or(mode)).collect(),
        levels,
    })
}

// ============================================================================
// Model terms
// ============================================================================

struct Term {
    name: String,
    variables: Vec<String>,
}

struct ModelMatrix {
    column_names: Vec<String>,
    /// Term name and its column range
    term_slices: Vec<(String, std::ops::Range<usize>)>,
    matrix: DMatrix<f64>,
}

fn term_codings(term: &Term, columns: &HashMap<&str, &Column>) -> Vec<(String, Vec<f64>)> {
    let mut coded: Vec<(String, Vec<f64>)> = Vec::new();
    for variable in &term.variables {
        let Some(column) = columns.get(variable.as_str()) else {
            continue;
        };
        let factor = column.coding(variable);
        coded = if coded.is_empty() {
            factor
        } else {
            coded
                .iter()
                .flat_map(|(left_name, left)| {
                    factor.iter().map(move |(right_name, right)| {
                        let values = left.iter().zip(right).map(|(a, b)| a * b).collect();
                        (format!("{}:{}", left_name, right_name), values)
                    })
                })
                .collect()
        };
    }
    coded
}

fn build_model_matrix(terms: &[Term], columns: &HashMap<&str, &Column>, n: usize) -> ModelMatrix {
    let mut column_names = vec!["Intercept".to_string()];
    let mut values = vec![vec![1.0; n]];
    let mut term_slices = vec![("Intercept".to_string(), 0..1)];

    for term in terms {
        let start = column_names.len();
        for (name, column) in term_codings(term, columns) {
            column_names.push(name);
            values.push(column);
        }
        term_slices.push((term.name.clone(), start..column_names.len()));
    }

    let matrix = DMatrix::from_fn(n, column_names.len(), |i, j| values[j][i]);
    ModelMatrix {
        column_names,
        term_slices,
        matrix,
    }
}

fn check_multicollinearity(matrix: &DMatrix<f64>) {
    info!("Checking for multicollinearity in the model..");

    let Some((min_singular, max_singular)) = linalg::singular_value_range(matrix) else {
        warn!("Could not compute singular values of the group-level design matrix");
        return;
    };
    let rank = linalg::rank(matrix);
    info!("max_singular={} min_singular={} rank={}", max_singular, min_singular, rank);

    let tolerance = f64::EPSILON * max_singular * matrix.nrows().max(matrix.ncols()) as f64;
    if min_singular <= tolerance {
        warn!(
            "Detected multicollinearity in the computed group-level analysis model. \
             Please double-check your model design."
        );
    }
}

/// Least-squares means: one design row per level of `variable`
///
/// Averages the design rows of a grid that crosses every categorical level
/// with continuous covariates at their mean (zero after demeaning).
fn lsmeans(
    variable: &str,
    columns: &[(String, Column)],
    terms: &[Term],
    lookup: &HashMap<&str, &Column>,
) -> Vec<(String, Vec<f64>)> {
    let factors: Vec<(&str, Vec<Option<usize>>)> = columns
        .iter()
        .map(|(name, column)| match column {
            Column::Continuous(_) => (name.as_str(), vec![None]),
            Column::Categorical { levels, .. } => (name.as_str(), (0..levels.len()).map(Some).collect()),
        })
        .collect();

    // cartesian product of factor settings
    let mut grid: Vec<Vec<Option<usize>>> = vec![Vec::new()];
    for (_, settings) in &factors {
        grid = grid
            .iter()
            .flat_map(|point| {
                settings.iter().map(move |s| {
                    let mut next = point.clone();
                    next.push(*s);
                    next
                })
            })
            .collect();
    }

    let grid_columns: Vec<(String, Column)> = columns
        .iter()
        .enumerate()
        .map(|(f, (name, column))| {
            let grid_column = match column {
                Column::Continuous(_) => Column::Continuous(vec![0.0; grid.len()]),
                Column::Categorical { levels, .. } => Column::Categorical {
                    codes: grid.iter().map(|p| p[f].unwrap_or(0)).collect(),
                    levels: levels.clone(),
                },
            };
            (name.clone(), grid_column)
        })
        .collect();
    let grid_lookup: HashMap<&str, &Column> = grid_columns.iter().map(|(n, c)| (n.as_str(), c)).collect();
    let reference = build_model_matrix(terms, &grid_lookup, grid.len());

    let Some(f) = factors.iter().position(|(name, _)| *name == variable) else {
        return Vec::new();
    };
    let Some(Column::Categorical { levels, .. }) = lookup.get(variable) else {
        return Vec::new();
    };

    levels
        .iter()
        .enumerate()
        .map(|(k, level)| {
            let rows: Vec<usize> = (0..grid.len()).filter(|&i| grid[i][f] == Some(k)).collect();
            let mut mean = vec![0.0; reference.matrix.ncols()];
            for &i in &rows {
                for (j, m) in mean.iter_mut().enumerate() {
                    *m += reference.matrix[(i, j)];
                }
            }
            for m in mean.iter_mut() {
                *m /= rows.len().max(1) as f64;
            }
            (level.clone(), mean)
        })
        .collect()
}

/// Upper-case the first character and lower-case the rest
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn make_contrast_list(
    column_names: &[String],
    matrices: &[(String, Vec<Vec<f64>>)],
) -> Result<(Vec<Contrast>, Vec<String>, Vec<String>)> {
    let mut contrasts = Vec::new();
    let mut names = Vec::new();
    let mut seen = HashSet::new();

    let mut register = |name: &str| -> Result<()> {
        if !seen.insert(name.to_string()) {
            return Err(Error::DuplicateContrast(name.to_string()));
        }
        Ok(())
    };

    let t_contrast = |name: String, row: &[f64]| TContrast {
        name,
        columns: column_names.to_vec(),
        weights: row.to_vec(),
    };

    for (name, rows) in matrices.iter().filter(|(_, rows)| rows.len() == 1) {
        let name = capitalize(name);
        register(&name)?;
        contrasts.push(Contrast::T(t_contrast(name.clone(), &rows[0])));
        names.push(name);
    }

    for (name, rows) in matrices.iter().filter(|(_, rows)| rows.len() > 1) {
        let name = capitalize(name);
        register(&name)?;
        let mut constituents = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let t_name = format!("{}_{}", name, i);
            register(&t_name)?;
            constituents.push(t_contrast(t_name, row));
        }
        contrasts.extend(constituents.iter().cloned().map(Contrast::T));
        contrasts.push(Contrast::F {
            name: name.clone(),
            contrasts: constituents,
        });
        names.push(name);
    }

    let numbers = (1..=names.len()).map(|i| format!("{:02}", i)).collect();
    Ok((contrasts, numbers, names))
}

// ============================================================================
// Public API
// ============================================================================

/// Build the group-level design from a spreadsheet file
///
/// # Arguments
/// * `spreadsheet` - Path of the covariate table
/// * `contrasts` - Declared contrasts, in output order
/// * `variables` - Declared column types, one of them the subject id
/// * `subjects` - Subjects of the analysis, which also fixes the row order
/// * `cache` - Parsed spreadsheets owned by the caller
pub fn group_design(
    spreadsheet: &Path,
    contrasts: &[ContrastSpec],
    variables: &[VariableSpec],
    subjects: &[String],
    cache: &mut SpreadsheetCache,
) -> Result<Design> {
    let sheet = cache.load(spreadsheet)?;
    group_design_from_table(&sheet, contrasts, variables, subjects)
}

/// Build the group-level design from an already parsed table
pub fn group_design_from_table(
    sheet: &Spreadsheet,
    contrasts: &[ContrastSpec],
    variables: &[VariableSpec],
    subjects: &[String],
) -> Result<Design> {
    let n = subjects.len();
    let all_columns = prepare_columns(sheet, variables, subjects)?;

    let varies: HashMap<&str, bool> = all_columns
        .iter()
        .map(|(name, column)| (name.as_str(), column.n_unique() > 1))
        .collect();
    let declared: HashSet<&str> = variables.iter().map(VariableSpec::name).collect();

    // zero-variance columns do not enter the model
    let columns: Vec<(String, Column)> = all_columns
        .iter()
        .filter(|(name, _)| varies.get(name.as_str()).copied().unwrap_or(false))
        .cloned()
        .collect();
    let lookup: HashMap<&str, &Column> = columns.iter().map(|(n, c)| (n.as_str(), c)).collect();

    let mut terms: Vec<Term> = Vec::new();
    for contrast in contrasts {
        let ContrastSpec::Infer { variable } = contrast else {
            continue;
        };
        let name = variable.join(":");
        for v in variable {
            if !declared.contains(v.as_str()) || !varies.contains_key(v.as_str()) {
                return Err(Error::UnknownVariable {
                    contrast: name.clone(),
                    variable: v.clone(),
                });
            }
        }
        if !variable.iter().all(|v| varies[v.as_str()]) {
            warn!(
                "Not adding term \"{}\" to design matrix because it has zero variance",
                name
            );
            continue;
        }
        if terms.iter().any(|t| t.name == name) {
            continue;
        }
        terms.push(Term {
            name,
            variables: variable.clone(),
        });
    }

    let model = build_model_matrix(&terms, &lookup, n);
    check_multicollinearity(&model.matrix);

    let mut matrices: Vec<(String, Vec<Vec<f64>>)> = Vec::new();
    for (term_name, slice) in &model.term_slices {
        let rows: Vec<Vec<f64>> = slice
            .clone()
            .map(|j| {
                let mut row = vec![0.0; model.column_names.len()];
                row[j] = 1.0;
                row
            })
            .collect();
        if rows.is_empty() {
            continue;
        }
        let name = if term_name == "Intercept" {
            "intercept".to_string()
        } else {
            term_name.clone()
        };
        matrices.push((name, rows));
    }

    for contrast in contrasts {
        let ContrastSpec::T { name, variable, values } = contrast else {
            continue;
        };
        let [variable] = variable.as_slice() else {
            return Err(Error::InvalidContrast {
                name: name.clone(),
                reason: format!("expected exactly one variable, got {}", variable.len()),
            });
        };
        if !declared.contains(variable.as_str()) || !varies.contains_key(variable.as_str()) {
            return Err(Error::UnknownVariable {
                contrast: name.clone(),
                variable: variable.clone(),
            });
        }
        match lookup.get(variable.as_str()) {
            Some(Column::Categorical { .. }) => {}
            Some(Column::Continuous(_)) => {
                return Err(Error::InvalidContrast {
                    name: name.clone(),
                    reason: format!("variable '{}' is not categorical", variable),
                })
            }
            None => {
                warn!(
                    "Not adding contrast \"{}\" because variable \"{}\" has zero variance",
                    name, variable
                );
                continue;
            }
        }

        let mut vector = vec![0.0; model.column_names.len()];
        for (level, mean) in lsmeans(variable, &columns, &terms, &lookup) {
            if let Some(&weight) = values.get(&level) {
                for (v, m) in vector.iter_mut().zip(&mean) {
                    *v += weight * m;
                }
            }
        }
        matrices.push((name.clone(), vec![vector]));
    }

    let (npts, nevs) = model.matrix.shape();
    if nevs >= npts {
        warn!(
            "Reverting to simple intercept only design. nevs ({}) >= npts ({})",
            nevs, npts
        );
        return Ok(intercept_only(n));
    }

    let (contrast_list, contrast_numbers, contrast_names) = make_contrast_list(&model.column_names, &matrices)?;
    let regressors = model
        .column_names
        .iter()
        .enumerate()
        .map(|(j, name)| (name.clone(), model.matrix.column(j).iter().copied().collect()))
        .collect();

    Ok(Design {
        regressors,
        contrasts: contrast_list,
        contrast_numbers,
        contrast_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::spreadsheet::parse_spreadsheet;
    use approx::assert_abs_diff_eq;

    fn variables() -> Vec<VariableSpec> {
        vec![
            VariableSpec::Id { name: "id".to_string() },
            VariableSpec::Continuous { name: "age".to_string() },
            VariableSpec::Categorical {
                name: "group".to_string(),
                levels: None,
            },
        ]
    }

    fn sheet() -> Spreadsheet {
        parse_spreadsheet(
            "id,age,group\n\
             sub-01,20,control\n\
             sub-02,30,patient\n\
             sub-03,40,control\n\
             sub-04,n/a,patient\n\
             sub-05,50,patient\n\
             sub-06,60,control\n",
            Some("csv"),
        )
        .unwrap()
    }

    fn subjects(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("0{}", i)).collect()
    }

    fn infer(vars: &[&str]) -> ContrastSpec {
        ContrastSpec::Infer {
            variable: vars.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_intercept_only() {
        let design = intercept_only(3);
        assert_eq!(design.regressors, vec![("intercept".to_string(), vec![1.0; 3])]);
        assert_eq!(design.contrast_numbers, vec!["01"]);
        assert_eq!(design.contrast_names, vec!["intercept"]);
        assert!(matches!(&design.contrasts[0], Contrast::T(t) if t.weights == vec![1.0]));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("age"), "Age");
        assert_eq!(capitalize("groupA"), "Groupa");
        assert_eq!(capitalize("intercept"), "Intercept");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_continuous_covariate_is_demeaned_and_imputed() {
        let design =
            group_design_from_table(&sheet(), &[infer(&["age"])], &variables(), &subjects(6)).unwrap();
        let names: Vec<&str> = design.regressors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Intercept", "age"]);

        let age = &design.regressors[1].1;
        // mean of the observed ages is 40, the missing age becomes the mean
        assert_abs_diff_eq!(age[0], -20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(age[3], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(age.iter().sum::<f64>(), 0.0, epsilon = 1e-9);

        assert_eq!(design.contrast_names, vec!["Intercept", "Age"]);
        assert_eq!(design.contrast_numbers, vec!["01", "02"]);
    }

    #[test]
    fn test_categorical_treatment_coding_and_lsmeans_contrast() {
        let mut values = BTreeMap::new();
        values.insert("patient".to_string(), 1.0);
        values.insert("control".to_string(), -1.0);
        let contrasts = vec![
            infer(&["group"]),
            ContrastSpec::T {
                name: "patientVsControl".to_string(),
                variable: vec!["group".to_string()],
                values,
            },
        ];
        let design = group_design_from_table(&sheet(), &contrasts, &variables(), &subjects(6)).unwrap();

        let names: Vec<&str> = design.regressors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Intercept", "group[T.patient]"]);
        assert_eq!(design.regressors[1].1, vec![0.0, 1.0, 0.0, 1.0, 1.0, 0.0]);

        let Contrast::T(t) = &design.contrasts[2] else {
            panic!("expected a T contrast");
        };
        assert_eq!(t.name, "Patientvscontrol");
        assert_abs_diff_eq!(t.weights[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.weights[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_multi_level_factor_becomes_f_contrast() {
        let sheet = parse_spreadsheet(
            "id,site\n01,a\n02,b\n03,c\n04,a\n05,b\n06,c\n",
            Some("csv"),
        )
        .unwrap();
        let variables = vec![
            VariableSpec::Id { name: "id".to_string() },
            VariableSpec::Categorical {
                name: "site".to_string(),
                levels: None,
            },
        ];
        let design = group_design_from_table(&sheet, &[infer(&["site"])], &variables, &subjects(6)).unwrap();

        // Intercept (T), Site_0, Site_1, Site (F)
        assert_eq!(design.contrasts.len(), 4);
        assert_eq!(design.contrast_names, vec!["Intercept", "Site"]);
        match &design.contrasts[3] {
            Contrast::F { name, contrasts } => {
                assert_eq!(name, "Site");
                assert_eq!(contrasts.len(), 2);
                assert_eq!(contrasts[0].name, "Site_0");
            }
            other => panic!("expected an F contrast, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_variance_term_is_skipped() {
        let sheet = parse_spreadsheet("id,age,sex\n01,20,m\n02,30,m\n03,40,m\n04,50,m\n", Some("csv")).unwrap();
        let variables = vec![
            VariableSpec::Id { name: "id".to_string() },
            VariableSpec::Continuous { name: "age".to_string() },
            VariableSpec::Categorical {
                name: "sex".to_string(),
                levels: None,
            },
        ];
        let design =
            group_design_from_table(&sheet, &[infer(&["age"]), infer(&["sex"])], &variables, &subjects(4)).unwrap();
        let names: Vec<&str> = design.regressors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Intercept", "age"]);
    }

    #[test]
    fn test_declared_levels_filter_values() {
        let column = categorical_column(
            &["a", "b", "x", "b"],
            Some(&["b".to_string(), "a".to_string()]),
        )
        .unwrap();
        // "x" is not a declared level and is imputed with the mode "b"
        assert_eq!(
            column,
            Column::Categorical {
                codes: vec![1, 0, 0, 0],
                levels: vec!["b".to_string(), "a".to_string()],
            }
        );
    }

    #[test]
    fn test_interaction_term() {
        let design = group_design_from_table(
            &sheet(),
            &[infer(&["age"]), infer(&["group"]), infer(&["age", "group"])],
            &variables(),
            &subjects(6),
        )
        .unwrap();
        let names: Vec<&str> = design.regressors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Intercept", "age", "group[T.patient]", "age:group[T.patient]"]);
    }

    #[test]
    fn test_non_identifiable_falls_back_to_intercept_only() {
        let sheet = parse_spreadsheet(
            "id,a,b,c,d,e\n01,1,5,2,7,1\n02,2,3,9,1,4\n03,4,1,3,2,8\n",
            Some("csv"),
        )
        .unwrap();
        let mut variables = vec![VariableSpec::Id { name: "id".to_string() }];
        let mut contrasts = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            variables.push(VariableSpec::Continuous { name: name.to_string() });
            contrasts.push(infer(&[name]));
        }
        let design = group_design_from_table(&sheet, &contrasts, &variables, &subjects(3)).unwrap();
        assert_eq!(design, intercept_only(3));
    }

    #[test]
    fn test_errors() {
        let no_id = vec![VariableSpec::Continuous { name: "age".to_string() }];
        assert!(matches!(
            group_design_from_table(&sheet(), &[], &no_id, &subjects(2)),
            Err(Error::MissingIdColumn)
        ));

        assert!(matches!(
            group_design_from_table(&sheet(), &[], &variables(), &["99".to_string()]),
            Err(Error::MissingSubject(_))
        ));

        assert!(matches!(
            group_design_from_table(&sheet(), &[infer(&["height"])], &variables(), &subjects(6)),
            Err(Error::UnknownVariable { .. })
        ));

        let mut values = BTreeMap::new();
        values.insert("control".to_string(), 1.0);
        let duplicate = vec![
            infer(&["age"]),
            ContrastSpec::T {
                name: "age".to_string(),
                variable: vec!["group".to_string()],
                values,
            },
        ];
        assert!(matches!(
            group_design_from_table(&sheet(), &duplicate, &variables(), &subjects(6)),
            Err(Error::DuplicateContrast(_))
        ));
    }

    #[test]
    fn test_spec_serde() {
        let json = r#"[{"type": "id", "name": "id"}, {"type": "categorical", "name": "group", "levels": ["a", "b"]}]"#;
        let variables: Vec<VariableSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(variables[1].name(), "group");

        let json = r#"{"type": "t", "name": "aVsB", "variable": ["group"], "values": {"a": 1, "b": -1}}"#;
        let contrast: ContrastSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(contrast, ContrastSpec::T { .. }));
    }
}
