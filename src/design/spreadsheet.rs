//! Covariate spreadsheet reader
//!
//! Accepts the loosely formatted tables people export from spreadsheet
//! programs: comma, semicolon, tab or whitespace separated, with or without
//! a header row, optionally with a comment prefix on every line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ReaderBuilder, Trim};

use crate::cache::BoundedCache;
use crate::error::{Error, Result};

/// Characters that may prefix every line as a comment marker
const COMMENT_CHARS: &[char] = &['$', '%', '^', '#', '/', '\\'];

/// Candidate delimiters tried when the extension does not decide
const SNIFF_DELIMITERS: &[u8] = &[b',', b'\t', b';', b'|'];

/// A parsed table of trimmed string cells
#[derive(Debug, Clone, PartialEq)]
pub struct Spreadsheet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Spreadsheet {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All cells of a column, in row order
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let j = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row[j].as_str()).collect())
    }
}

/// True for cells that spreadsheet programs use to mean "no value"
pub fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty()
        || ["n/a", "na", "nan", "null", "none"]
            .iter()
            .any(|m| cell.eq_ignore_ascii_case(m))
}

/// Parse a cell as a number, `None` for missing or non-numeric cells
pub fn parse_number(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return None;
    }
    cell.trim().parse::<f64>().ok()
}

/// Read and parse a spreadsheet file
pub fn read_spreadsheet(path: &Path) -> Result<Spreadsheet> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let text = String::from_utf8_lossy(&bytes);
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    parse_spreadsheet(&text, extension.as_deref())
        .map_err(|e| match e {
            Error::Spreadsheet(msg) => Error::Spreadsheet(format!("'{}': {}", path.display(), msg)),
            other => other,
        })
}

/// Parse spreadsheet text
///
/// # Arguments
/// * `text` - File contents
/// * `extension` - Lower-case file extension used to pick the delimiter
pub fn parse_spreadsheet(text: &str, extension: Option<&str>) -> Result<Spreadsheet> {
    // non-ASCII characters, including byte order marks
    let ascii: String = text.chars().filter(|c| c.is_ascii()).collect();

    let mut lines: Vec<&str> = ascii
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return Err(Error::Spreadsheet("no data".to_string()));
    }

    let prefix_len = lines[0]
        .chars()
        .take_while(|c| COMMENT_CHARS.contains(c))
        .count();
    if prefix_len > 0 {
        let prefix = lines[0][..prefix_len].to_string();
        lines = lines
            .into_iter()
            .map(|l| l.strip_prefix(prefix.as_str()).unwrap_or(l))
            .filter(|l| !l.trim().is_empty())
            .collect();
    }

    let mut cells = match choose_delimiter(&lines, extension) {
        Some(delimiter) => split_delimited(&lines, delimiter)?,
        None => lines
            .iter()
            .map(|l| l.split_whitespace().map(str::to_string).collect())
            .collect(),
    };

    let width = cells.iter().map(Vec::len).max().unwrap_or(0);
    for row in cells.iter_mut() {
        row.resize(width, String::new());
    }

    let (columns, rows) = if has_header(&cells) {
        let mut rows = cells;
        let header = rows.remove(0);
        (header, rows)
    } else {
        ((0..width).map(|j| j.to_string()).collect(), cells)
    };

    Ok(Spreadsheet { columns, rows })
}

fn choose_delimiter(lines: &[&str], extension: Option<&str>) -> Option<u8> {
    match extension {
        Some("tsv") => return Some(b'\t'),
        Some("csv") => {
            let commas = lines[0].matches(',').count();
            let semicolons = lines[0].matches(';').count();
            return Some(if semicolons > commas { b';' } else { b',' });
        }
        _ => {}
    }

    // a delimiter that occurs equally often on every line
    let mut best: Option<(u8, usize)> = None;
    for &d in SNIFF_DELIMITERS {
        let count = lines[0].bytes().filter(|&b| b == d).count();
        if count == 0 {
            continue;
        }
        let consistent = lines.iter().all(|l| l.bytes().filter(|&b| b == d).count() == count);
        if consistent && best.map_or(true, |(_, c)| count > c) {
            best = Some((d, count));
        }
    }
    best.map(|(d, _)| d)
}

fn split_delimited(lines: &[&str], delimiter: u8) -> Result<Vec<Vec<String>>> {
    let joined = lines.join("\n");
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(joined.as_bytes());

    let mut rows = Vec::with_capacity(lines.len());
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|s| s.trim().to_string()).collect());
    }
    Ok(rows)
}

fn float_score(row: &[String]) -> f64 {
    if row.is_empty() {
        return 0.0;
    }
    let numeric = row.iter().filter(|c| c.trim().parse::<f64>().is_ok()).count();
    numeric as f64 / row.len() as f64
}

/// A first line with fewer numeric cells than the rest is a header
fn has_header(rows: &[Vec<String>]) -> bool {
    if rows.len() < 2 {
        return true;
    }
    let first = float_score(&rows[0]);
    let rest = rows[1..].iter().map(|r| float_score(r)).sum::<f64>() / (rows.len() - 1) as f64;
    first < rest
}

/// Caller-owned memo of parsed spreadsheets keyed by path
#[derive(Debug)]
pub struct SpreadsheetCache {
    inner: BoundedCache<PathBuf, Spreadsheet>,
}

impl SpreadsheetCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: BoundedCache::new(capacity),
        }
    }

    /// Load a spreadsheet, parsing the file only on the first request
    pub fn load(&mut self, path: &Path) -> Result<Arc<Spreadsheet>> {
        self.inner
            .get_or_try_insert_with(&path.to_path_buf(), || read_spreadsheet(path))
    }

    pub fn invalidate(&mut self, path: &Path) -> bool {
        self.inner.invalidate(&path.to_path_buf())
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for SpreadsheetCache {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_with_header() {
        let sheet = parse_spreadsheet("id,age,group\nsub-01,23,a\nsub-02,31,b\n", Some("csv")).unwrap();
        assert_eq!(sheet.columns, vec!["id", "age", "group"]);
        assert_eq!(sheet.n_rows(), 2);
        assert_eq!(sheet.column("age").unwrap(), vec!["23", "31"]);
    }

    #[test]
    fn test_semicolon_csv() {
        let sheet = parse_spreadsheet("id;age\n01;23,5\n02;31\n", Some("csv")).unwrap();
        assert_eq!(sheet.columns, vec!["id", "age"]);
        assert_eq!(sheet.rows[0], vec!["01", "23,5"]);
    }

    #[test]
    fn test_tsv_strips_bom_and_blank_lines() {
        let text = "\u{feff}id\tage\n\n01\t23\n  \n02\t31\n";
        let sheet = parse_spreadsheet(text, Some("tsv")).unwrap();
        assert_eq!(sheet.columns, vec!["id", "age"]);
        assert_eq!(sheet.n_rows(), 2);
    }

    #[test]
    fn test_comment_prefix_is_removed() {
        let text = "# id age\n# 01 23\n# 02 31\n";
        let sheet = parse_spreadsheet(text, None).unwrap();
        assert_eq!(sheet.columns, vec!["id", "age"]);
        assert_eq!(sheet.rows[1], vec!["02", "31"]);
    }

    #[test]
    fn test_whitespace_without_header() {
        let sheet = parse_spreadsheet("1 2.5\n2 3.5\n3 4.5\n", Some("txt")).unwrap();
        assert_eq!(sheet.columns, vec!["0", "1"]);
        assert_eq!(sheet.n_rows(), 3);
    }

    #[test]
    fn test_sniffs_delimiter() {
        let sheet = parse_spreadsheet("id|score\na|1\nb|2\n", None).unwrap();
        assert_eq!(sheet.columns, vec!["id", "score"]);
        assert_eq!(sheet.column("score").unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let sheet = parse_spreadsheet("id,age,group\n01,23\n02,31,b\n", Some("csv")).unwrap();
        assert_eq!(sheet.rows[0], vec!["01", "23", ""]);
    }

    #[test]
    fn test_missing_and_numbers() {
        assert!(is_missing(""));
        assert!(is_missing(" n/a "));
        assert!(is_missing("NaN"));
        assert!(!is_missing("0"));
        assert_eq!(parse_number(" 2.5 "), Some(2.5));
        assert_eq!(parse_number("abc"), None);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(parse_spreadsheet("\n\n", None), Err(Error::Spreadsheet(_))));
    }

    #[test]
    fn test_cache_reads_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covariates.csv");
        std::fs::write(&path, "id,age\n01,20\n02,30\n").unwrap();

        let mut cache = SpreadsheetCache::new(2);
        let first = cache.load(&path).unwrap();

        // a changed file is not re-read until invalidated
        std::fs::write(&path, "id,age\n01,99\n").unwrap();
        let second = cache.load(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(&path));
        let third = cache.load(&path).unwrap();
        assert_eq!(third.n_rows(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
