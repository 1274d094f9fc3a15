/// Generic tabular form of emitted trade and audit logs.
///
/// Submissions ship mandatory columns plus arbitrary extra indicator
/// columns, so logs are kept as string cells and parsed on demand. All
/// comparisons are tolerance-bounded on numeric cells and byte-exact
/// otherwise, which is the property the Determ and Anti-Leak gates check.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::types::{nearly_equal, HarnessError, Result};

/// Maximum differences reported per comparison; enough for an evidence
/// bundle without flooding it.
const MAX_REPORTED_DIFFS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct LogTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl LogTable {
    pub fn from_parts(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            HarnessError::Data(format!("cannot open log {}: {}", path.display(), e))
        })?;
        Self::from_csv_reader(file)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| HarnessError::Data(format!("bad log header: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| HarnessError::Data(format!("bad log row: {}", e)))?;
            let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(col)).map(|s| s.as_str())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.cell(row, col)
    }

    pub fn numeric(&self, row: usize, column: &str) -> Option<f64> {
        self.value(row, column)?.trim().parse::<f64>().ok()
    }

    /// All values of one column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let col = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[col].as_str()).collect())
    }

    /// Row index whose `column` cell equals `key`, if any.
    pub fn find_row(&self, column: &str, key: &str) -> Option<usize> {
        let col = self.column_index(column)?;
        self.rows.iter().position(|r| r[col] == key)
    }

    /// Compare against another table: numeric cells within `rel_tol`,
    /// everything else byte-exact. Returns human-readable differences,
    /// capped at MAX_REPORTED_DIFFS (plus header/length mismatches).
    pub fn diff(&self, other: &LogTable, rel_tol: f64) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.headers != other.headers {
            diffs.push(format!(
                "headers differ: {:?} vs {:?}",
                self.headers, other.headers
            ));
            return diffs;
        }
        if self.rows.len() != other.rows.len() {
            diffs.push(format!(
                "row count differs: {} vs {}",
                self.rows.len(),
                other.rows.len()
            ));
        }
        let rows = self.rows.len().min(other.rows.len());
        'outer: for row in 0..rows {
            for (col, header) in self.headers.iter().enumerate() {
                let a = self.rows[row][col].trim();
                let b = other.rows[row][col].trim();
                if !cells_equal(a, b, rel_tol) {
                    diffs.push(format!(
                        "row {} column {}: {:?} vs {:?}",
                        row, header, a, b
                    ));
                    if diffs.len() >= MAX_REPORTED_DIFFS {
                        break 'outer;
                    }
                }
            }
        }
        diffs
    }
}

fn cells_equal(a: &str, b: &str, rel_tol: f64) -> bool {
    if a == b {
        return true;
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => nearly_equal(x, y, rel_tol),
        _ => false,
    }
}
