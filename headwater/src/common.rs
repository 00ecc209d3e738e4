//! Common table types shared by the template engine and the serializer.

use std::fmt;
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the relational table every template query runs against.
pub const TABLE_ALIAS: &str = "w";

/// Number of leading bookkeeping columns (`id`, `agg`) in SQUALL table files.
const SQUALL_META_COLUMNS: usize = 2;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum TableError {
    #[error("row {row} has {found} cells but the header has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("{found} type tags for {expected} header columns")]
    TypeCount { expected: usize, found: usize },

    #[error("column {column} has {found} values, expected {expected}")]
    RaggedColumns {
        column: usize,
        expected: usize,
        found: usize,
    },

    #[error("table file is missing the id/agg bookkeeping columns")]
    MissingMetadataColumns,

    #[error("failed to read table file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse table file: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Column Kinds & References
// ============================================================================

/// The two type buckets used for column substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Number,
}

impl ColumnKind {
    /// Classify a raw source type tag. Anything mentioning `num` or `time`
    /// (which also covers `timespan`) is numeric.
    pub fn classify(tag: &str) -> Self {
        let tag = tag.to_ascii_lowercase();
        if tag.contains("num") || tag.contains("time") {
            ColumnKind::Number
        } else {
            ColumnKind::Text
        }
    }
}

/// A parsed `c{n}` / `c{n}_{qualifier}` column identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Zero-based column position.
    pub index: usize,
    /// Everything after the first underscore, e.g. `list` in `c3_list`.
    pub qualifier: Option<String>,
}

impl ColumnRef {
    pub fn new(index: usize, qualifier: Option<String>) -> Self {
        Self { index, qualifier }
    }

    /// Parse a column identifier. Returns `None` for anything that is not
    /// `c` followed by a positive integer and an optional `_suffix`.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix('c')?;
        let (digits, qualifier) = match rest.split_once('_') {
            Some((digits, suffix)) if !suffix.is_empty() => (digits, Some(suffix.to_string())),
            Some(_) => return None,
            None => (rest, None),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let position: usize = digits.parse().ok()?;
        let index = position.checked_sub(1)?;
        Some(Self { index, qualifier })
    }

    /// The bare `c{n}` identifier.
    pub fn base_name(&self) -> String {
        column_name(self.index)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "c{}_{}", self.index + 1, q),
            None => write!(f, "c{}", self.index + 1),
        }
    }
}

/// Relational identifier of the column at zero-based `index`.
pub fn column_name(index: usize) -> String {
    format!("c{}", index + 1)
}

// ============================================================================
// Cells
// ============================================================================

/// A single table cell. The variant is fixed when the table is built so the
/// serializer never re-inspects the value to decide how to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Cell::Text(_))
    }

    /// The cell as it appears in a flattened table: integers as bare digits,
    /// text lower-cased.
    pub fn render(&self) -> String {
        match self {
            Cell::Text(s) => s.to_lowercase(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Integer(v) => write!(f, "{v}"),
            Cell::Real(v) => f.write_str(&format_real(*v)),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

/// Format a real keeping a trailing `.0` on whole numbers, so `3.0` does not
/// collapse into the integer `3` once written out.
pub fn format_real(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

// ============================================================================
// Table Model
// ============================================================================

/// In-memory table: display header, per-column type tags, aligned rows, and
/// the compound column identifiers (`c3_list`, `c3_number`, ...) the backing
/// store understands.
///
/// Every row has exactly `header.len()` cells and there is one type tag per
/// column; both are checked on construction and on deserialization.
/// Tables are never mutated in place: truncation, chunking and permutation
/// all produce new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTableModel")]
pub struct TableModel {
    header: Vec<String>,
    types: Vec<String>,
    rows: Vec<Vec<Cell>>,
    alias: IndexSet<String>,
}

#[derive(Deserialize)]
struct RawTableModel {
    header: Vec<String>,
    types: Vec<String>,
    rows: Vec<Vec<Cell>>,
    #[serde(default)]
    alias: IndexSet<String>,
}

impl TryFrom<RawTableModel> for TableModel {
    type Error = TableError;

    fn try_from(raw: RawTableModel) -> Result<Self, Self::Error> {
        TableModel::new(raw.header, raw.types, raw.rows, raw.alias)
    }
}

impl TableModel {
    pub fn new(
        header: Vec<String>,
        types: Vec<String>,
        rows: Vec<Vec<Cell>>,
        alias: IndexSet<String>,
    ) -> Result<Self, TableError> {
        if types.len() != header.len() {
            return Err(TableError::TypeCount {
                expected: header.len(),
                found: types.len(),
            });
        }
        if let Some((row, cells)) = rows
            .iter()
            .enumerate()
            .find(|(_, cells)| cells.len() != header.len())
        {
            return Err(TableError::RowWidth {
                row,
                expected: header.len(),
                found: cells.len(),
            });
        }
        Ok(Self {
            header,
            types,
            rows,
            alias,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn alias(&self) -> &IndexSet<String> {
        &self.alias
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.header.len()
    }

    pub fn column_kind(&self, col: usize) -> ColumnKind {
        ColumnKind::classify(&self.types[col])
    }

    /// Indices of every column in the given bucket, in column order.
    pub fn columns_of_kind(&self, kind: ColumnKind) -> Vec<usize> {
        (0..self.num_columns())
            .filter(|&col| self.column_kind(col) == kind)
            .collect()
    }

    pub fn column(&self, col: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().map(move |row| &row[col])
    }

    /// Same schema, different rows. Rows must come from this table (or have
    /// its width); that is what keeps the alignment invariant.
    pub(crate) fn with_rows(&self, rows: Vec<Vec<Cell>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == self.header.len()));
        Self {
            header: self.header.clone(),
            types: self.types.clone(),
            rows,
            alias: self.alias.clone(),
        }
    }

    /// Keep only the rows at the given zero-based positions, in table order.
    pub fn select_rows(&self, keep: &[usize]) -> Self {
        self.with_rows(keep.iter().map(|&i| self.rows[i].clone()).collect())
    }

    /// Shuffle column order; header, type tags and every row are permuted
    /// together. The alias set refers to backing-store columns and is kept.
    pub fn permute_columns<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..self.num_columns()).collect();
        order.shuffle(rng);
        Self {
            header: order.iter().map(|&i| self.header[i].clone()).collect(),
            types: order.iter().map(|&i| self.types[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| order.iter().map(|&i| row[i].clone()).collect())
                .collect(),
            alias: self.alias.clone(),
        }
    }
}

// ============================================================================
// SQUALL table files
// ============================================================================

/// One column of a SQUALL table file. Only the first entry per column (the
/// raw column) is used; derived entries such as `c3_number` live in the
/// relational store.
#[derive(Debug, Clone, Deserialize)]
pub struct SquallColumn {
    pub col: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<serde_json::Value>,
}

/// On-disk table layout: column-major contents with two leading
/// bookkeeping columns.
#[derive(Debug, Clone, Deserialize)]
pub struct SquallTable {
    pub headers: Vec<String>,
    pub types: Vec<String>,
    pub contents: Vec<Vec<SquallColumn>>,
    #[serde(default)]
    pub is_list: IndexMap<String, serde_json::Value>,
}

impl SquallTable {
    pub fn load(path: &Path) -> Result<Self, TableError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Normalize into a [`TableModel`]: lower-cased, newline-free header and
    /// cells, bookkeeping columns dropped, alias set taken from `is_list`.
    pub fn into_table(self) -> Result<TableModel, TableError> {
        if self.headers.len() < SQUALL_META_COLUMNS
            || self.types.len() < SQUALL_META_COLUMNS
            || self.contents.len() < SQUALL_META_COLUMNS
        {
            return Err(TableError::MissingMetadataColumns);
        }
        let header: Vec<String> = self.headers[SQUALL_META_COLUMNS..]
            .iter()
            .map(|h| normalize_text(h))
            .collect();
        let types = self.types[SQUALL_META_COLUMNS..].to_vec();

        let columns: Vec<Vec<Cell>> = self.contents[SQUALL_META_COLUMNS..]
            .iter()
            .map(|entries| {
                entries
                    .first()
                    .map(|c| c.data.iter().map(json_cell).collect())
                    .unwrap_or_default()
            })
            .collect();
        let num_rows = columns.first().map_or(0, Vec::len);
        if let Some((column, values)) = columns
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != num_rows)
        {
            return Err(TableError::RaggedColumns {
                column,
                expected: num_rows,
                found: values.len(),
            });
        }
        let rows = (0..num_rows)
            .map(|r| columns.iter().map(|col| col[r].clone()).collect())
            .collect();

        TableModel::new(header, types, rows, self.is_list.into_keys().collect())
    }
}

fn normalize_text(text: &str) -> String {
    text.replace('\n', " ").to_lowercase()
}

/// Stringify a raw JSON cell the way the table dumps spell values
/// (`None`, `True`, `3.0`), then normalize it.
fn json_cell(value: &serde_json::Value) -> Cell {
    let text = match value {
        serde_json::Value::Null => "None".to_string(),
        serde_json::Value::Bool(true) => "True".to_string(),
        serde_json::Value::Bool(false) => "False".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Cell::Text(normalize_text(&text))
}

// ============================================================================
// Tests
// ============================================================================
