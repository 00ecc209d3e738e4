//! Relational backing store for target tables.
//!
//! Template queries are validated by running them against a SQLite copy of
//! each table. Every table lives in its own database with a single table `w`
//! whose `id` column numbers the rows from 1.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{Cell, ColumnKind, TABLE_ALIAS, TableModel, column_name, format_real};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no backing store registered for table {0}")]
    UnknownTable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to stage database {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Values
// ============================================================================

/// One scalar from a result set.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("None"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => f.write_str(&format_real(*v)),
            SqlValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(s) | ValueRef::Blob(s) => {
                SqlValue::Text(String::from_utf8_lossy(s).into_owned())
            }
        }
    }
}

// ============================================================================
// Executor Trait
// ============================================================================

pub trait QueryExecutor: Send + Sync {
    /// Run `query` against the table's store and return every value of every
    /// result row, row-major.
    fn execute(&self, table_id: &str, query: &str) -> Result<Vec<SqlValue>, ExecutionError>;

    /// Delete rows by their 1-based row number. Numbers that are already gone
    /// are ignored.
    fn delete_rows(&self, table_id: &str, row_numbers: &BTreeSet<usize>)
    -> Result<(), ExecutionError>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// One SQLite connection per physical table. Connections are not `Sync`, so
/// each sits behind its own mutex; workers touching different tables never
/// contend.
#[derive(Default)]
pub struct SqliteExecutor {
    tables: HashMap<String, Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every `<table_id>.db` under `database_dir` into `scratch_dir` and
    /// open the copies, so row deletions never touch the originals.
    pub fn open_dir(database_dir: &Path, scratch_dir: &Path) -> Result<Self, ExecutionError> {
        fs::create_dir_all(scratch_dir).map_err(|source| ExecutionError::Staging {
            path: scratch_dir.to_path_buf(),
            source,
        })?;
        let entries = fs::read_dir(database_dir).map_err(|source| ExecutionError::Staging {
            path: database_dir.to_path_buf(),
            source,
        })?;

        let mut executor = Self::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ExecutionError::Staging {
                    path: database_dir.to_path_buf(),
                    source,
                })?
                .path();
            if path.extension().is_none_or(|ext| ext != "db") {
                continue;
            }
            let Some(table_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let staged = scratch_dir.join(path.file_name().unwrap_or_default());
            fs::copy(&path, &staged).map_err(|source| ExecutionError::Staging {
                path: staged.clone(),
                source,
            })?;
            executor.attach(table_id, &staged)?;
        }
        info!(
            "Staged {} table databases into {}",
            executor.len(),
            scratch_dir.display()
        );
        Ok(executor)
    }

    /// Open an existing database file for `table_id`. The file is used as is.
    pub fn attach(&mut self, table_id: &str, path: &Path) -> Result<(), ExecutionError> {
        let conn = Connection::open(path)?;
        self.tables.insert(table_id.to_string(), Mutex::new(conn));
        Ok(())
    }

    /// Build an in-memory store for `table`: `id`, `agg`, then one text
    /// column `c{i}` per column and, for numeric columns, a `c{i}_number`
    /// real column holding the parsed value (NULL when it does not parse).
    pub fn register_table(&mut self, table_id: &str, table: &TableModel) -> Result<(), ExecutionError> {
        let conn = Connection::open_in_memory()?;

        let mut columns = vec!["id INTEGER PRIMARY KEY".to_string(), "agg INTEGER".to_string()];
        let mut numeric = Vec::new();
        for col in 0..table.num_columns() {
            columns.push(format!("{} TEXT", column_name(col)));
            if table.column_kind(col) == ColumnKind::Number {
                columns.push(format!("{}_number REAL", column_name(col)));
                numeric.push(col);
            }
        }
        conn.execute_batch(&format!(
            "CREATE TABLE {TABLE_ALIAS} ({});",
            columns.join(", ")
        ))?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        {
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {TABLE_ALIAS} VALUES ({placeholders})"
            ))?;
            for (i, row) in table.rows().iter().enumerate() {
                let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(columns.len());
                values.push(rusqlite::types::Value::Integer(i as i64 + 1));
                values.push(rusqlite::types::Value::Integer(0));
                for (col, cell) in row.iter().enumerate() {
                    values.push(rusqlite::types::Value::Text(cell.to_string()));
                    if numeric.contains(&col) {
                        values.push(numeric_value(cell));
                    }
                }
                stmt.execute(rusqlite::params_from_iter(values))?;
            }
        }

        debug!(
            table_id,
            rows = table.num_rows(),
            "registered in-memory table store"
        );
        self.tables.insert(table_id.to_string(), Mutex::new(conn));
        Ok(())
    }

    pub fn contains(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn connection(&self, table_id: &str) -> Result<&Mutex<Connection>, ExecutionError> {
        self.tables
            .get(table_id)
            .ok_or_else(|| ExecutionError::UnknownTable(table_id.to_string()))
    }
}

fn numeric_value(cell: &Cell) -> rusqlite::types::Value {
    match cell {
        Cell::Integer(v) => rusqlite::types::Value::Integer(*v),
        Cell::Real(v) => rusqlite::types::Value::Real(*v),
        Cell::Text(s) => s
            .trim()
            .replace(',', "")
            .parse::<f64>()
            .map(rusqlite::types::Value::Real)
            .unwrap_or(rusqlite::types::Value::Null),
    }
}

impl QueryExecutor for SqliteExecutor {
    fn execute(&self, table_id: &str, query: &str) -> Result<Vec<SqlValue>, ExecutionError> {
        let conn = self.connection(table_id)?.lock();
        let mut stmt = conn.prepare(query)?;
        let column_count = stmt.column_count();

        let mut values = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for i in 0..column_count {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
        }
        Ok(values)
    }

    fn delete_rows(
        &self,
        table_id: &str,
        row_numbers: &BTreeSet<usize>,
    ) -> Result<(), ExecutionError> {
        let mut conn = self.connection(table_id)?.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!("DELETE FROM {TABLE_ALIAS} WHERE id = ?1"))?;
            for &row in row_numbers {
                stmt.execute([row as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
