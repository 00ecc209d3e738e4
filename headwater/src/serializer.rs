//! Table-to-text linearization under a token budget.
//!
//! Tables are flattened as `col : h1 | h2 row 1 : v1 | v2 row 2 : ...`. When a
//! table is too long for the model input, rows are thinned out
//! ([`TableSerializer::truncate_to_budget`]), long cells are clipped
//! ([`TableSerializer::truncate_cells`]), the table is split into row-range
//! chunks ([`TableSerializer::split_into_chunks`]) and, for training only,
//! rows unrelated to the answer are dropped before re-chunking
//! ([`TableSerializer::shrink_for_training`]).

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use rand::prelude::*;
use tracing::{debug, warn};

use crate::budget::TokenBudgeter;
use crate::common::{Cell, TableModel};

/// Separator between flattened chunks of one example.
pub const CHUNK_SEPARATOR: &str = " <chunk> ";

/// Extra per-chunk slack, in tokens, allowed by [`SplitMode::Average`].
const AVERAGE_CHUNK_SLACK: usize = 100;

/// Rows within this distance of a relevant row are never shrunk away.
const RELEVANT_NEIGHBORHOOD: usize = 2;

/// Shrink ratios at or above this are worth a warning.
const LARGE_SHRINK_RATIO: f64 = 0.1;

// ============================================================================
// Flattening (pure)
// ============================================================================

fn header_text(table: &TableModel) -> String {
    format!("col : {} ", table.header().join(" | ")).to_lowercase()
}

/// One rendered row without its trailing separator. This is the unit the
/// budget arithmetic is done in.
fn row_text(row: &[Cell], number: usize) -> String {
    let cells: Vec<String> = row.iter().map(Cell::render).collect();
    format!("row {number} : {}", cells.join(" | "))
}

/// Flatten `table`, numbering its first row `start_row + 1`.
pub fn flatten(table: &TableModel, start_row: usize) -> String {
    let mut text = header_text(table);
    for (i, row) in table.rows().iter().enumerate() {
        text.push_str(&row_text(row, start_row + i + 1));
        text.push(' ');
    }
    text
}

fn normalize_query(query: &str) -> String {
    query.to_lowercase().trim().to_string()
}

/// The model input for one chunk: normalized query followed by the table.
pub fn flatten_with_query(query: &str, table: &TableModel, start_row: usize) -> String {
    format!("{} {}", normalize_query(query), flatten(table, start_row))
        .trim()
        .to_string()
}

// ============================================================================
// Result Types
// ============================================================================

/// Output of [`TableSerializer::truncate_to_budget`].
#[derive(Debug, Clone)]
pub struct Truncation {
    pub table: TableModel,
    /// 1-based numbers of every discarded row, matching the `id` column of
    /// the backing store.
    pub dropped_rows: BTreeSet<usize>,
}

/// Original cell text to its clipped replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellRemap(IndexMap<String, String>);

impl CellRemap {
    pub fn get(&self, original: &str) -> Option<&str> {
        self.0.get(original).map(String::as_str)
    }

    /// Rewrite every value that was clipped in the table.
    pub fn apply(&self, values: &mut [String]) {
        for value in values.iter_mut() {
            if let Some(clipped) = self.0.get(value.as_str()) {
                *value = clipped.clone();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitMode {
    /// Pack every chunk up to the full budget.
    #[default]
    Greedy,
    /// Cap chunks near an even share of the rows.
    Average,
}

impl FromStr for SplitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(SplitMode::Greedy),
            "average" => Ok(SplitMode::Average),
            other => Err(format!("unknown split mode: {other}")),
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitMode::Greedy => f.write_str("greedy"),
            SplitMode::Average => f.write_str("average"),
        }
    }
}

/// A contiguous row range of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChunk {
    /// Rows of earlier chunks; the chunk's first row is numbered
    /// `start_row + 1` when flattened.
    pub start_row: usize,
    pub table: TableModel,
}

impl TableChunk {
    pub fn flatten(&self, query: &str) -> String {
        flatten_with_query(query, &self.table, self.start_row)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkedTable {
    pub chunks: Vec<TableChunk>,
    /// Budget divided by the token cost of the whole unsplit input.
    pub coverage_ratio: f64,
}

/// Lower-cased words a row must contain (as a whole cell) to count as
/// relevant to an example.
#[derive(Debug, Clone, Default)]
pub struct RelevanceTerms(HashSet<String>);

impl RelevanceTerms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers<S: AsRef<str>>(mut self, answers: &[S]) -> Self {
        self.0
            .extend(answers.iter().map(|a| a.as_ref().trim().to_lowercase()));
        self
    }

    /// Add every word of `text`, stripped of quotes and punctuation.
    pub fn with_text(mut self, text: &str) -> Self {
        self.0.extend(
            text.split_whitespace()
                .map(|w| w.trim_matches(|c: char| "'\"?!.,()".contains(c)).to_lowercase())
                .filter(|w| !w.is_empty()),
        );
        self
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Serializer
// ============================================================================

pub struct TableSerializer<'a> {
    budgeter: &'a dyn TokenBudgeter,
}

impl<'a> TableSerializer<'a> {
    pub fn new(budgeter: &'a dyn TokenBudgeter) -> Self {
        Self { budgeter }
    }

    pub fn budgeter(&self) -> &'a dyn TokenBudgeter {
        self.budgeter
    }

    fn cost(&self, text: &str) -> usize {
        self.budgeter.count_tokens(text)
    }

    fn value_cost(&self, table: &TableModel) -> usize {
        table
            .rows()
            .iter()
            .enumerate()
            .map(|(i, row)| self.cost(&row_text(row, i + 1)))
            .sum()
    }

    /// Thin `table` out until it fits `budget` tokens.
    ///
    /// Each row is dropped independently with the estimated drop rate; the
    /// first kept row that no longer fits ends the table, and every row from
    /// there on is discarded as well.
    pub fn truncate_to_budget<R: Rng + ?Sized>(
        &self,
        table: &TableModel,
        budget: usize,
        rng: &mut R,
    ) -> Truncation {
        let header_cost = self.cost(&header_text(table));
        let value_cost = self.value_cost(table);
        if header_cost + value_cost <= budget {
            return Truncation {
                table: table.clone(),
                dropped_rows: BTreeSet::new(),
            };
        }

        let mut remaining = budget as i64 - header_cost as i64;
        let drop_rate = if value_cost == 0 {
            0.0
        } else {
            1.0 - remaining as f64 / value_cost as f64
        };

        let mut keep = Vec::new();
        let mut dropped_rows = BTreeSet::new();
        for (i, row) in table.rows().iter().enumerate() {
            if drop_rate > 0.0 && rng.random::<f64>() < drop_rate {
                dropped_rows.insert(i + 1);
                continue;
            }
            let cost = self.cost(&row_text(row, keep.len() + 1)) as i64;
            if cost > remaining {
                dropped_rows.extend(i + 1..=table.num_rows());
                break;
            }
            keep.push(i);
            remaining -= cost;
        }

        debug!(
            kept = keep.len(),
            dropped = dropped_rows.len(),
            drop_rate,
            "truncated table to budget"
        );
        Truncation {
            table: table.select_rows(&keep),
            dropped_rows,
        }
    }

    /// Clip every text cell of at least `max_cell_tokens` tokens to its first
    /// `truncate_to` tokens. Numeric and blank cells are left alone.
    pub fn truncate_cells(
        &self,
        table: &TableModel,
        max_cell_tokens: usize,
        truncate_to: usize,
    ) -> (TableModel, CellRemap) {
        let mut remap: IndexMap<String, String> = IndexMap::new();
        let rows: Vec<Vec<Cell>> = table
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Cell::Text(text) if !text.trim().is_empty() => {
                            if let Some(clipped) = remap.get(text) {
                                return Cell::Text(String::clone(clipped));
                            }
                            let tokens = self.budgeter.tokenize(text);
                            if tokens.len() < max_cell_tokens {
                                return cell.clone();
                            }
                            let clipped = self
                                .budgeter
                                .detokenize(&tokens[..truncate_to.min(tokens.len())]);
                            remap.insert(text.clone(), clipped.clone());
                            Cell::Text(clipped)
                        }
                        _ => cell.clone(),
                    })
                    .collect()
            })
            .collect();
        (table.with_rows(rows), CellRemap(remap))
    }

    /// Split `table` into row-range chunks that each fit `max_total_tokens`
    /// together with `query`.
    ///
    /// Rows keep their order; a row too long for an empty chunk is dropped.
    /// The result always holds at least one chunk.
    pub fn split_into_chunks(
        &self,
        table: &TableModel,
        query: &str,
        max_total_tokens: usize,
        mode: SplitMode,
    ) -> ChunkedTable {
        let fixed_cost = self.cost(&normalize_query(query))
            + self.cost(&header_text(table))
            + self.budgeter.special_tokens();
        let value_cost = self.value_cost(table);
        let coverage_ratio = max_total_tokens as f64 / (fixed_cost + value_cost).max(1) as f64;

        if value_cost + fixed_cost <= max_total_tokens {
            return ChunkedTable {
                chunks: vec![TableChunk {
                    start_row: 0,
                    table: table.clone(),
                }],
                coverage_ratio: 1.0,
            };
        }
        let Some(remaining) = max_total_tokens.checked_sub(fixed_cost).filter(|&r| r > 0) else {
            warn!(
                fixed_cost,
                max_total_tokens, "header and query alone exceed the budget"
            );
            return ChunkedTable {
                chunks: vec![TableChunk {
                    start_row: 0,
                    table: table.with_rows(Vec::new()),
                }],
                coverage_ratio,
            };
        };

        let chunk_count = value_cost.div_ceil(remaining);
        let capacity = match mode {
            SplitMode::Greedy => remaining,
            SplitMode::Average => {
                remaining.min(AVERAGE_CHUNK_SLACK + value_cost.div_ceil(chunk_count))
            }
        };

        let mut chunks = Vec::new();
        let mut emitted = 0;
        let mut current: Vec<Vec<Cell>> = Vec::new();
        let mut left = capacity;
        for row in table.rows() {
            let cost = self.cost(&row_text(row, emitted + current.len() + 1));
            if cost > remaining {
                debug!(cost, remaining, "row does not fit an empty chunk, dropped");
                continue;
            }
            // A row above the balanced capacity still gets a chunk to itself.
            if cost > left && !current.is_empty() {
                let rows = std::mem::take(&mut current);
                let start_row = emitted;
                emitted += rows.len();
                chunks.push(TableChunk {
                    start_row,
                    table: table.with_rows(rows),
                });
                left = capacity;
            }
            current.push(row.clone());
            left = left.saturating_sub(cost);
        }
        if !current.is_empty() || chunks.is_empty() {
            chunks.push(TableChunk {
                start_row: emitted,
                table: table.with_rows(current),
            });
        }

        debug!(
            chunks = chunks.len(),
            expected = chunk_count,
            %mode,
            coverage_ratio,
            "split table into chunks"
        );
        ChunkedTable {
            chunks,
            coverage_ratio,
        }
    }

    /// Randomly delete up to `round(rows * drop_ratio)` rows that share no
    /// value with `terms`. Rows within two positions of a relevant row are
    /// kept.
    pub fn shrink_for_training<R: Rng + ?Sized>(
        &self,
        table: &TableModel,
        drop_ratio: f64,
        terms: &RelevanceTerms,
        rng: &mut R,
    ) -> TableModel {
        let num_rows = table.num_rows();
        let mut protected = vec![false; num_rows];
        for (i, row) in table.rows().iter().enumerate() {
            if row.iter().any(|cell| terms.contains(&cell.render())) {
                let lo = i.saturating_sub(RELEVANT_NEIGHBORHOOD);
                let hi = (i + RELEVANT_NEIGHBORHOOD).min(num_rows - 1);
                protected[lo..=hi].fill(true);
            }
        }

        let pool: Vec<usize> = (0..num_rows).filter(|&i| !protected[i]).collect();
        let target = (num_rows as f64 * drop_ratio.max(0.0)).round() as usize;
        let drop: HashSet<usize> = pool
            .choose_multiple(rng, target.min(pool.len()))
            .copied()
            .collect();

        if drop_ratio >= LARGE_SHRINK_RATIO {
            warn!(
                "Shrinking table by {} of {} rows (drop ratio {:.2})",
                drop.len(),
                num_rows,
                drop_ratio
            );
        }

        let keep: Vec<usize> = (0..num_rows).filter(|i| !drop.contains(i)).collect();
        table.select_rows(&keep)
    }
}

// ============================================================================
// Tests
// ============================================================================
