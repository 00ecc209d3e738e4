//! Outer synthesis loop: table pool, train/dev split and template fan-out.
//!
//! Source tables are kept as loaded; target tables are truncated once to the
//! input budget and the dropped rows are deleted from the backing store before
//! any template runs against them. Every template then draws random target
//! tables until it has produced enough accepted examples.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::budget::TokenBudgeter;
use crate::common::{SquallTable, TableError, TableModel};
use crate::example::{ExampleBuilder, ExampleConfig, ExampleSource, SynthesizedExample};
use crate::executor::{ExecutionError, QueryExecutor};
use crate::serializer::TableSerializer;
use crate::template::{InstantiationConfig, InstantiationError, TemplateEngine, TemplateRecord};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Split {
    /// Templates and targets outside the held-out set.
    #[default]
    Train,
    /// Only held-out templates, targeting held-out tables.
    Dev,
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "dev" => Ok(Split::Dev),
            other => Err(format!("unknown mode: {other} (expected train or dev)")),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => f.write_str("train"),
            Split::Dev => f.write_str("dev"),
        }
    }
}

/// Configuration for a synthesis run.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub split: Split,
    /// RNG seed; template `i` uses `seed + i`.
    pub seed: u64,
    /// Accepted examples wanted per template.
    pub instance_number: usize,
    /// Target draws per template are capped at this multiple of
    /// `instance_number`.
    pub max_draw_factor: usize,
    /// Tokens reserved for the query when truncating target tables.
    pub truncation_margin: usize,
    /// Templates processed in parallel before results are flushed.
    pub batch_size: usize,
    pub example: ExampleConfig,
    pub instantiation: InstantiationConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            split: Split::Train,
            seed: 42,
            instance_number: 500,
            max_draw_factor: 10,
            truncation_margin: 40,
            batch_size: 64,
            example: ExampleConfig::default(),
            instantiation: InstantiationConfig::default(),
        }
    }
}

impl SynthesisConfig {
    /// Token budget target tables are truncated to.
    pub fn table_budget(&self) -> usize {
        self.example
            .max_source_length
            .saturating_sub(self.truncation_margin)
    }
}

// ============================================================================
// Table Pool
// ============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store rejected truncation of table {table_id}: {source}")]
    Store {
        table_id: String,
        #[source]
        source: ExecutionError,
    },
}

/// Every table by id, in sorted id order: the untouched source copy, the
/// truncated target copy, and the rows dropped from the latter.
#[derive(Debug, Default)]
pub struct TablePool {
    source: IndexMap<String, TableModel>,
    target: IndexMap<String, TableModel>,
    dropped: IndexMap<String, BTreeSet<usize>>,
}

impl TablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` SQUALL table under `table_dir`. Malformed files are
    /// skipped with a warning.
    pub fn load_dir<R: Rng + ?Sized>(
        table_dir: &Path,
        serializer: &TableSerializer<'_>,
        budget: usize,
        rng: &mut R,
    ) -> Result<Self, PoolError> {
        let io_error = |source| PoolError::Io {
            path: table_dir.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(table_dir)
            .map_err(io_error)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(io_error)?;
        paths.retain(|p| p.extension().is_some_and(|ext| ext == "json"));
        paths.sort();

        let mut pool = Self::new();
        for path in &paths {
            let Some(table_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match SquallTable::load(path).and_then(SquallTable::into_table) {
                Ok(table) => pool.insert(table_id, table, serializer, budget, rng),
                Err(TableError::Io(source)) => {
                    return Err(PoolError::Io {
                        path: path.clone(),
                        source,
                    });
                }
                Err(err) => warn!("Skipping table {}: {err}", path.display()),
            }
        }

        info!(
            "Loaded {} tables from {} ({} truncated)",
            pool.len(),
            table_dir.display(),
            pool.dropped.values().filter(|rows| !rows.is_empty()).count()
        );
        Ok(pool)
    }

    /// Add a table, deriving its target copy by truncating to `budget`.
    pub fn insert<R: Rng + ?Sized>(
        &mut self,
        table_id: &str,
        table: TableModel,
        serializer: &TableSerializer<'_>,
        budget: usize,
        rng: &mut R,
    ) {
        let truncation = serializer.truncate_to_budget(&table, budget, rng);
        if !truncation.dropped_rows.is_empty() {
            debug!(
                table_id,
                dropped = truncation.dropped_rows.len(),
                rows = table.num_rows(),
                "truncated target table"
            );
        }
        self.source.insert(table_id.to_string(), table);
        self.target.insert(table_id.to_string(), truncation.table);
        self.dropped
            .insert(table_id.to_string(), truncation.dropped_rows);
    }

    /// Delete every truncated row from the backing store. Tables without a
    /// store are only warned about; they can still serve as sources.
    pub fn apply_truncation(&self, executor: &dyn QueryExecutor) -> Result<usize, PoolError> {
        let mut applied = 0;
        for (table_id, rows) in &self.dropped {
            if rows.is_empty() {
                continue;
            }
            match executor.delete_rows(table_id, rows) {
                Ok(()) => applied += 1,
                Err(ExecutionError::UnknownTable(_)) => {
                    warn!("No backing store for table {table_id}, truncation not applied");
                }
                Err(source) => {
                    return Err(PoolError::Store {
                        table_id: table_id.clone(),
                        source,
                    });
                }
            }
        }
        info!("Deleted truncated rows from {applied} table stores");
        Ok(applied)
    }

    pub fn source(&self, table_id: &str) -> Option<&TableModel> {
        self.source.get(table_id)
    }

    pub fn target(&self, table_id: &str) -> Option<&TableModel> {
        self.target.get(table_id)
    }

    pub fn dropped_rows(&self, table_id: &str) -> Option<&BTreeSet<usize>> {
        self.dropped.get(table_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.source.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

/// Read a JSON list of held-out table ids.
pub fn load_held_out_ids(path: &Path) -> Result<BTreeSet<String>, PoolError> {
    let bytes = std::fs::read(path).map_err(|source| PoolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| PoolError::Json {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    pub templates: usize,
    /// Templates whose source table is not in the pool.
    pub missing_source: usize,
    pub draws: usize,
    pub accepted: usize,
    pub placeholders: usize,
    pub records: usize,
    pub no_viable: usize,
    pub schema_mismatch: usize,
    pub unknown_column: usize,
}

impl SynthesisStats {
    pub fn merge(&mut self, other: &SynthesisStats) {
        self.templates += other.templates;
        self.missing_source += other.missing_source;
        self.draws += other.draws;
        self.accepted += other.accepted;
        self.placeholders += other.placeholders;
        self.records += other.records;
        self.no_viable += other.no_viable;
        self.schema_mismatch += other.schema_mismatch;
        self.unknown_column += other.unknown_column;
    }
}

// ============================================================================
// Synthesizer
// ============================================================================

pub struct Synthesizer<'a> {
    pool: &'a TablePool,
    executor: &'a dyn QueryExecutor,
    budgeter: &'a dyn TokenBudgeter,
    held_out: &'a BTreeSet<String>,
    config: SynthesisConfig,
}

impl<'a> Synthesizer<'a> {
    pub fn new(
        pool: &'a TablePool,
        executor: &'a dyn QueryExecutor,
        budgeter: &'a dyn TokenBudgeter,
        held_out: &'a BTreeSet<String>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            pool,
            executor,
            budgeter,
            held_out,
            config,
        }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Tables templates may be moved onto in this split.
    pub fn target_ids(&self) -> Vec<&'a str> {
        match self.config.split {
            Split::Train => self
                .pool
                .ids()
                .filter(|id| !self.held_out.contains(*id))
                .collect(),
            Split::Dev => self
                .held_out
                .iter()
                .map(String::as_str)
                .filter(|id| self.pool.target(id).is_some())
                .collect(),
        }
    }

    /// Whether a template belongs to this split.
    pub fn uses_template(&self, record: &TemplateRecord) -> bool {
        let held_out = self.held_out.contains(&record.tbl);
        match self.config.split {
            Split::Train => !held_out,
            Split::Dev => held_out,
        }
    }

    /// Run every template of this split. `sink` receives the records of each
    /// template in template order, together with the template's position.
    pub fn run<F, E>(&self, templates: &[TemplateRecord], mut sink: F) -> Result<SynthesisStats, E>
    where
        F: FnMut(usize, Vec<SynthesizedExample>) -> Result<(), E>,
    {
        let targets = self.target_ids();
        let selected: Vec<(usize, &TemplateRecord)> = templates
            .iter()
            .enumerate()
            .filter(|(_, record)| self.uses_template(record))
            .collect();
        info!(
            "Synthesizing {} mode: {} of {} templates, {} target tables",
            self.config.split,
            selected.len(),
            templates.len(),
            targets.len()
        );
        if targets.is_empty() {
            warn!("No target tables available for {} mode", self.config.split);
        }

        let mut stats = SynthesisStats::default();
        for batch in selected.chunks(self.config.batch_size.max(1)) {
            let results: Vec<(Vec<SynthesizedExample>, SynthesisStats)> = batch
                .par_iter()
                .map(|&(index, record)| self.synthesize_template(index, record, &targets))
                .collect();
            for (&(index, _), (records, template_stats)) in batch.iter().zip(results) {
                stats.merge(&template_stats);
                sink(index, records)?;
            }
        }

        info!(
            "Accepted {} instantiations ({} placeholders) in {} draws, wrote {} records",
            stats.accepted, stats.placeholders, stats.draws, stats.records
        );
        Ok(stats)
    }

    /// Draw target tables for one template until `instance_number` examples
    /// were accepted or the draw budget is spent.
    pub fn synthesize_template(
        &self,
        index: usize,
        record: &TemplateRecord,
        targets: &[&str],
    ) -> (Vec<SynthesizedExample>, SynthesisStats) {
        let mut stats = SynthesisStats {
            templates: 1,
            ..Default::default()
        };
        let mut records = Vec::new();
        let Some(source) = self.pool.source(&record.tbl) else {
            warn!("Template {index} references unknown table {}", record.tbl);
            stats.missing_source = 1;
            return (records, stats);
        };

        let mut rng = SmallRng::seed_from_u64(self.config.seed.wrapping_add(index as u64));
        let engine = TemplateEngine::new(self.executor, self.config.instantiation.clone());
        let builder = ExampleBuilder::new(
            self.budgeter,
            self.config.example.clone(),
            self.config.split,
        );

        let wanted = self.config.instance_number;
        let max_draws = wanted.saturating_mul(self.config.max_draw_factor);
        while stats.accepted < wanted && stats.draws < max_draws {
            let Some(&target_id) = targets.choose(&mut rng) else {
                break;
            };
            stats.draws += 1;
            let Some(target) = self.pool.target(target_id) else {
                continue;
            };

            match engine.instantiate(&record.sql, source, target_id, target, &mut rng) {
                Ok(instantiation) => {
                    stats.accepted += 1;
                    if instantiation.answer.is_placeholder() {
                        stats.placeholders += 1;
                    }
                    let example_source = ExampleSource {
                        template: &record.sql,
                        source_table: &record.tbl,
                        target_table: target_id,
                        target,
                    };
                    let built = builder.build(&example_source, &instantiation, &mut rng);
                    stats.records += built.len();
                    records.extend(built);
                }
                Err(InstantiationError::NoViableInstantiation { .. }) => {
                    stats.no_viable += 1;
                    debug!(template = index, target_id, "no viable instantiation");
                }
                Err(InstantiationError::SchemaMismatch { column, .. }) => {
                    stats.schema_mismatch += 1;
                    debug!(template = index, target_id, %column, "schema mismatch");
                }
                Err(err @ InstantiationError::UnknownColumn { .. }) => {
                    // The template does not fit its own source table; no
                    // target can fix that.
                    stats.unknown_column += 1;
                    warn!("Template {index} on table {}: {err}", record.tbl);
                    break;
                }
            }
        }

        if stats.accepted < wanted {
            debug!(
                template = index,
                accepted = stats.accepted,
                wanted,
                draws = stats.draws,
                "template fell short of its instance number"
            );
        }
        (records, stats)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::WhitespaceBudgeter;
    use crate::common::Cell;
    use crate::executor::SqliteExecutor;
    use indexmap::IndexSet;
    use std::convert::Infallible;

    fn table(header: [&str; 2], rows: &[[&str; 2]]) -> TableModel {
        TableModel::new(
            header.iter().map(|s| s.to_string()).collect(),
            vec!["text".into(), "number".into()],
            rows.iter()
                .map(|r| r.iter().map(|&c| Cell::from(c)).collect())
                .collect(),
            IndexSet::new(),
        )
        .unwrap()
    }

    fn fixture_tables() -> Vec<(&'static str, TableModel)> {
        vec![
            (
                "t_city",
                table(["city", "pop"], &[["nyc", "8"], ["la", "4"], ["sf", "1"]]),
            ),
            (
                "t_team",
                table(["team", "wins"], &[["reds", "90"], ["cubs", "71"]]),
            ),
            (
                "t_river",
                table(["river", "length"], &[["nile", "6650"], ["amazon", "6400"]]),
            ),
            (
                "t_words",
                TableModel::new(
                    vec!["word".into()],
                    vec!["text".into()],
                    vec![vec!["a".into()], vec!["b".into()]],
                    IndexSet::new(),
                )
                .unwrap(),
            ),
        ]
    }

    fn build_pool(budgeter: &WhitespaceBudgeter, budget: usize) -> (TablePool, SqliteExecutor) {
        let serializer = TableSerializer::new(budgeter);
        let mut rng = SmallRng::seed_from_u64(42);
        let mut pool = TablePool::new();
        let mut executor = SqliteExecutor::new();
        for (id, table) in fixture_tables() {
            executor.register_table(id, &table).unwrap();
            pool.insert(id, table, &serializer, budget, &mut rng);
        }
        pool.apply_truncation(&executor).unwrap();
        (pool, executor)
    }

    fn templates() -> Vec<TemplateRecord> {
        serde_json::from_str(
            r#"[
                {"tbl": "t_city", "nl": ["which", "city", "is", "biggest", "?"],
                 "sql": [["Keyword","select",[]],["Column","c1",[]],["Keyword","from",[]],["Keyword","w",[]],
                         ["Keyword","order",[]],["Keyword","by",[]],["Column","c2_number",[]],
                         ["Keyword","desc",[]],["Keyword","limit",[]],["Literal.Number","1",[]]]},
                {"tbl": "t_team", "nl": ["how", "many", "teams", "?"],
                 "sql": [["Keyword","select",[]],["Keyword","count",[]],["Keyword","(",[]],["Column","c1",[]],
                         ["Keyword",")",[]],["Keyword","from",[]],["Keyword","w",[]]]},
                {"tbl": "t_missing", "nl": [], "sql": [["Keyword","select",[]],["Keyword","1",[]]]}
            ]"#,
        )
        .unwrap()
    }

    fn collect(synthesizer: &Synthesizer<'_>) -> (Vec<(usize, SynthesizedExample)>, SynthesisStats) {
        let mut out = Vec::new();
        let stats = synthesizer
            .run(&templates(), |index, records| {
                out.extend(records.into_iter().map(|r| (index, r)));
                Ok::<(), Infallible>(())
            })
            .unwrap();
        (out, stats)
    }

    #[test]
    fn test_end_to_end_train() {
        let budgeter = WhitespaceBudgeter;
        let (pool, executor) = build_pool(&budgeter, 1000);
        let held_out = BTreeSet::from(["t_river".to_string()]);
        let config = SynthesisConfig {
            instance_number: 4,
            batch_size: 2,
            ..Default::default()
        };
        let synthesizer = Synthesizer::new(&pool, &executor, &budgeter, &held_out, config);

        assert_eq!(synthesizer.target_ids(), ["t_city", "t_team", "t_words"]);

        let (records, stats) = collect(&synthesizer);
        assert_eq!(stats.templates, 3);
        assert_eq!(stats.missing_source, 1);
        assert_eq!(stats.accepted, 8);
        assert_eq!(stats.records, records.len());
        // Template 0 comes before template 1 in the output.
        assert!(records.windows(2).all(|w| w[0].0 <= w[1].0));

        for (_, record) in &records {
            assert_ne!(record.target_table, "t_river");
            assert!(!record.output_answer.is_empty() && record.output_answer.len() <= 10);
            assert_eq!(record.num_chunks, 1);
            assert!(record.flattened_input.starts_with(&record.input_sql.to_lowercase()));
        }

        // The count template maps onto any text column and always answers.
        let counts: Vec<&SynthesizedExample> = records
            .iter()
            .filter(|(i, _)| *i == 1)
            .map(|(_, r)| r)
            .collect();
        assert_eq!(counts.len(), 4);
        for record in counts {
            let rows = pool.target(&record.target_table).unwrap().num_rows();
            assert_eq!(record.output_answer, [rows.to_string()]);
        }

        // The order-by template needs a numeric column, which t_words lacks.
        for (_, record) in records.iter().filter(|(i, _)| *i == 0) {
            assert_ne!(record.target_table, "t_words");
            assert!(record.executable_sql.contains("c2_number"));
        }
    }

    #[test]
    fn test_dev_mode_uses_held_out_only() {
        let budgeter = WhitespaceBudgeter;
        let (pool, executor) = build_pool(&budgeter, 1000);
        let held_out = BTreeSet::from(["t_city".to_string(), "t_river".to_string()]);
        let config = SynthesisConfig {
            split: Split::Dev,
            instance_number: 3,
            ..Default::default()
        };
        let synthesizer = Synthesizer::new(&pool, &executor, &budgeter, &held_out, config);

        assert_eq!(synthesizer.target_ids(), ["t_city", "t_river"]);
        let (records, stats) = collect(&synthesizer);
        assert_eq!(stats.templates, 1);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|(i, r)| *i == 0
            && r.source_table == "t_city"
            && (r.target_table == "t_city" || r.target_table == "t_river")));
    }

    #[test]
    fn test_runs_are_reproducible() {
        let budgeter = WhitespaceBudgeter;
        let held_out = BTreeSet::new();
        let config = SynthesisConfig {
            instance_number: 5,
            batch_size: 1,
            ..Default::default()
        };

        let (pool, executor) = build_pool(&budgeter, 1000);
        let first = collect(&Synthesizer::new(&pool, &executor, &budgeter, &held_out, config.clone()));
        let (pool, executor) = build_pool(&budgeter, 1000);
        let second = collect(&Synthesizer::new(&pool, &executor, &budgeter, &held_out, config));
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_rows_leave_the_store() {
        let budgeter = WhitespaceBudgeter;
        // Header "col : city | pop" is 5 tokens, each row 6: room for one row.
        let (pool, executor) = build_pool(&budgeter, 11);

        let target = pool.target("t_city").unwrap();
        let dropped = pool.dropped_rows("t_city").unwrap();
        assert_eq!(pool.source("t_city").unwrap().num_rows(), 3);
        assert_eq!(target.num_rows() + dropped.len(), 3);
        assert!(target.num_rows() <= 1);

        let stored = executor.execute("t_city", "select count(*) from w").unwrap();
        assert_eq!(stored[0].to_string(), target.num_rows().to_string());
    }

    #[test]
    fn test_load_dir_and_held_out_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("1_1.json"),
            r#"{"headers": ["id", "agg", "Name"], "types": ["", "", "text"],
                "contents": [[], [], [{"col": "c1", "type": "TEXT", "data": ["A", "B"]}]],
                "is_list": {}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("2_2.json"), r#"{"headers": []}"#).unwrap();
        std::fs::write(dir.path().join("ids.txt"), "[]").unwrap();

        let budgeter = WhitespaceBudgeter;
        let serializer = TableSerializer::new(&budgeter);
        let mut rng = SmallRng::seed_from_u64(0);
        let pool = TablePool::load_dir(dir.path(), &serializer, 100, &mut rng).unwrap();
        assert_eq!(pool.ids().collect::<Vec<_>>(), ["1_1"]);
        assert_eq!(pool.source("1_1").unwrap().rows()[1][0], Cell::from("b"));

        let ids_path = dir.path().join("dev.ids");
        std::fs::write(&ids_path, r#"["1_1", "9_9"]"#).unwrap();
        let ids = load_held_out_ids(&ids_path).unwrap();
        assert_eq!(ids, BTreeSet::from(["1_1".to_string(), "9_9".to_string()]));
        assert!(load_held_out_ids(&dir.path().join("nope.ids")).is_err());
    }

    #[test]
    fn test_split_parse() {
        assert_eq!("train".parse::<Split>(), Ok(Split::Train));
        assert_eq!("dev".parse::<Split>(), Ok(Split::Dev));
        assert!("test".parse::<Split>().is_err());
    }
}
