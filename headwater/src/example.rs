//! Turning an accepted instantiation into model input/output records.

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::budget::TokenBudgeter;
use crate::common::TableModel;
use crate::sampler::Split;
use crate::serializer::{
    CHUNK_SEPARATOR, RelevanceTerms, SplitMode, TableChunk, TableSerializer, flatten_with_query,
};
use crate::template::{Instantiation, Template};

/// Separator between answer values in `flattened_output`.
pub const ANSWER_SEPARATOR: &str = ", ";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExampleConfig {
    /// Token budget of one flattened chunk (query plus table).
    pub max_source_length: usize,
    /// Text cells with at least this many tokens get clipped.
    pub max_cell_length: usize,
    /// Token length clipped cells are cut down to.
    pub max_cell_truncate: usize,
    /// Chunks kept per example in train mode.
    pub max_chunks_train: usize,
    /// Chunks kept per example in dev mode.
    pub max_chunks_valid: usize,
    /// Column-shuffled copies emitted per train example.
    pub permutations: usize,
}

impl Default for ExampleConfig {
    fn default() -> Self {
        Self {
            max_source_length: 1024,
            max_cell_length: 15,
            max_cell_truncate: 15,
            max_chunks_train: 1,
            max_chunks_valid: 1,
            permutations: 0,
        }
    }
}

impl ExampleConfig {
    pub fn max_chunks(&self, split: Split) -> usize {
        match split {
            Split::Train => self.max_chunks_train,
            Split::Dev => self.max_chunks_valid,
        }
    }
}

// ============================================================================
// Output Record
// ============================================================================

/// One line of the output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedExample {
    pub template_sql: Template,
    pub executable_sql: String,
    pub input_sql: String,
    pub output_answer: Vec<String>,
    /// Set when `output_answer` is the `empty` sentinel of an intentionally
    /// unanswerable query.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder_answer: bool,
    /// Set on column-shuffled augmentation copies.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub permuted: bool,
    pub table: TableModel,
    /// Number of chunks joined into `flattened_input`.
    #[serde(default = "single_chunk")]
    pub num_chunks: usize,
    pub flattened_input: String,
    pub flattened_output: String,
    pub source_table: String,
    pub target_table: String,
}

fn single_chunk() -> usize {
    1
}

// ============================================================================
// Builder
// ============================================================================

/// Where an instantiation came from and which table it runs on.
pub struct ExampleSource<'a> {
    pub template: &'a Template,
    pub source_table: &'a str,
    pub target_table: &'a str,
    pub target: &'a TableModel,
}

pub struct ExampleBuilder<'a> {
    serializer: TableSerializer<'a>,
    config: ExampleConfig,
    split: Split,
}

impl<'a> ExampleBuilder<'a> {
    pub fn new(budgeter: &'a dyn TokenBudgeter, config: ExampleConfig, split: Split) -> Self {
        Self {
            serializer: TableSerializer::new(budgeter),
            config,
            split,
        }
    }

    /// Build the record for one accepted instantiation, followed by its
    /// permuted copies in train mode.
    pub fn build<R: Rng + ?Sized>(
        &self,
        source: &ExampleSource<'_>,
        instantiation: &Instantiation,
        rng: &mut R,
    ) -> Vec<SynthesizedExample> {
        let (table, remap) = self.serializer.truncate_cells(
            source.target,
            self.config.max_cell_length,
            self.config.max_cell_truncate,
        );
        let mut answer = instantiation.answer.values();
        if !instantiation.answer.is_placeholder() {
            remap.apply(&mut answer);
        }
        let query = instantiation.encoded.as_str();

        let chunks = self.chunk(&table, query, &answer, instantiation, source, rng);
        let inputs: Vec<String> = chunks.iter().map(|chunk| chunk.flatten(query)).collect();

        let flattened_output = answer
            .iter()
            .map(|v| v.to_lowercase())
            .collect::<Vec<_>>()
            .join(ANSWER_SEPARATOR);
        let record = SynthesizedExample {
            template_sql: source.template.clone(),
            executable_sql: instantiation.executable.clone(),
            input_sql: instantiation.encoded.clone(),
            output_answer: answer,
            placeholder_answer: instantiation.answer.is_placeholder(),
            permuted: false,
            table: source.target.clone(),
            num_chunks: inputs.len(),
            flattened_input: inputs.join(CHUNK_SEPARATOR).trim().to_string(),
            flattened_output,
            source_table: source.source_table.to_string(),
            target_table: source.target_table.to_string(),
        };

        let permutations = match self.split {
            Split::Train => self.config.permutations,
            Split::Dev => 0,
        };
        let mut records = Vec::with_capacity(1 + permutations);
        for _ in 0..permutations {
            let shuffled = table.permute_columns(rng);
            records.push(SynthesizedExample {
                flattened_input: flatten_with_query(query, &shuffled, 0),
                table: shuffled,
                num_chunks: 1,
                permuted: true,
                ..record.clone()
            });
        }
        records.insert(0, record);
        records
    }

    /// Chunk the table, shrinking and re-chunking once in train mode when
    /// there are too many chunks. Chunks past the limit are discarded.
    fn chunk<R: Rng + ?Sized>(
        &self,
        table: &TableModel,
        query: &str,
        answer: &[String],
        instantiation: &Instantiation,
        source: &ExampleSource<'_>,
        rng: &mut R,
    ) -> Vec<TableChunk> {
        let budget = self.config.max_source_length;
        let max_chunks = self.config.max_chunks(self.split).max(1);

        let mut chunked = self
            .serializer
            .split_into_chunks(table, query, budget, SplitMode::Greedy);

        if chunked.chunks.len() > max_chunks && self.split == Split::Train {
            let ceiling = if max_chunks == 1 { 1.05 } else { 1.1 };
            let drop_ratio = ceiling - chunked.coverage_ratio;
            let terms = relevance_terms(query, answer, instantiation);
            let shrunk = self
                .serializer
                .shrink_for_training(table, drop_ratio, &terms, rng);
            let mode = if max_chunks == 1 {
                SplitMode::Greedy
            } else {
                SplitMode::Average
            };
            chunked = self.serializer.split_into_chunks(&shrunk, query, budget, mode);
        }

        if chunked.chunks.len() > max_chunks {
            warn!(
                "Table {} has {} chunks, keeping the first {}",
                source.target_table,
                chunked.chunks.len(),
                max_chunks
            );
            chunked.chunks.truncate(max_chunks);
        }
        chunked.chunks
    }
}

/// Values a shrink must keep rows for: words of both query forms plus the
/// answer, unless the answer is a placeholder.
fn relevance_terms(
    query: &str,
    answer: &[String],
    instantiation: &Instantiation,
) -> RelevanceTerms {
    let terms = RelevanceTerms::new()
        .with_text(query)
        .with_text(&instantiation.executable);
    if instantiation.answer.is_placeholder() {
        terms
    } else {
        terms.with_answers(answer)
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
    use crate::common::tests::city_table;
    use crate::template::{Answer, TemplateToken};
    use indexmap::IndexSet;
    use rand::rngs::SmallRng;
    use std::collections::BTreeMap;

    fn select_city() -> Template {
        Template::new(vec![
            TemplateToken::keyword("select"),
            TemplateToken::column("c1"),
            TemplateToken::keyword("from"),
            TemplateToken::keyword("w"),
        ])
    }

    fn instantiation(answer: Answer) -> Instantiation {
        Instantiation {
            encoded: "select city".into(),
            executable: "select c1 from w".into(),
            answer,
            attempts: 1,
            column_mapping: BTreeMap::from([(0, 0)]),
        }
    }

    /// Single text column `v` with `rows` rows `r0`, `r1`, ...; each row
    /// costs 4 whitespace tokens, the header 3.
    fn tall_table(rows: usize) -> TableModel {
        TableModel::new(
            vec!["v".into()],
            vec!["text".into()],
            (0..rows).map(|i| vec![Cell::from(format!("r{i}"))]).collect(),
            IndexSet::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_build_single_chunk_record() {
        let budgeter = WhitespaceBudgeter;
        let builder = ExampleBuilder::new(&budgeter, ExampleConfig::default(), Split::Train);
        let template = select_city();
        let table = city_table();
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let mut rng = SmallRng::seed_from_u64(0);

        let records = builder.build(
            &source,
            &instantiation(Answer::Values(vec!["nyc".into(), "la".into()])),
            &mut rng,
        );
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(
            record.flattened_input,
            "select city col : city | pop row 1 : nyc | 8 row 2 : la | 4"
        );
        assert_eq!(record.flattened_output, "nyc, la");
        assert_eq!(record.output_answer, ["nyc", "la"]);
        assert!(!record.placeholder_answer);
        assert_eq!(record.num_chunks, 1);
        assert_eq!(record.target_table, "tgt");

        let json = serde_json::to_value(record).unwrap();
        assert!(json.get("placeholder_answer").is_none());
        assert_eq!(json["template_sql"][1], serde_json::json!(["Column", "c1", []]));
    }

    #[test]
    fn test_build_remaps_clipped_answers() {
        let budgeter = WhitespaceBudgeter;
        let config = ExampleConfig {
            max_cell_length: 3,
            max_cell_truncate: 2,
            ..Default::default()
        };
        let builder = ExampleBuilder::new(&budgeter, config, Split::Dev);
        let template = select_city();
        let table = TableModel::new(
            vec!["city".into()],
            vec!["text".into()],
            vec![vec!["saint louis park city".into()]],
            IndexSet::new(),
        )
        .unwrap();
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let mut rng = SmallRng::seed_from_u64(0);

        let records = builder.build(
            &source,
            &instantiation(Answer::Values(vec!["saint louis park city".into()])),
            &mut rng,
        );
        assert_eq!(records[0].output_answer, ["saint louis"]);
        assert_eq!(records[0].flattened_output, "saint louis");
        assert!(records[0].flattened_input.ends_with("row 1 : saint louis"));
        // The record keeps the unclipped table.
        assert_eq!(records[0].table, table);
    }

    #[test]
    fn test_build_placeholder_record() {
        let budgeter = WhitespaceBudgeter;
        let builder = ExampleBuilder::new(&budgeter, ExampleConfig::default(), Split::Train);
        let template = select_city();
        let table = city_table();
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let mut rng = SmallRng::seed_from_u64(0);

        let records = builder.build(&source, &instantiation(Answer::Placeholder), &mut rng);
        assert!(records[0].placeholder_answer);
        assert_eq!(records[0].output_answer, ["empty"]);
        assert_eq!(records[0].flattened_output, "empty");

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["placeholder_answer"], serde_json::json!(true));
    }

    #[test]
    fn test_build_chunks_dev_tables_without_shrinking() {
        let budgeter = WhitespaceBudgeter;
        let config = ExampleConfig {
            // query (2) + header (3) + three rows.
            max_source_length: 2 + 3 + 3 * 4,
            max_chunks_valid: 2,
            ..Default::default()
        };
        let builder = ExampleBuilder::new(&budgeter, config, Split::Dev);
        let template = select_city();
        let table = tall_table(9);
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let mut rng = SmallRng::seed_from_u64(0);

        let records = builder.build(
            &source,
            &instantiation(Answer::Values(vec!["r4".into()])),
            &mut rng,
        );
        let record = &records[0];
        // Three chunks were produced, the last one is discarded.
        assert_eq!(record.num_chunks, 2);
        assert_eq!(
            record.flattened_input,
            "select city col : v row 1 : r0 row 2 : r1 row 3 : r2 <chunk> \
             select city col : v row 4 : r3 row 5 : r4 row 6 : r5"
        );
    }

    #[test]
    fn test_build_shrinks_train_tables_around_the_answer() {
        let budgeter = WhitespaceBudgeter;
        let config = ExampleConfig {
            max_source_length: 2 + 3 + 5 * 4,
            ..Default::default()
        };
        let builder = ExampleBuilder::new(&budgeter, config, Split::Train);
        let template = select_city();
        let table = tall_table(30);
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };

        for seed in 0..8 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let records = builder.build(
                &source,
                &instantiation(Answer::Values(vec!["r20".into()])),
                &mut rng,
            );
            let record = &records[0];
            assert_eq!(record.num_chunks, 1);
            assert!(budgeter.count_tokens(&record.flattened_input) <= 25);
        }
    }

    #[test]
    fn test_build_permutations_in_train_only() {
        let budgeter = WhitespaceBudgeter;
        let config = ExampleConfig {
            permutations: 3,
            ..Default::default()
        };
        let template = select_city();
        let table = city_table();
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let answer = Answer::Values(vec!["nyc".into()]);
        let mut rng = SmallRng::seed_from_u64(4);

        let train = ExampleBuilder::new(&budgeter, config.clone(), Split::Train);
        let records = train.build(&source, &instantiation(answer.clone()), &mut rng);
        assert_eq!(records.len(), 4);
        assert!(!records[0].permuted);
        for record in &records[1..] {
            assert!(record.permuted);
            assert_eq!(record.flattened_output, "nyc");
            assert_eq!(record.table.num_columns(), 2);
            assert!(record.flattened_input.starts_with("select city col : "));
        }

        let dev = ExampleBuilder::new(&budgeter, config, Split::Dev);
        assert_eq!(dev.build(&source, &instantiation(answer), &mut rng).len(), 1);
    }

    #[test]
    fn test_chunk_count_ignores_separator_text_in_cells() {
        let budgeter = WhitespaceBudgeter;
        let builder = ExampleBuilder::new(&budgeter, ExampleConfig::default(), Split::Dev);
        let template = select_city();
        let table = TableModel::new(
            vec!["note".into()],
            vec!["text".into()],
            vec![vec!["a <chunk> b".into()], vec!["<chunk>".into()]],
            IndexSet::new(),
        )
        .unwrap();
        let source = ExampleSource {
            template: &template,
            source_table: "src",
            target_table: "tgt",
            target: &table,
        };
        let mut rng = SmallRng::seed_from_u64(0);

        let records = builder.build(
            &source,
            &instantiation(Answer::Values(vec!["<chunk>".into()])),
            &mut rng,
        );
        assert_eq!(records[0].num_chunks, 1);

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["num_chunks"], serde_json::json!(1));
        let mut legacy = json;
        legacy.as_object_mut().unwrap().remove("num_chunks");
        let parsed: SynthesizedExample = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.num_chunks, 1);
    }

    #[test]
    fn test_relevance_terms_cover_both_query_forms() {
        let answered = instantiation(Answer::Values(vec!["NYC".into()]));
        let terms = relevance_terms(&answered.encoded, &["nyc".to_string()], &answered);
        assert!(terms.contains("city"));
        assert!(terms.contains("c1"));
        assert!(terms.contains("nyc"));

        let placeholder = instantiation(Answer::Placeholder);
        let terms = relevance_terms(&placeholder.encoded, &["empty".to_string()], &placeholder);
        assert!(terms.contains("c1"));
        assert!(!terms.contains("empty"));
    }
}
