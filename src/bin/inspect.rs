//! Inspect a synthesized output file: record counts, answer sizes, chunking,
//! flattened lengths, most used tables and a few sample records.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --input train.jsonl
//! cargo run --release --bin inspect -- --input train.jsonl --tokenizer facebook/bart-large --samples 3
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use clap::Parser;
use estuary::tokenizer::{WHITESPACE_TOKENIZER, load_budgeter};
use headwater::budget::TokenBudgeter;
use headwater::example::SynthesizedExample;
use indexmap::IndexMap;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(about = "Inspect a synthesized JSONL output file")]
struct Args {
    /// Output file written by `synthesize`.
    #[arg(long)]
    input: PathBuf,

    /// Tokenizer used to measure flattened inputs.
    #[arg(long, default_value = WHITESPACE_TOKENIZER)]
    tokenizer: String,

    /// Number of sample records to print (0 to skip).
    #[arg(long, default_value_t = 2)]
    samples: usize,

    /// Number of most used tables to list.
    #[arg(long, default_value_t = 10)]
    top_tables: usize,
}

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Default)]
struct Summary {
    records: usize,
    malformed: usize,
    placeholders: usize,
    permuted: usize,
    answer_sizes: BTreeMap<usize, usize>,
    chunk_counts: BTreeMap<usize, usize>,
    input_lengths: Vec<usize>,
    output_lengths: Vec<usize>,
    target_tables: IndexMap<String, usize>,
    source_tables: IndexMap<String, usize>,
    samples: Vec<SynthesizedExample>,
}

impl Summary {
    fn add(&mut self, record: SynthesizedExample, budgeter: &dyn TokenBudgeter, keep_samples: usize) {
        self.records += 1;
        if record.placeholder_answer {
            self.placeholders += 1;
        }
        if record.permuted {
            self.permuted += 1;
        }
        *self.answer_sizes.entry(record.output_answer.len()).or_default() += 1;
        *self.chunk_counts.entry(record.num_chunks).or_default() += 1;
        self.input_lengths
            .push(budgeter.count_tokens(&record.flattened_input));
        self.output_lengths
            .push(budgeter.count_tokens(&record.flattened_output));
        *self
            .target_tables
            .entry(record.target_table.clone())
            .or_default() += 1;
        *self
            .source_tables
            .entry(record.source_table.clone())
            .or_default() += 1;
        if self.samples.len() < keep_samples {
            self.samples.push(record);
        }
    }
}

/// (min, median, p99, max, mean) of a list of lengths.
fn length_stats(values: &[usize]) -> Option<(usize, usize, usize, usize, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let mean = sorted.iter().sum::<usize>() as f64 / n as f64;
    Some((
        sorted[0],
        sorted[n / 2],
        sorted[((n as f64 * 0.99) as usize).min(n - 1)],
        sorted[n - 1],
        mean,
    ))
}

fn most_used(counts: &IndexMap<String, usize>, top: usize) -> Vec<(&str, usize)> {
    let mut entries: Vec<(&str, usize)> = counts.iter().map(|(k, &v)| (k.as_str(), v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    entries.truncate(top);
    entries
}

fn print_lengths(label: &str, values: &[usize]) {
    match length_stats(values) {
        Some((min, median, p99, max, mean)) => println!(
            "│  {label:<8} min {min:>6}  median {median:>6}  p99 {p99:>6}  max {max:>6}  mean {mean:>9.1}"
        ),
        None => println!("│  {label:<8} (no records)"),
    }
}

fn print_histogram(counts: &BTreeMap<usize, usize>, total: usize) {
    for (&size, &count) in counts {
        let share = count as f64 / total.max(1) as f64;
        let bar = "#".repeat((share * 40.0).round() as usize);
        println!("│  {size:>4}  {count:>10}  {:>5.1}%  {bar}", share * 100.0);
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let budgeter = load_budgeter(&args.tokenizer)?;

    let reader = BufReader::new(File::open(&args.input)?);
    let mut summary = Summary::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SynthesizedExample>(&line) {
            Ok(record) => summary.add(record, budgeter.as_ref(), args.samples),
            Err(e) => {
                summary.malformed += 1;
                warn!("Line {}: {e}", line_no + 1);
            }
        }
    }

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Output: {}", args.input.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Records:       {:>10}", summary.records);
    println!("║  Placeholders:  {:>10}", summary.placeholders);
    println!("║  Permuted:      {:>10}", summary.permuted);
    println!("║  Malformed:     {:>10}", summary.malformed);
    println!("║  Target tables: {:>10}", summary.target_tables.len());
    println!("║  Source tables: {:>10}", summary.source_tables.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Answers & Chunks ─────────────────────────────────────────────────
    println!("┌─ Answer sizes");
    print_histogram(&summary.answer_sizes, summary.records);
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    println!("┌─ Chunks per input");
    print_histogram(&summary.chunk_counts, summary.records);
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Lengths ──────────────────────────────────────────────────────────
    println!("┌─ Flattened lengths ({} tokens)", args.tokenizer);
    print_lengths("input", &summary.input_lengths);
    print_lengths("output", &summary.output_lengths);
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Tables ───────────────────────────────────────────────────────────
    println!("┌─ Most used target tables");
    for (table_id, count) in most_used(&summary.target_tables, args.top_tables) {
        println!("│  {table_id:<24} {count:>10}");
    }
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    // ── Samples ──────────────────────────────────────────────────────────
    for (i, record) in summary.samples.iter().enumerate() {
        println!("┌─ Sample {i}: {} → {}", record.source_table, record.target_table);
        println!("│  template:   {}", record.template_sql);
        println!("│  executable: {}", record.executable_sql);
        println!("│  input sql:  {}", record.input_sql);
        println!("│  answer:     {:?}", record.output_answer);
        let preview: String = record.flattened_input.chars().take(300).collect();
        println!("│  input:      {preview}");
        if record.flattened_input.chars().count() > 300 {
            println!("│              ...");
        }
        println!("│  output:     {}", record.flattened_output);
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_stats() {
        assert_eq!(length_stats(&[]), None);
        let (min, median, p99, max, mean) = length_stats(&[4, 1, 3, 2]).unwrap();
        assert_eq!((min, median, p99, max), (1, 3, 4, 4));
        assert!((mean - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_most_used_orders_by_count_then_id() {
        let counts: IndexMap<String, usize> =
            [("b", 2), ("a", 2), ("c", 5), ("d", 1)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
        assert_eq!(most_used(&counts, 3), [("c", 5), ("a", 2), ("b", 2)]);
    }
}
