//! Re-target one template onto one table and print every intermediate form:
//! the truncated table, the executable and encoded queries, the answer and
//! the flattened input/output of each record.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin single_sample -- --index 12 --target 204_56
//! cargo run --release --bin single_sample -- --index 0 --tokenizer whitespace --mode dev
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use estuary::tokenizer::{WHITESPACE_TOKENIZER, load_budgeter};
use headwater::common::{SquallTable, TableModel};
use headwater::example::{ExampleBuilder, ExampleConfig, ExampleSource};
use headwater::executor::SqliteExecutor;
use headwater::sampler::Split;
use headwater::serializer::{TableSerializer, flatten};
use headwater::template::{InstantiationConfig, TemplateEngine, load_templates};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Instantiate a single template on a single table")]
struct Args {
    /// Template file providing the SQL queries.
    #[arg(long, default_value = "squall/data.json")]
    template_file: PathBuf,

    /// Position of the template in the template file.
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Directory of SQUALL table JSON files.
    #[arg(long, default_value = "squall/tables/json")]
    table_dir: PathBuf,

    /// Table to run the template on. Defaults to the template's own table.
    #[arg(long)]
    target: Option<String>,

    #[arg(long, default_value_t = Split::Train)]
    mode: Split,

    #[arg(long, default_value_t = 1024)]
    max_source_length: usize,

    #[arg(long, default_value_t = 40)]
    truncation_margin: usize,

    #[arg(long, default_value_t = 0.0)]
    unexecutable_prob: f64,

    #[arg(long, default_value_t = 0)]
    permute_table: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value = WHITESPACE_TOKENIZER)]
    tokenizer: String,
}

fn load_table(table_dir: &Path, table_id: &str) -> Result<TableModel, Box<dyn std::error::Error + Send + Sync>> {
    let path = table_dir.join(format!("{table_id}.json"));
    Ok(SquallTable::load(&path)?.into_table()?)
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut rng = SmallRng::seed_from_u64(args.seed);

    let templates = load_templates(&args.template_file)?;
    let record = templates.get(args.index).ok_or_else(|| {
        format!(
            "template index {} out of range ({} templates)",
            args.index,
            templates.len()
        )
    })?;
    let target_id = args.target.clone().unwrap_or_else(|| record.tbl.clone());
    info!("Template {} from {} onto {}", args.index, record.tbl, target_id);

    let source = load_table(&args.table_dir, &record.tbl)?;
    let target = load_table(&args.table_dir, &target_id)?;

    let budgeter = load_budgeter(&args.tokenizer)?;
    let serializer = TableSerializer::new(budgeter.as_ref());
    let budget = args.max_source_length.saturating_sub(args.truncation_margin);
    let truncation = serializer.truncate_to_budget(&target, budget, &mut rng);
    info!(
        "Target truncated to {} of {} rows (budget {budget} tokens)",
        truncation.table.num_rows(),
        target.num_rows()
    );

    let mut executor = SqliteExecutor::new();
    executor.register_table(&target_id, &truncation.table)?;

    println!("┌─ Template");
    println!("│  question: {}", record.question());
    println!("│  sql:      {}", record.sql);
    println!("└──────────────────────────────────────────────────────────────");
    println!();
    println!("┌─ Target table ({target_id})");
    println!("│  {}", flatten(&truncation.table, 0));
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    let engine = TemplateEngine::new(
        &executor,
        InstantiationConfig {
            unexecutable_prob: args.unexecutable_prob,
            ..Default::default()
        },
    );
    let instantiation =
        engine.instantiate(&record.sql, &source, &target_id, &truncation.table, &mut rng)?;

    println!("┌─ Instantiation (attempt {})", instantiation.attempts);
    println!("│  executable: {}", instantiation.executable);
    println!("│  encoded:    {}", instantiation.encoded);
    println!("│  answer:     {:?}", instantiation.answer.values());
    for (from, to) in &instantiation.column_mapping {
        println!(
            "│  column:     {} → {}",
            source.header()[*from],
            truncation.table.header()[*to]
        );
    }
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    let builder = ExampleBuilder::new(
        budgeter.as_ref(),
        ExampleConfig {
            max_source_length: args.max_source_length,
            permutations: args.permute_table,
            ..Default::default()
        },
        args.mode,
    );
    let example_source = ExampleSource {
        template: &record.sql,
        source_table: &record.tbl,
        target_table: &target_id,
        target: &truncation.table,
    };
    let examples = builder.build(&example_source, &instantiation, &mut rng);

    for (i, example) in examples.iter().enumerate() {
        let label = if example.permuted { "permuted" } else { "record" };
        println!(
            "┌─ {label} {i} ({} chunks, {} input tokens)",
            example.num_chunks,
            budgeter.count_tokens(&example.flattened_input)
        );
        println!("│  input:  {}", example.flattened_input);
        println!("│  output: {}", example.flattened_output);
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    Ok(())
}
