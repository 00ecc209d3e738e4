//! Synthesize (SQL, table, answer) pretraining examples from SQL templates.
//!
//! ## Input
//!
//! - `--template-file`  SQUALL-style template list (`[{tbl, sql, nl}, ...]`)
//! - `--table-dir`      one SQUALL table JSON per table id (`<id>.json`)
//! - `--database-dir`   one SQLite database per table id (`<id>.db`); copied
//!   into `--scratch-dir` before truncated rows are deleted. Without it the
//!   stores are built in memory from the table JSON.
//! - `--dev-id-file`    JSON list of held-out table ids
//!
//! ## Output
//!
//! One JSON record per line, see `headwater::example::SynthesizedExample`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin synthesize -- --mode train --instance-number 500
//! cargo run --release --bin synthesize -- --mode dev --tokenizer whitespace
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use estuary::tokenizer::{DEFAULT_TOKENIZER_REPO, load_budgeter};
use headwater::example::ExampleConfig;
use headwater::executor::SqliteExecutor;
use headwater::sampler::{Split, SynthesisConfig, Synthesizer, TablePool, load_held_out_ids};
use headwater::serializer::TableSerializer;
use headwater::template::{InstantiationConfig, load_templates};
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{info, warn};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Synthesize table QA pretraining data from SQL templates")]
struct Args {
    /// Template file providing the SQL queries to re-target.
    #[arg(long, default_value = "squall/data.json")]
    template_file: PathBuf,

    /// `train` skips held-out tables, `dev` uses only them.
    #[arg(long, default_value_t = Split::Train)]
    mode: Split,

    /// JSON list of held-out table ids, to avoid train/dev leakage.
    #[arg(long, default_value = "squall/dev-0.ids")]
    dev_id_file: PathBuf,

    /// Directory of SQUALL table JSON files.
    #[arg(long, default_value = "squall/tables/json")]
    table_dir: PathBuf,

    /// Directory of per-table SQLite databases. Omit to build in-memory
    /// stores from the table files.
    #[arg(long)]
    database_dir: Option<PathBuf>,

    /// Where database copies are staged before rows are deleted.
    #[arg(long, default_value = "squall/tables/temp_db")]
    scratch_dir: PathBuf,

    /// Output JSONL file. Defaults to `<mode>.jsonl`.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Accepted examples wanted per template.
    #[arg(long, default_value_t = 500)]
    instance_number: usize,

    /// Token budget of the flattened query plus table.
    #[arg(long, default_value_t = 1024)]
    max_source_length: usize,

    /// Tokens reserved for the query when truncating target tables.
    #[arg(long, default_value_t = 40)]
    truncation_margin: usize,

    /// Cells with at least this many tokens are clipped.
    #[arg(long, default_value_t = 15)]
    max_cell_length: usize,

    /// Token length clipped cells are cut down to.
    #[arg(long, default_value_t = 15)]
    max_cell_truncate: usize,

    /// Chunks kept per example in train mode.
    #[arg(long, default_value_t = 1)]
    max_chunk_size: usize,

    /// Chunks kept per example in dev mode.
    #[arg(long, default_value_t = 1)]
    max_chunk_size_valid: usize,

    /// Column-shuffled copies per train example.
    #[arg(long, default_value_t = 0)]
    permute_table: usize,

    /// Probability of keeping an empty result as a placeholder answer.
    #[arg(long, default_value_t = 0.0)]
    unexecutable_prob: f64,

    /// RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// `whitespace`, a path to a tokenizer.json, or a Hub repository id.
    #[arg(long, default_value = DEFAULT_TOKENIZER_REPO)]
    tokenizer: String,

    /// Worker threads (0 = one per core).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Templates processed in parallel before results are written.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
}

impl Args {
    fn config(&self) -> SynthesisConfig {
        SynthesisConfig {
            split: self.mode,
            seed: self.seed,
            instance_number: self.instance_number,
            truncation_margin: self.truncation_margin,
            batch_size: self.batch_size,
            example: ExampleConfig {
                max_source_length: self.max_source_length,
                max_cell_length: self.max_cell_length,
                max_cell_truncate: self.max_cell_truncate,
                max_chunks_train: self.max_chunk_size,
                max_chunks_valid: self.max_chunk_size_valid,
                permutations: self.permute_table,
            },
            instantiation: InstantiationConfig {
                unexecutable_prob: self.unexecutable_prob,
                ..Default::default()
            },
            ..Default::default()
        }
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
    let config = args.config();
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.jsonl", args.mode)));

    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()?;
    }
    let pipeline_start = std::time::Instant::now();

    // ── Step 1: Tokenizer ──────────────────────────────────────────────
    info!("Step 1: Loading tokenizer '{}'...", args.tokenizer);
    let budgeter = load_budgeter(&args.tokenizer)?;
    let serializer = TableSerializer::new(budgeter.as_ref());

    // ── Step 2: Tables ─────────────────────────────────────────────────
    info!(
        "Step 2: Loading tables (target budget {} tokens)...",
        config.table_budget()
    );
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let pool = TablePool::load_dir(&args.table_dir, &serializer, config.table_budget(), &mut rng)?;

    // ── Step 3: Backing stores ─────────────────────────────────────────
    info!("Step 3: Preparing table stores...");
    let executor = match &args.database_dir {
        Some(database_dir) => SqliteExecutor::open_dir(database_dir, &args.scratch_dir)?,
        None => {
            let mut executor = SqliteExecutor::new();
            for table_id in pool.ids() {
                if let Some(table) = pool.source(table_id) {
                    executor.register_table(table_id, table)?;
                }
            }
            executor
        }
    };
    pool.apply_truncation(&executor)?;

    // ── Step 4: Templates and held-out ids ─────────────────────────────
    info!("Step 4: Loading templates...");
    let templates = load_templates(&args.template_file)?;
    let held_out = if args.dev_id_file.is_file() {
        load_held_out_ids(&args.dev_id_file)?
    } else {
        warn!(
            "Held-out id file {} not found, nothing is held out",
            args.dev_id_file.display()
        );
        BTreeSet::new()
    };
    info!("  {} held-out tables", held_out.len());

    // ── Step 5: Synthesis ──────────────────────────────────────────────
    info!("Step 5: Synthesizing into {}...", output_path.display());
    let synthesizer = Synthesizer::new(&pool, &executor, budgeter.as_ref(), &held_out, config);
    let num_templates = templates
        .iter()
        .filter(|t| synthesizer.uses_template(t))
        .count();

    let pb = ProgressBar::new(num_templates as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "  Templates  {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
        )?
        .progress_chars("##-"),
    );

    let mut writer = BufWriter::new(File::create(&output_path)?);
    let mut written: u64 = 0;
    let stats = synthesizer.run(&templates, |_, records| -> std::io::Result<()> {
        for record in &records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        written += records.len() as u64;
        pb.set_message(format!("{} records", HumanCount(written)));
        pb.inc(1);
        Ok(())
    })?;
    writer.flush()?;
    pb.finish_with_message(format!("{} records", HumanCount(written)));

    info!(
        "Done: {} records from {} templates in {}",
        HumanCount(stats.records as u64),
        stats.templates,
        HumanDuration(pipeline_start.elapsed())
    );
    info!(
        "  draws={} accepted={} placeholders={} no_viable={} schema_mismatch={} unknown_column={} missing_source={}",
        stats.draws,
        stats.accepted,
        stats.placeholders,
        stats.no_viable,
        stats.schema_mismatch,
        stats.unknown_column,
        stats.missing_source
    );
    Ok(())
}
