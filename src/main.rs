use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use taxflow::{
    checked_sum, logging, table_counts, AppConfig, FileDatasetLoader, Parallelism,
    PipelineAssignment, ResultSink, RunOptions, RunReport, SegmentMappingTable, SegmentationEngine,
    SegmentationError, SqliteSink, Targets,
};

#[derive(Parser, Debug)]
#[command(name = "taxflow", version, about = "Segment financial line items by company pipeline")]
struct Cli {
    /// Path to the JSON configuration
    #[arg(short, long, global = true, env = "TAXFLOW_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Force debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Worker threads (defaults to available cores)
    #[arg(short, long, global = true, conflicts_with = "sequential")]
    workers: Option<usize>,

    /// Process companies one after another
    #[arg(long, global = true)]
    sequential: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every company assigned to a pipeline
    All(RunArgs),
    /// Run only the given company codes
    Subset {
        /// Company codes (case-insensitive)
        #[arg(required = true, value_delimiter = ',')]
        companies: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Persist input rows and segmented records to SQLite
    #[arg(long)]
    load_db: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_file(&cli.config)?;
    logging::init_logging(&config.log_level, cli.debug || config.debug)?;

    let (targets, run) = match cli.command {
        Command::All(run) => (Targets::All, run),
        Command::Subset { companies, run } => (Targets::Subset(companies), run),
    };

    let parallelism = match (cli.sequential, cli.workers) {
        (true, _) => Parallelism::Sequential,
        (false, Some(n)) => Parallelism::Workers(n),
        (false, None) => Parallelism::Auto,
    };

    let report = run_segmentation(&config, &targets, parallelism)?;
    print_report(&report);

    if run.load_db {
        persist(&config, &report)?;
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_segmentation(config: &AppConfig, targets: &Targets, parallelism: Parallelism) -> Result<RunReport> {
    println!("📂 Loading configuration...");
    let catalog = config.data_sources.catalog()?;
    let rules = SegmentMappingTable::from_file(&config.segments_path)?;
    let assignment = PipelineAssignment::new(&config.pipeline)?;
    let companies = config.company_configs();
    println!(
        "✓ {} sources, {} segment rules, {} assigned companies",
        catalog.len(),
        rules.rule_count(),
        assignment.len()
    );

    let loader = FileDatasetLoader::new();
    let engine = SegmentationEngine::new(&catalog, &rules, &assignment, &companies, &loader);
    let options = RunOptions {
        parallelism,
        ..Default::default()
    };

    println!("\n⚙️  Running segmentation...");
    let report = engine.run(targets, &options)?;
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for company in &report.companies {
        let records = report.records_for(company);
        match report.failure_for(company) {
            Some(failure) => println!("❌ {}: {} ({})", company, failure.message, failure.kind),
            None => {
                let adjusted = checked_sum(records.iter().map(|r| r.adjusted_amount))
                    .map(|total| total.normalize().to_string())
                    .unwrap_or_else(|| "overflow".to_string());
                println!("✓ {}: {} records, adjusted {}", company, records.len(), adjusted);
            }
        }
    }

    for check in report.unbalanced() {
        println!(
            "⚠️  {}: input {} but gross {} / adjusted {}",
            check.company_code,
            check.input_total.normalize(),
            check.gross_total.normalize(),
            check.adjusted_total.normalize()
        );
    }

    println!("\n{}", report.summary());
    for (variant, count) in report.records_by_variant() {
        println!("   {}: {} records", variant, count);
    }
    println!("   fingerprint: {}", report.fingerprint());
}

fn persist(config: &AppConfig, report: &RunReport) -> Result<()> {
    println!("\n💾 Writing to {}...", config.database_path.display());

    let mut sink = SqliteSink::open(&config.database_path)
        .map_err(|e| SegmentationError::Sink(format!("{:#}", e)))?;
    let stats = sink
        .write(report)
        .map_err(|e| SegmentationError::Sink(format!("{:#}", e)))?;
    println!("✓ Inserted: {} records", stats.records_inserted);
    println!("✓ Skipped duplicates: {}", stats.records_skipped);
    println!("✓ Replaced stale: {} records", stats.records_removed);

    let counts = table_counts(sink.connection()).context("Failed to count rows")?;
    for (table, count) in counts {
        println!("   {}: {} rows", table, count);
    }
    Ok(())
}
