//! GHG Pipeline - Turns yearly facility emission workbooks into analysis-ready tables
//!
//! Responsibilities:
//! - Locate one source workbook per reporting year
//! - Resolve the facility sheet and header row despite layout drift
//! - Normalize columns, ids, states and emission values into one table
//! - Aggregate by state and sector, derive feature vectors
//! - Compute cosine similarity between states and between sectors
//! - Write every artifact plus a run report with source provenance
//!
//! Same inputs = same outputs. Nothing is carried between runs.

mod aggregate;
mod clean;
mod config;
mod error;
mod output;
mod pipeline;
mod report;
mod similarity;
mod source;
mod workbook;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::pipeline::{run_pipeline, write_report};
use crate::report::RunStatus;
use crate::similarity::{cosine_similarity_matrix, FeatureTable};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Cleans, aggregates and compares GHG facility emissions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage over the raw directory
    Run {
        /// Directory holding one workbook per reporting year (overrides GHG_RAW_DIR)
        #[arg(long)]
        raw_dir: Option<PathBuf>,

        /// Output directory (overrides GHG_OUT_DIR)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Dry run - compute everything, write nothing
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
    /// Similarity matrix over an existing feature CSV
    Similarity {
        /// Feature table CSV, one row per entity
        #[arg(long)]
        features: PathBuf,

        /// Identifier column in the feature table
        #[arg(long)]
        id_column: String,

        /// Where to write the matrix CSV
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the k most similar entities for each entity
        #[arg(long)]
        top: Option<usize>,
    },
}

fn run(raw_dir: Option<PathBuf>, out_dir: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let mut config = PipelineConfig::from_env();
    if let Some(dir) = raw_dir {
        config.raw_dir = dir;
    }
    if let Some(dir) = out_dir {
        config.out_dir = dir;
    }

    println!("=== GHG Facility Emissions Pipeline ===");
    println!("Raw dir: {}", config.raw_dir.display());
    println!("Out dir: {}", config.out_dir.display());
    println!("Mode: {}", if dry_run { "dry-run" } else { "live" });

    let (report, result) = run_pipeline(&config, dry_run);

    // The report is written whether or not the run succeeded.
    if let Some(path) = write_report(&report).context("Failed to write run report")? {
        println!("Run report: {}", path.display());
    }

    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }

    let outputs = result.with_context(|| format!("Pipeline run {} failed", report.run_id))?;

    println!("\n=== Pipeline Complete ===");
    println!("Run ID: {}", report.run_id);
    println!(
        "Sources loaded: {}/{}",
        report.sources.iter().filter(|s| s.status == RunStatus::Ok).count(),
        report.sources.len()
    );
    println!("Facility records: {}", outputs.cleaned.len());
    for year in &outputs.national {
        println!(
            "  {}: {} facilities, {} total emissions",
            year.year, year.facility_count, year.total_emissions
        );
    }
    println!("State-year rows: {}", outputs.region_year.len());
    println!("Sector-year rows: {}", outputs.sector_year.len());
    if let Some(states) = &outputs.region_similarity {
        println!("States compared: {}", states.len());
    }
    if let Some(sectors) = &outputs.sector_similarity {
        println!("Sectors compared: {}", sectors.len());
    }
    println!("Files written: {}", report.outputs.len());

    if report.status == RunStatus::Failed {
        anyhow::bail!("Stages failed: {}", report.failed_stages().join(", "));
    }
    Ok(())
}

fn similarity(features: PathBuf, id_column: String, out: Option<PathBuf>, top: Option<usize>) -> Result<()> {
    let table = FeatureTable::from_csv_path(&features, &id_column)
        .with_context(|| format!("Failed to read feature table {}", features.display()))?;
    let matrix = cosine_similarity_matrix(&table).context("Failed to compute similarity")?;

    println!("=== Similarity ===");
    println!("Entities: {}", matrix.len());

    if let Some(path) = &out {
        output::write_similarity(path, &id_column, &matrix)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Matrix written: {}", path.display());
    }

    if let Some(k) = top {
        for entity in &matrix.entities {
            let neighbours = matrix.most_similar(entity, k).unwrap_or_default();
            let rendered: Vec<String> = neighbours
                .iter()
                .map(|(name, score)| format!("{} ({:.3})", name, score))
                .collect();
            println!("  {} -> {}", entity, rendered.join(", "));
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            raw_dir,
            out_dir,
            dry_run,
        } => run(raw_dir, out_dir, dry_run),
        Command::Similarity {
            features,
            id_column,
            out,
            top,
        } => similarity(features, id_column, out, top),
    }
}
