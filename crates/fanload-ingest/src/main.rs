//! fanload - parallel bulk loader

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use fanload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use fanload_ingest::format::FormatRegistry;
use fanload_ingest::source::expand_source;
use fanload_ingest::target::memory::MemoryStore;
use fanload_ingest::target::{redact_url, store_for_url};
use fanload_ingest::transform::TransformRegistry;
use fanload_ingest::{FanoutOrchestrator, JobConfig, LoadStats};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fanload")]
#[command(about = "Load many files into one table in parallel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging on the console
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load job
    Load {
        /// Job file (TOML)
        job: PathBuf,

        /// Worker pool size
        #[arg(long)]
        workers: Option<usize>,

        /// Load units per file
        #[arg(long)]
        concurrency: Option<usize>,

        /// Rows per reader-to-writer batch
        #[arg(long)]
        batch_rows: Option<usize>,

        /// Truncate the target table once before loading
        #[arg(long)]
        truncate: bool,

        /// Drop indexes before loading and recreate them afterwards
        #[arg(long)]
        drop_indexes: bool,

        /// Target URL, overrides the job file
        #[arg(long, env = "FANLOAD_TARGET_URL")]
        target: Option<String>,

        /// Summary format printed after the load
        #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
        summary: SummaryFormat,
    },

    /// Validate a job file and list the files it would load
    Check {
        /// Job file (TOML)
        job: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SummaryFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_config = log_config(cli.verbose);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Console logging from the flags, with environment overrides on top.
/// An invalid override is ignored as a whole.
fn log_config(verbose: bool) -> LogConfig {
    let built = LogConfig::builder()
        .level(if verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("fanload")
        .build();
    built.clone().merge_env().unwrap_or_else(|e| {
        eprintln!("Warning: ignoring invalid logging environment: {}", e);
        built
    })
}

async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Load {
            job: job_file,
            workers,
            concurrency,
            batch_rows,
            truncate,
            drop_indexes,
            target,
            summary,
        } => {
            let config = load_config(&job_file)?;
            let mut options = config
                .options
                .clone()
                .merge_env()
                .context("Invalid FANLOAD_* option in environment")?;
            if let Some(workers) = workers {
                options.worker_count = workers;
            }
            if let Some(concurrency) = concurrency {
                options.concurrency = concurrency;
            }
            if let Some(batch_rows) = batch_rows {
                options.batch_rows = batch_rows;
            }
            options.truncate |= truncate;
            options.drop_indexes |= drop_indexes;
            options.validate()?;

            let url = target
                .or_else(|| config.target.url.clone())
                .context("No target URL: set target.url, --target or FANLOAD_TARGET_URL")?;
            let store = store_for_url(&url)?;
            let job = config.into_job(
                &FormatRegistry::with_defaults(),
                &TransformRegistry::with_builtins(),
                store,
            )?;

            info!(
                job = %job_file.display(),
                target = %redact_url(&url),
                table = %job.table(),
                "Starting load"
            );

            let stats = Arc::new(LoadStats::new());
            let outcome = FanoutOrchestrator::new(options)
                .with_reporter(stats.clone())
                .run(&job)
                .await;

            match summary {
                SummaryFormat::Text => println!("{}", stats.render_table()),
                SummaryFormat::Json => println!("{}", serde_json::to_string_pretty(&stats.to_json())?),
            }

            let tasks = outcome?;
            println!("{} tasks completed, {} rows loaded", tasks, stats.total_rows());
            Ok(())
        }

        Commands::Check { job } => {
            let config = load_config(&job)?;
            // A throwaway store: checking never connects to the target
            let job = config.into_job(
                &FormatRegistry::with_defaults(),
                &TransformRegistry::with_builtins(),
                Arc::new(MemoryStore::new()),
            )?;
            let paths = expand_source(job.source().spec())?;
            let orchestrator = FanoutOrchestrator::new(config.options.clone());

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["#", "Path"]);
            for (i, path) in paths.iter().enumerate() {
                table.add_row(vec![(i + 1).to_string(), path.display().to_string()]);
            }
            println!("{}", table);
            println!(
                "{} -> {}: {} file(s), {} task(s) on {} worker(s)",
                job.source().spec(),
                job.table(),
                paths.len(),
                paths.len() * orchestrator.tasks_per_path(),
                config.options.worker_count
            );
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<JobConfig> {
    let config = JobConfig::from_file(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid job file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_log_env_keeps_verbose_flag() {
        std::env::set_var("FANLOAD_LOG_LEVEL", "loud");
        let config = log_config(true);
        std::env::remove_var("FANLOAD_LOG_LEVEL");

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::Console);
    }
}
