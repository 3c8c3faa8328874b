//! sf-md-bulk CLI - master-data conversion, bulk ingest, and SOQL export.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use sf_md_bulk::config::Settings;
use sf_md_bulk::error::AppError;
use sf_md_bulk::flows::{
    run_convert, run_export, run_ingest, ExportOptions, IngestOptions,
};
use sf_md_bulk::salesforce::{Operation, PollPolicy};

#[derive(Parser)]
#[command(name = "sf-md-bulk")]
#[command(about = "Master-data conversion, Salesforce bulk ingest, and SOQL export")]
#[command(version)]
struct Cli {
    /// Log format: text or json
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info", global = true)]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a legacy export file to ingest-ready CSV
    Convert {
        /// Input file path (.ALL etc.)
        input: PathBuf,

        /// Mapping config (YAML/JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output CSV; defaults to the mapping's configured path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Convert (unless pre-converted) and bulk-load one master file
    Ingest {
        /// Input file path (.ALL, or CSV with --pre-converted)
        input: PathBuf,

        /// Mapping config (YAML/JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Input is already ingest-ready CSV; skip conversion
        #[arg(long)]
        pre_converted: bool,

        /// Directory for converted CSV and outcome files
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Seconds between status checks
        #[arg(long, default_value = "5")]
        poll_interval: u64,

        /// Overall wait budget in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Run a SOQL query through the bulk query endpoint into one CSV
    Export {
        /// SOQL query text
        #[arg(short, long)]
        query: String,

        /// Include archived and deleted records
        #[arg(long)]
        query_all: bool,

        /// Output CSV; defaults to <Object>_<timestamp>.csv in --output-dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for the default output name
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Page-size hint for result retrieval (maxRecords)
        #[arg(long)]
        page_size: Option<u32>,

        /// Request primary-key partitioning with this many records per
        /// partition
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Seconds between status checks
        #[arg(long, default_value = "5")]
        poll_interval: u64,

        /// Overall wait budget in seconds
        #[arg(long, default_value = "1800")]
        timeout: u64,
    },
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.verbosity.clone()));

    if cli.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    match cli.command {
        Commands::Convert {
            input,
            config,
            output,
        } => {
            let report = run_convert(&input, &config, output).await?;
            println!(
                "Converted {} row(s) x {} column(s) -> {}",
                report.rows,
                report.columns,
                report.output_path.display()
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Ingest {
            input,
            config,
            pre_converted,
            output_dir,
            poll_interval,
            timeout,
        } => {
            let settings = Settings::from_env()?;
            let opts = IngestOptions {
                pre_converted,
                output_dir,
                policy: PollPolicy::constant(
                    Duration::from_secs(poll_interval),
                    Duration::from_secs(timeout),
                ),
            };

            let report = run_ingest(&settings, &config, &input, &opts).await?;
            println!(
                "Job {} complete: {} submitted, {} ok, {} failed",
                report.job_id, report.submitted, report.counts.success, report.counts.failed
            );
            println!("  success: {}", report.files.success_path.display());
            println!("  errors : {}", report.files.error_path.display());

            // Row-level rejections are reported, not swallowed: the job
            // succeeded, the data partially did not.
            if report.fully_successful() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(4))
            }
        }

        Commands::Export {
            query,
            query_all,
            output,
            output_dir,
            page_size,
            chunk_size,
            poll_interval,
            timeout,
        } => {
            let settings = Settings::from_env()?;
            let opts = ExportOptions {
                operation: if query_all {
                    Operation::QueryAll
                } else {
                    Operation::Query
                },
                output,
                output_dir,
                page_size,
                chunk_size,
                policy: PollPolicy::backoff(
                    Duration::from_secs(poll_interval.max(1)),
                    Duration::from_secs((poll_interval.max(1)) * 6),
                    Duration::from_secs(timeout),
                ),
                ..ExportOptions::default()
            };

            let report = run_export(&settings, &query, &opts).await?;
            println!(
                "Job {}: {} page(s), {} partition(s), {} byte(s) -> {}",
                report.job_id,
                report.pages,
                report.chunks.max(1),
                report.bytes,
                report.output_path.display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
