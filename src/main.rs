use std::path::PathBuf;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use linkharvest::{
    config::RunConfig,
    fetch::HttpFetcher,
    info_time,
    process::{process_collect, process_csv},
    telemetry::init_telemetry,
    verify::verify_integrity_with_extension,
    Result,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "linkharvest", version, about)]
struct Cli {
    /// Config file (defaults to ./linkharvest.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    prefix: Option<String>,
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    /// Seconds to wait between batches
    #[arg(long, global = true)]
    delay: Option<u64>,
    #[arg(long, global = true)]
    endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every row of the input CSV in batches and write chunked JSONL
    Run {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Fetch a list of identifiers in one go and write `<category>.json` plus JSONL chunks
    Collect {
        #[arg(long)]
        category: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Check the JSONL chunk files of a prefix
    Verify {
        #[arg(long)]
        expected: usize,
    },
}

impl Overrides {
    fn apply(self, cfg: &mut RunConfig) {
        if let Some(dir) = self.output_dir {
            cfg.output_dir = dir;
        }
        if let Some(prefix) = self.prefix {
            cfg.prefix = prefix;
        }
        if let Some(n) = self.chunk_size {
            cfg.chunk_size = n;
        }
        if let Some(n) = self.batch_size {
            cfg.batch_size = n;
        }
        if let Some(secs) = self.delay {
            cfg.inter_batch_delay_secs = secs;
        }
        if let Some(endpoint) = self.endpoint {
            cfg.backend.endpoint = endpoint;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry();
    let start_time = Local::now();

    let cli = Cli::parse();
    let mut cfg = RunConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut cfg);

    match cli.command {
        Command::Run { input } => {
            if let Some(input) = input {
                cfg.input_csv = input;
            }
            cfg.validate()?;
            info!("Starting run from {}", cfg.input_csv.display());
            let fetcher = HttpFetcher::new(&cfg.backend)?;
            let outcome = process_csv(&cfg, &fetcher, shutdown_signal()).await?;
            match outcome.summary {
                Some(summary) => {
                    info!("Total items: {}", summary.total_items);
                    info!("Successfully fetched: {}", summary.successfully_fetched);
                    info!("Success rate: {}", summary.success_rate);
                    for file_name in &summary.files.files {
                        info!("  - {file_name}");
                    }
                }
                None => warn!("No items were successfully fetched."),
            }
        }
        Command::Collect { category, ids } => {
            cfg.validate()?;
            let fetcher = HttpFetcher::new(&cfg.backend)?;
            process_collect(&cfg, &fetcher, &category, &ids).await?;
        }
        Command::Verify { expected } => {
            verify_integrity_with_extension(&cfg.output_dir, &cfg.prefix, &cfg.extension, expected)
                .await?;
        }
    }

    info_time!(start_time, "Full program time:");
    Ok(())
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
