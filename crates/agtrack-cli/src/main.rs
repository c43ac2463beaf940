use std::path::PathBuf;

use agtrack_core::{parse_week_date, WeekBounds};
use agtrack_sync::{
    InventoryOptions, InventoryPipeline, ListingOptions, OpenInterestOptions, OpenInterestPipeline,
    RunSummary, SyncConfig, WithdrawalOptions, WithdrawalPipeline,
};
use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agtrack")]
#[command(about = "Silver inventory, open-interest and withdrawal scrapers for SGE/SHFE data")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Weekly SGE vault silver inventory from the market report PDFs.
    Inventory(InventoryArgs),
    /// Daily SHFE silver futures open interest.
    OpenInterest(OpenInterestArgs),
    /// Monthly SGE gold/silver withdrawal volumes.
    Withdrawals(WithdrawalArgs),
}

#[derive(Debug, Args)]
struct InventoryArgs {
    #[arg(long, default_value_t = 300)]
    max_pages: usize,
    /// Stop after this many matching reports (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_reports: usize,
    /// Earliest week start to keep, YYYYMMDD.
    #[arg(long, value_parser = parse_compact_date, default_value = "20130101")]
    from_week: NaiveDate,
    /// Latest week end to keep, YYYYMMDD (default: today).
    #[arg(long, value_parser = parse_compact_date)]
    to_week: Option<NaiveDate>,
    #[arg(long, default_value = "data/sge_pdfs")]
    pdf_dir: PathBuf,
    #[arg(long, default_value = "data/sge_silver_inventory.csv")]
    csv_out: PathBuf,
    #[arg(long, default_value = "data/sge_silver_inventory.json")]
    json_out: PathBuf,
    /// Listing page to start from (overrides AGTRACK_SGE_WEEKLY_URL).
    #[arg(long)]
    start_url: Option<String>,
}

#[derive(Debug, Args)]
struct OpenInterestArgs {
    /// First day, YYYY-MM-DD (default: two years ago).
    #[arg(long)]
    start_date: Option<NaiveDate>,
    /// Last day, YYYY-MM-DD (default: today).
    #[arg(long)]
    end_date: Option<NaiveDate>,
    #[arg(long, default_value_t = 8)]
    workers: usize,
    #[arg(long, default_value = "data/shfe_silver_open_interest.csv")]
    out: PathBuf,
    /// Defaults to --out with a .json extension.
    #[arg(long)]
    json_out: Option<PathBuf>,
    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 20)]
    timeout: u64,
}

#[derive(Debug, Args)]
struct WithdrawalArgs {
    #[arg(long, default_value_t = 15)]
    max_pages: usize,
    #[arg(long, default_value = "data/sge_monthly_pdfs")]
    pdf_dir: PathBuf,
    #[arg(long, default_value = "data/sge_monthly_withdrawals.csv")]
    csv_out: PathBuf,
    #[arg(long, default_value = "data/sge_monthly_withdrawals.json")]
    json_out: PathBuf,
}

fn parse_compact_date(value: &str) -> Result<NaiveDate, String> {
    parse_week_date(value).map_err(|e| format!("expected YYYYMMDD, got {value:?}: {e}"))
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(stderr_layer).init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: records={} candidates={} pages={} downloads={} cache_hits={} \
         network_skips={} parse_skips={} csv={} json={}",
        summary.pipeline,
        summary.records,
        summary.candidates,
        summary.pages_visited,
        summary.downloads,
        summary.cache_hits,
        summary.network_skips,
        summary.parse_skips,
        summary.csv_out,
        summary.json_out
    );
}

async fn run_inventory(config: SyncConfig, args: InventoryArgs) -> Result<RunSummary> {
    let to_week = args.to_week.unwrap_or_else(|| Local::now().date_naive());
    if args.from_week > to_week {
        bail!("--from-week {} is after --to-week {}", args.from_week, to_week);
    }

    let mut config = config;
    if let Some(url) = args.start_url {
        config.sge_weekly_url = url;
    }

    let options = InventoryOptions {
        listing: ListingOptions {
            max_pages: args.max_pages,
            max_reports: (args.max_reports > 0).then_some(args.max_reports),
            bounds: WeekBounds::new(Some(args.from_week), Some(to_week)),
            ..Default::default()
        },
        pdf_dir: args.pdf_dir,
        csv_out: args.csv_out,
        json_out: args.json_out,
    };
    info!(
        from = %args.from_week,
        to = %to_week,
        url = %config.sge_weekly_url,
        "collecting weekly inventory"
    );
    Ok(InventoryPipeline::from_config(&config)?.run(&options).await?)
}

async fn run_open_interest(config: SyncConfig, args: OpenInterestArgs) -> Result<RunSummary> {
    let today = Local::now().date_naive();
    let end = args.end_date.unwrap_or(today);
    let start = args
        .start_date
        .unwrap_or_else(|| end - chrono::Duration::days(730));
    if start > end {
        bail!("--start-date {start} is after --end-date {end}");
    }
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let mut config = config;
    config.http_timeout_secs = args.timeout;

    let json_out = args.json_out.unwrap_or_else(|| args.out.with_extension("json"));
    let options = OpenInterestOptions {
        start,
        end,
        workers: args.workers,
        csv_out: args.out,
        json_out,
    };
    let summary = OpenInterestPipeline::from_config(&config, args.workers)?
        .run(&options)
        .await?;
    if summary.records == 0 {
        warn!(%start, %end, "no open-interest records in range");
    }
    Ok(summary)
}

async fn run_withdrawals(config: SyncConfig, args: WithdrawalArgs) -> Result<RunSummary> {
    let options = WithdrawalOptions {
        max_pages: args.max_pages,
        pdf_dir: args.pdf_dir,
        csv_out: args.csv_out,
        json_out: args.json_out,
    };
    let summary = WithdrawalPipeline::from_config(&config)?.run(&options).await?;
    if summary.records == 0 {
        warn!("no withdrawal records extracted");
    }
    Ok(summary)
}

async fn dispatch(cli: Cli) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    match cli.command {
        Commands::Inventory(args) => run_inventory(config, args).await,
        Commands::OpenInterest(args) => run_open_interest(config, args).await,
        Commands::Withdrawals(args) => run_withdrawals(config, args).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match dispatch(cli).await {
        Ok(summary) => print_summary(&summary),
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(1);
        }
    }
}
