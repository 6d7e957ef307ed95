use anyhow::{Context, Result};
use clap::Parser;
use like_counter::{CliArgs, Config, StoreBackend, Workload};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "like-counter")]
#[command(about = "Cached like counters with periodic write-back to durable storage")]
struct Cli {
    #[arg(short, long, help = "Configuration file (.toml or .json)")]
    config: Option<PathBuf>,

    #[arg(long, env = "LIKE_COUNTER_BACKEND", help = "Fast store backend (memory, redis)")]
    backend: Option<StoreBackend>,

    #[arg(long, help = "Redis URL for the redis backend")]
    redis_url: Option<String>,

    #[arg(long, default_value_t = 16, help = "Number of entities to exercise")]
    entities: u64,

    #[arg(long, default_value_t = 1_000, help = "Number of distinct users")]
    users: u64,

    #[arg(long, default_value_t = 10_000, help = "Total operations to run")]
    operations: usize,

    #[arg(long, default_value_t = 64, help = "Operations in flight at once")]
    concurrency: usize,

    #[arg(long, default_value_t = 0.8, help = "Fraction of operations that are reads")]
    read_ratio: f64,

    #[arg(short, long, help = "Increase verbosity")]
    verbose: bool,

    #[arg(short, long, conflicts_with = "verbose", help = "Only log warnings and errors")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Some("debug".to_string())
    } else if cli.quiet {
        Some("warn".to_string())
    } else {
        None
    };

    let config = Config::load_with_cli(&CliArgs {
        config_file: cli.config,
        backend: cli.backend,
        redis_url: cli.redis_url,
        log_level,
    })
    .context("Failed to load configuration")?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(
            config
                .logging
                .level
                .parse::<tracing::Level>()
                .unwrap_or(tracing::Level::INFO),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let workload = Workload {
        entities: cli.entities,
        users: cli.users,
        operations: cli.operations,
        concurrency: cli.concurrency,
        read_ratio: cli.read_ratio,
    };

    let report = like_counter::run(config, workload).await?;
    if !report.drifted.is_empty() {
        anyhow::bail!("{} counters drifted from the like ledger", report.drifted.len());
    }

    Ok(())
}
