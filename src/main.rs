//! morphcache daemon and maintenance CLI
//!
//! ```text
//! morphcache run                         # background tasks until Ctrl-C
//! morphcache stats                       # storage stats + threshold report
//! morphcache evict --target-bytes N      # evict now
//! morphcache evict --dry-run             # print recommendations only
//! morphcache metrics                     # Prometheus exposition
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use morphcache::{CacheCore, CoreConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// morphcache - caching and resilience core for transformation proxies
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "MORPHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run sweeps, scans, threshold eviction and preloading until interrupted
    Run,

    /// Print filesystem tier statistics and threshold status as JSON
    Stats,

    /// Evict filesystem tier entries
    Evict {
        /// Bytes to free (default: 20% of the tier size)
        #[arg(long)]
        target_bytes: Option<u64>,

        /// Print the eviction plan without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print Prometheus metrics gathered so far
    Metrics,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => CoreConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CoreConfig::default(),
    };

    let core = CacheCore::from_config(&config)
        .await
        .context("initializing cache core")?;

    match args.command {
        Command::Run => run(core).await,
        Command::Stats => {
            let stats = core.monitor.get_storage_stats().await?;
            let report = core.monitor.check_thresholds().await?;
            print_json(&serde_json::json!({ "stats": stats, "thresholds": report }))
        }
        Command::Evict {
            target_bytes,
            dry_run: true,
        } => {
            let plan = core
                .eviction
                .get_eviction_recommendations(target_bytes)
                .await?;
            print_json(&plan)
        }
        Command::Evict {
            target_bytes,
            dry_run: false,
        } => {
            let result = core.eviction.perform_eviction(target_bytes).await?;
            print_json(&result)
        }
        Command::Metrics => {
            print!("{}", morphcache::metrics::render()?);
            Ok(())
        }
    }
}

async fn run(core: CacheCore) -> Result<()> {
    info!("Starting morphcache v{}", morphcache::version());
    for tier in core.cache.tiers() {
        info!("  Tier {} (priority {})", tier.name(), tier.priority());
    }
    info!("  Storage root: {}", core.monitor.root().display());

    core.monitor.scan_storage_directory().await;
    let tasks = core.start_background_tasks();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    for task in tasks {
        task.stop().await;
    }
    core.cache.wait_for_backfills().await;

    let stats = core.cache.get_stats().await;
    info!(
        "Shutdown complete: {} hits, {} misses, hit rate {:.1}%",
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "redis=warn".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr so JSON command output stays machine-readable.
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
