//! datafeed: scheduled public-data ingestion into a Parquet warehouse.
//!
//! # Usage
//!
//! ```bash
//! # Serve the push endpoint and run every schedule
//! datafeed run
//!
//! # Check the topology file
//! datafeed --config config/pipeline.toml validate
//!
//! # Fetch, land and load one dataset in-process, then exit
//! datafeed trigger HOUSEHOLD_INCOME
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use datafeed_core::config::load_dotenv;
use datafeed_core::{PipelineConfig, Settings};
use datafeed_pipeline::{FetcherRegistry, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "datafeed", version, about)]
struct Cli {
    /// Path to the pipeline topology file.
    #[arg(long, env = "DATAFEED_CONFIG", default_value = "config/pipeline.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve HTTP and run all schedules until SIGINT/SIGTERM.
    Run,
    /// Parse and validate the topology, then exit.
    Validate,
    /// Run one dataset through fetch, landing and load in-process.
    Trigger {
        dataset: String,
        /// Give up waiting for the load after this many seconds.
        #[arg(long, default_value_t = 120)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load topology from {}", cli.config))?;

    match cli.command {
        Command::Validate => {
            for d in &config.datasets {
                let schedule = d.every.as_deref().or(d.cron.as_deref()).unwrap_or("manual");
                println!("dataset {:<24} {} -> {}/{}", d.id, schedule, d.gcs_bucket, d.filename.as_deref().or(d.fileprefix.as_deref()).unwrap_or("?"));
            }
            for j in &config.joins {
                println!("join    {:<24} {} on ({})", j.name, j.depends_on.join(" + "), j.on.join(", "));
            }
            println!("{} dataset(s), {} join(s): ok", config.datasets.len(), config.joins.len());
            Ok(())
        }
        Command::Run => {
            let settings = Settings::from_env();
            settings.log_summary();
            let pipeline = Pipeline::from_settings(settings, &config, FetcherRegistry::default())
                .context("failed to build pipeline")?;
            pipeline.serve().await.context("pipeline server failed")
        }
        Command::Trigger { dataset, wait_secs } => {
            let settings = Settings::from_env();
            settings.log_summary();
            let mut pipeline = Pipeline::from_settings(settings, &config, FetcherRegistry::default())
                .context("failed to build pipeline")?;
            pipeline.start();
            pipeline.scheduler.trigger_now(&dataset).await?;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
            let outcome = loop {
                let metrics = pipeline.metrics.datasets().await;
                if let Some(m) = metrics.get(&dataset) {
                    if m.loads_ok > 0 {
                        break Ok(m.last_row_count.unwrap_or(0));
                    }
                }
                if pipeline.dead_letters.depth() > 0 {
                    let letters = pipeline.dead_letters.snapshot();
                    break Err(letters.last().map(|l| l.last_error.clone()).unwrap_or_default());
                }
                if tokio::time::Instant::now() >= deadline {
                    break Err(format!("no load within {wait_secs}s"));
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            };
            let statuses = pipeline.joins.evaluate().await;
            pipeline.shutdown();

            match outcome {
                Ok(rows) => {
                    info!(dataset = %dataset, rows, "loaded");
                    for s in statuses {
                        println!("join {}: {:?}", s.name, s.state);
                    }
                    println!("{dataset}: {rows} rows loaded");
                    Ok(())
                }
                Err(reason) => bail!("{dataset} did not load: {reason}"),
            }
        }
    }
}
