use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_core::LoadMode;
use pulse_sync::{
    build_scheduler, today, LoadPipeline, LoadRequest, MemoryConnector, ResolveContext, Settings,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulse")]
#[command(about = "Extract API metrics and merge them into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the registered jobs once.
    Load {
        /// Truncate each table and reload from PULSE_EXTRACT_DATE.
        #[arg(short, long)]
        full: bool,
        /// Only run this job (`name` or `name:table` for descriptor entries).
        #[arg(long)]
        job: Option<String>,
        /// Fetch and map rows into an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// List the enabled jobs as resolved from the registry.
    Jobs,
    /// Run incremental loads on PULSE_LOAD_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let settings = Settings::from_env();

    match cli_command() {
        Commands::Load { full, job, dry_run } => {
            let pipeline = if dry_run {
                LoadPipeline::with_connector(settings, Arc::new(MemoryConnector))?
            } else {
                LoadPipeline::new(settings)?
            };
            let request = LoadRequest {
                mode: LoadMode::from_full_flag(full),
                job,
            };
            let summary = pipeline.run_once(&request, today()).await?;
            println!(
                "load complete: run_id={} mode={} jobs={} failed={} rows={}/{} report={}",
                summary.run_id,
                summary.mode,
                summary.jobs.len(),
                summary.failed_jobs(),
                summary.rows_succeeded(),
                summary.rows_attempted(),
                summary.report_path.as_deref().unwrap_or("-")
            );
        }
        Commands::Jobs => {
            let pipeline = LoadPipeline::with_connector(settings, Arc::new(MemoryConnector))?;
            let registry = pipeline.load_registry().await?;
            let env = |name: &str| std::env::var(name).ok();
            let ctx = ResolveContext {
                base_dir: pipeline.settings().jobs_dir(),
                default_schema: pipeline.settings().default_schema.as_deref(),
                env: &env,
            };
            for spec in registry.enabled() {
                match spec.resolve(&ctx) {
                    Ok(jobs) => {
                        for job in jobs {
                            println!(
                                "{}\t{}\t{}\tkeys={}",
                                job.name,
                                job.table,
                                job.source.kind(),
                                job.keys.iter().collect::<Vec<_>>().join(",")
                            );
                        }
                    }
                    Err(err) => println!("{}\tinvalid: {err}", spec.name),
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(LoadPipeline::new(settings)?);
            let cron = pipeline.settings().load_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn cli_command() -> Commands {
    Cli::parse().command.unwrap_or(Commands::Load {
        full: false,
        job: None,
        dry_run: false,
    })
}
