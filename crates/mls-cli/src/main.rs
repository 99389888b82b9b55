use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveTime, Utc};
use clap::{Parser, Subcommand};
use mls_core::schedule::{next_run, parse_time_of_day};
use mls_core::{SyncFrequency, SyncTrigger};
use mls_storage::{ListingStore, MemoryStore, PgStore};
use mls_sync::cron::run_scheduler_until_shutdown;
use mls_sync::{
    import_feeds, reschedule_feed, run_due_feeds, FeedRegistry, SyncConfig, SyncOptions,
    SyncOrchestrator,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "mls-cli")]
#[command(about = "MLS listing feed sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one feed sync now.
    Sync {
        #[arg(long)]
        feed_id: Option<Uuid>,
        #[arg(long)]
        feed_url: Option<String>,
        /// Read the feed document from a local file instead of fetching it.
        #[arg(long)]
        feed_file: Option<PathBuf>,
        #[arg(long, default_value = "manual", value_parser = parse_trigger)]
        trigger: SyncTrigger,
        #[arg(long)]
        triggered_by: Option<String>,
        /// Sync into an in-memory store; nothing is written to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent runs, or one run by id.
    Status {
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Apply database migrations.
    Migrate,
    /// Dispatch due feeds on the configured cron until interrupted.
    Schedule {
        /// Dispatch due feeds once and exit.
        #[arg(long)]
        once: bool,
    },
    /// Print the next run time for a schedule.
    NextRun {
        #[arg(long, value_parser = parse_frequency)]
        frequency: SyncFrequency,
        #[arg(long, default_value = "00:00", value_parser = parse_time)]
        time: NaiveTime,
        /// 0 = Sunday ... 6 = Saturday.
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..=6))]
        day_of_week: Option<u32>,
    },
    /// Change a stored feed's schedule and recompute its next run.
    Reschedule {
        feed_id: Uuid,
        #[arg(long, value_parser = parse_frequency)]
        frequency: SyncFrequency,
        #[arg(long, default_value = "00:00", value_parser = parse_time)]
        time: NaiveTime,
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..=6))]
        day_of_week: Option<u32>,
    },
    /// Seed configured feeds from a YAML registry.
    ImportFeeds {
        #[arg(default_value = "feeds.yaml")]
        path: PathBuf,
    },
}

fn parse_trigger(value: &str) -> Result<SyncTrigger, String> {
    SyncTrigger::parse(value).ok_or_else(|| format!("unknown trigger {value:?}"))
}

fn parse_frequency(value: &str) -> Result<SyncFrequency, String> {
    Ok(SyncFrequency::parse_lossy(value))
}

fn parse_time(value: &str) -> Result<NaiveTime, String> {
    parse_time_of_day(value).ok_or_else(|| format!("expected HH:MM or HH:MM:SS, got {value:?}"))
}

fn init_tracing() {
    let fallback = std::env::var("MLS_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&fallback).unwrap_or_else(|err| {
            eprintln!("WARN: MLS_LOG={fallback:?} is not a valid filter ({err}); using info");
            EnvFilter::new("info")
        }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, 5)
        .await
        .context("connecting to DATABASE_URL")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        feed_id: None,
        feed_url: None,
        feed_file: None,
        trigger: SyncTrigger::Manual,
        triggered_by: None,
        dry_run: false,
    });

    match command {
        Commands::Sync {
            feed_id,
            feed_url,
            feed_file,
            trigger,
            triggered_by,
            dry_run,
        } => {
            let feed_content = match &feed_file {
                Some(path) => Some(
                    tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };
            let store: Arc<dyn ListingStore> = if dry_run {
                warn!("dry run: syncing into an in-memory store");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let orchestrator = SyncOrchestrator::with_http(config, store)?;
            let outcome = orchestrator
                .run_sync(SyncOptions {
                    trigger,
                    triggered_by,
                    feed_id,
                    feed_url,
                    feed_content,
                    on_progress: Some(Arc::new(|processed: usize, total: usize| {
                        if processed % PROGRESS_EVERY == 0 || processed == total {
                            info!(processed, total, "sync progress");
                        }
                    })),
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                return Err(anyhow!(outcome
                    .error_message
                    .unwrap_or_else(|| "sync failed".to_string())));
            }
        }
        Commands::Status { id, limit } => {
            let store = Arc::new(connect(&config).await?);
            let orchestrator = SyncOrchestrator::with_http(config, store)?;
            match id {
                Some(id) => {
                    let log = orchestrator
                        .get_sync_status(id)
                        .await?
                        .ok_or_else(|| anyhow!("sync log {id} not found"))?;
                    println!("{}", serde_json::to_string_pretty(&log)?);
                }
                None => {
                    println!("running: {}", orchestrator.is_sync_running().await?);
                    if let Some(last) = orchestrator.get_last_sync().await? {
                        println!(
                            "last completed: {} at {}",
                            last.id,
                            last.completed_at.unwrap_or(last.created_at)
                        );
                    }
                    for log in orchestrator.get_recent_sync_logs(limit).await? {
                        println!(
                            "{} {:<9} {:<9} created={} updated={} errors={} {}",
                            log.created_at.format("%Y-%m-%d %H:%M:%S"),
                            log.status.as_str(),
                            log.trigger.as_str(),
                            log.stats.listings_created,
                            log.stats.listings_updated,
                            log.record_errors.len(),
                            log.error_message.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule { once } => {
            let store = Arc::new(connect(&config).await?);
            let orchestrator = Arc::new(SyncOrchestrator::with_http(config, store)?);
            if once {
                let reports = run_due_feeds(&orchestrator, Utc::now()).await?;
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                run_scheduler_until_shutdown(orchestrator).await?;
            }
        }
        Commands::NextRun {
            frequency,
            time,
            day_of_week,
        } => {
            println!("{}", next_run(frequency, time, day_of_week).to_rfc3339());
        }
        Commands::Reschedule {
            feed_id,
            frequency,
            time,
            day_of_week,
        } => {
            let store = connect(&config).await?;
            let mut feed = store
                .get_feed(feed_id)
                .await?
                .ok_or_else(|| anyhow!("feed {feed_id} not found"))?;
            let next = reschedule_feed(&mut feed, frequency, time, day_of_week, Utc::now());
            store.save_feed(&feed).await?;
            println!("{} next run {}", feed.name, next.to_rfc3339());
        }
        Commands::ImportFeeds { path } => {
            let registry = FeedRegistry::load(&path).await?;
            let store = connect(&config).await?;
            let count = import_feeds(&store, &registry, Utc::now()).await?;
            println!("imported {count} feeds from {}", path.display());
        }
    }

    Ok(())
}
