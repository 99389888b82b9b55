//! Scheduled-feed dispatcher driven by `tokio-cron-scheduler`.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveTime, Utc};
use mls_core::schedule::next_run_after;
use mls_core::{SyncFeed, SyncFrequency, SyncTrigger};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{SyncError, SyncOptions, SyncOrchestrator, SyncOutcome};

pub const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Debug, Clone, Serialize)]
pub struct FeedRunReport {
    pub feed_id: Uuid,
    pub feed_name: String,
    pub outcome: SyncOutcome,
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

/// Updates a feed's schedule and recomputes its next run from `now`.
pub fn reschedule_feed(
    feed: &mut SyncFeed,
    frequency: SyncFrequency,
    time_of_day: NaiveTime,
    day_of_week: Option<u32>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    feed.frequency = frequency;
    feed.time_of_day = time_of_day;
    feed.day_of_week = day_of_week;
    let next = next_run_after(now, frequency, time_of_day, day_of_week);
    feed.next_scheduled_run = Some(next);
    next
}

/// Syncs every due feed in turn. A feed whose run was refused by the
/// single-flight guard keeps its schedule so the next tick retries it.
pub async fn run_due_feeds(
    orchestrator: &SyncOrchestrator,
    now: DateTime<Utc>,
) -> Result<Vec<FeedRunReport>, SyncError> {
    let store = orchestrator.store();
    let due: Vec<SyncFeed> = store
        .list_feeds()
        .await?
        .into_iter()
        .filter(|feed| feed.is_due(now))
        .collect();

    let mut reports = Vec::with_capacity(due.len());
    for mut feed in due {
        info!(feed_id = %feed.id, feed = %feed.name, "running scheduled feed sync");
        let outcome = orchestrator
            .run_sync(SyncOptions {
                trigger: SyncTrigger::Scheduled,
                triggered_by: Some(SCHEDULER_ACTOR.to_string()),
                feed_id: Some(feed.id),
                ..SyncOptions::default()
            })
            .await;

        if outcome.sync_log_id.is_some() {
            if outcome.success {
                feed.last_synced_at = Some(now);
            }
            feed.next_scheduled_run = Some(next_run_after(
                now,
                feed.frequency,
                feed.time_of_day,
                feed.day_of_week,
            ));
            store.save_feed(&feed).await?;
        } else {
            warn!(feed_id = %feed.id, "scheduled sync not started; will retry next tick");
        }

        reports.push(FeedRunReport {
            feed_id: feed.id,
            feed_name: feed.name.clone(),
            outcome,
            next_scheduled_run: feed.next_scheduled_run,
        });
    }
    Ok(reports)
}

/// Builds the dispatcher job when the scheduler is enabled in config.
pub async fn maybe_build_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !orchestrator.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = orchestrator.config().scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match run_due_feeds(&orchestrator, Utc::now()).await {
                Ok(reports) if reports.is_empty() => {}
                Ok(reports) => info!(feeds = reports.len(), "scheduled feed syncs finished"),
                Err(err) => error!(error = %err, "scheduled feed dispatch failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Runs the dispatcher until Ctrl-C.
pub async fn run_scheduler_until_shutdown(orchestrator: Arc<SyncOrchestrator>) -> anyhow::Result<()> {
    let Some(mut sched) = maybe_build_scheduler(orchestrator).await? else {
        anyhow::bail!("scheduler disabled; set MLS_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!("feed scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down feed scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
