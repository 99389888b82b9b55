//! Feed sync pipeline: run ledger lifecycle, content acquisition and
//! per-record upserts.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use mls_core::{RecordError, SyncLog, SyncStats, SyncStatus, SyncTrigger};
use mls_feed::{parse_feed, FeedError, FeedFetcher, RawListing};
use mls_storage::{payload_sha256, HttpFetcher, ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod cron;
pub mod registry;
pub mod resolver;
pub mod upsert;

pub use config::SyncConfig;
pub use cron::{reschedule_feed, run_due_feeds, FeedRunReport};
pub use registry::{import_feeds, FeedEntry, FeedRegistry};
pub use upsert::{upsert_listing, UpsertAction, UpsertError, UpsertResult};

pub const CRATE_NAME: &str = "mls-sync";

/// Ledger `feed_url` value for runs fed inline content.
pub const INLINE_FEED_MARKER: &str = "inline";

pub const ALREADY_RUNNING_MESSAGE: &str = "a sync is already in progress";

/// Pipeline-fatal failures. Anything here fails the whole run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no feed source: pass inline content, a feed url or a feed id, or set MLS_FEED_URL")]
    NoFeedSource,
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("sync ledger error: {0}")]
    Ledger(#[from] StoreError),
}

pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Clone)]
pub struct SyncOptions {
    pub trigger: SyncTrigger,
    pub triggered_by: Option<String>,
    pub feed_id: Option<Uuid>,
    pub feed_url: Option<String>,
    /// Inline feed document; takes precedence over every URL source.
    pub feed_content: Option<String>,
    /// Called with `(processed, total)` after each record.
    pub on_progress: Option<ProgressCallback>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            trigger: SyncTrigger::Manual,
            triggered_by: None,
            feed_id: None,
            feed_url: None,
            feed_content: None,
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub stats: SyncStats,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub sync_log_id: Option<Uuid>,
}

#[derive(Debug)]
enum FeedSource {
    Inline(String),
    Url(String),
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn ListingStore>,
    fetcher: Arc<dyn FeedFetcher>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ListingStore>,
        fetcher: Arc<dyn FeedFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
        }
    }

    /// Orchestrator fetching over HTTP with the client settings from `config`.
    pub fn with_http(config: SyncConfig, store: Arc<dyn ListingStore>) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(config, store, Arc::new(fetcher)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Runs one sync end to end. Never returns early without a terminal
    /// ledger state once the run has been claimed.
    pub async fn run_sync(&self, options: SyncOptions) -> SyncOutcome {
        let started = Instant::now();
        self.reconcile_stale_runs().await;

        let mut log = SyncLog::pending(
            options.trigger,
            options.triggered_by.clone(),
            options.feed_id,
            Utc::now(),
        );
        match self.store.claim_sync_run(&log).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(trigger = options.trigger.as_str(), "sync refused: {}", ALREADY_RUNNING_MESSAGE);
                return SyncOutcome {
                    success: false,
                    stats: SyncStats::default(),
                    duration_ms: elapsed_ms(started),
                    error_message: Some(ALREADY_RUNNING_MESSAGE.to_string()),
                    sync_log_id: None,
                };
            }
            Err(err) => {
                error!(error = %err, "could not claim sync run");
                return SyncOutcome {
                    success: false,
                    stats: SyncStats::default(),
                    duration_ms: elapsed_ms(started),
                    error_message: Some(SyncError::from(err).to_string()),
                    sync_log_id: None,
                };
            }
        }

        info!(
            sync_log_id = %log.id,
            trigger = log.trigger.as_str(),
            triggered_by = log.triggered_by.as_deref().unwrap_or("-"),
            "sync started"
        );

        let result = self.execute(&mut log, &options).await;

        log.completed_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                log.status = SyncStatus::Completed;
                info!(
                    sync_log_id = %log.id,
                    created = log.stats.listings_created,
                    updated = log.stats.listings_updated,
                    record_errors = log.record_errors.len(),
                    "sync completed"
                );
            }
            Err(err) => {
                log.status = SyncStatus::Failed;
                log.stats = SyncStats::default();
                log.error_message = Some(err.to_string());
                log.error_chain = Some(error_chain(err));
                error!(sync_log_id = %log.id, error = %err, "sync failed");
            }
        }

        let mut outcome = SyncOutcome {
            success: result.is_ok(),
            stats: log.stats,
            duration_ms: 0,
            error_message: log.error_message.clone(),
            sync_log_id: Some(log.id),
        };

        if let Err(err) = self.store.finish_sync_run(&log).await {
            error!(sync_log_id = %log.id, error = %err, "could not record sync outcome");
            outcome.success = false;
            outcome.error_message = Some(SyncError::from(err).to_string());
        }

        outcome.duration_ms = elapsed_ms(started);
        outcome
    }

    async fn execute(&self, log: &mut SyncLog, options: &SyncOptions) -> Result<(), SyncError> {
        let started_at = Utc::now();
        self.store.mark_sync_running(log.id, started_at).await?;
        log.status = SyncStatus::Running;
        log.started_at = Some(started_at);

        let source = self.resolve_source(options).await?;
        let content = match source {
            FeedSource::Inline(content) => {
                log.feed_url = Some(INLINE_FEED_MARKER.to_string());
                log.feed_sha256 = Some(payload_sha256(content.as_bytes()));
                content
            }
            FeedSource::Url(url) => {
                log.feed_url = Some(url.clone());
                let payload = self
                    .fetcher
                    .fetch_feed(log.id, &url)
                    .await
                    .map_err(FeedError::from)?;
                log.feed_sha256 = Some(payload_sha256(&payload.body));
                payload.text()?.into_owned()
            }
        };

        let records = parse_feed(&content)?;
        info!(sync_log_id = %log.id, records = records.len(), "feed parsed");

        self.process_records(log, &records, options.on_progress.as_ref())
            .await;
        Ok(())
    }

    async fn process_records(
        &self,
        log: &mut SyncLog,
        records: &[RawListing],
        on_progress: Option<&ProgressCallback>,
    ) {
        let total = records.len();
        for (index, raw) in records.iter().enumerate() {
            match upsert_listing(self.store.as_ref(), raw, &mut log.stats, Utc::now()).await {
                Ok(result) => match result.action {
                    UpsertAction::Created => log.stats.listings_created += 1,
                    UpsertAction::Updated => log.stats.listings_updated += 1,
                },
                Err(err) => {
                    let mls_id = raw.mls_id().map(|id| id.trim().to_string());
                    warn!(
                        sync_log_id = %log.id,
                        mls_id = mls_id.as_deref().unwrap_or("-"),
                        error = %err,
                        "listing record failed; continuing"
                    );
                    log.record_errors.push(RecordError {
                        mls_id,
                        message: err.to_string(),
                    });
                }
            }

            if let Some(callback) = on_progress {
                if catch_unwind(AssertUnwindSafe(|| (**callback)(index + 1, total))).is_err() {
                    warn!(sync_log_id = %log.id, "progress callback panicked; ignoring");
                }
            }
        }
    }

    async fn resolve_source(&self, options: &SyncOptions) -> Result<FeedSource, SyncError> {
        if let Some(content) = &options.feed_content {
            return Ok(FeedSource::Inline(content.clone()));
        }
        if let Some(url) = non_blank(options.feed_url.as_deref()) {
            return Ok(FeedSource::Url(url));
        }
        if let Some(feed_id) = options.feed_id {
            match self.store.get_feed(feed_id).await? {
                Some(feed) => {
                    if let Some(url) = non_blank(Some(&feed.feed_url)) {
                        return Ok(FeedSource::Url(url));
                    }
                    warn!(%feed_id, "configured feed has no url; using default");
                }
                None => warn!(%feed_id, "configured feed not found; using default"),
            }
        }
        non_blank(self.config.default_feed_url.as_deref())
            .map(FeedSource::Url)
            .ok_or(SyncError::NoFeedSource)
    }

    async fn reconcile_stale_runs(&self) {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(self.config.stale_run_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return;
        };
        match self.store.reconcile_stale_runs(cutoff, now).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "marked abandoned sync runs as failed"),
            Err(err) => warn!(error = %err, "stale sync run reconciliation failed"),
        }
    }

    pub async fn is_sync_running(&self) -> Result<bool, SyncError> {
        Ok(self.store.is_sync_running().await?)
    }

    pub async fn get_sync_status(&self, sync_log_id: Uuid) -> Result<Option<SyncLog>, SyncError> {
        Ok(self.store.get_sync_log(sync_log_id).await?)
    }

    pub async fn get_recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, SyncError> {
        Ok(self.store.recent_sync_logs(limit).await?)
    }

    /// Latest completed run.
    pub async fn get_last_sync(&self) -> Result<Option<SyncLog>, SyncError> {
        Ok(self.store.last_completed_sync().await?)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Display of an error followed by each of its sources, one per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mls_feed::FeedPayload;
    use mls_storage::{FetchError, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FEED: &str = r#"<Listings>
  <Listing>
    <ListingDetails><MlsId>T-1</MlsId><Price>100000</Price></ListingDetails>
  </Listing>
  <Listing>
    <ListingDetails><Price>1</Price></ListingDetails>
  </Listing>
  <Listing>
    <ListingDetails><MlsId>T-3</MlsId></ListingDetails>
  </Listing>
</Listings>"#;

    struct StaticFetcher {
        body: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeedFetcher for StaticFetcher {
        async fn fetch_feed(&self, _id: Uuid, url: &str) -> Result<FeedPayload, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FeedPayload {
                source_url: url.to_string(),
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn orchestrator(
        store: &MemoryStore,
        default_feed_url: Option<&str>,
    ) -> (SyncOrchestrator, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher {
            body: FEED,
            calls: AtomicUsize::new(0),
        });
        let config = SyncConfig {
            default_feed_url: default_feed_url.map(str::to_string),
            ..SyncConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(config, Arc::new(store.clone()), fetcher.clone());
        (orchestrator, fetcher)
    }

    #[tokio::test]
    async fn record_failures_are_collected_and_run_completes() {
        let store = MemoryStore::new();
        let (orchestrator, fetcher) = orchestrator(&store, Some("https://feeds.example.com/a.xml"));

        let outcome = orchestrator.run_sync(SyncOptions::default()).await;

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.stats.listings_created, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let log = orchestrator
            .get_sync_status(outcome.sync_log_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Completed);
        assert_eq!(log.feed_url.as_deref(), Some("https://feeds.example.com/a.xml"));
        assert_eq!(log.feed_sha256, Some(payload_sha256(FEED.as_bytes())));
        assert_eq!(log.record_errors.len(), 1);
        assert_eq!(log.record_errors[0].mls_id, None);
        assert!(log.started_at.is_some());
        assert!(log.completed_at.is_some());
    }

    #[tokio::test]
    async fn inline_content_wins_over_urls() {
        let store = MemoryStore::new();
        let (orchestrator, fetcher) = orchestrator(&store, Some("https://feeds.example.com/a.xml"));

        let outcome = orchestrator
            .run_sync(SyncOptions {
                feed_url: Some("https://feeds.example.com/b.xml".into()),
                feed_content: Some("<Listings/>".into()),
                ..SyncOptions::default()
            })
            .await;

        assert!(outcome.success);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        let log = orchestrator.get_last_sync().await.unwrap().unwrap();
        assert_eq!(log.feed_url.as_deref(), Some(INLINE_FEED_MARKER));
        assert!(log.stats.is_zero());
    }

    #[tokio::test]
    async fn missing_feed_source_fails_the_run() {
        let store = MemoryStore::new();
        let (orchestrator, _) = orchestrator(&store, None);

        let outcome = orchestrator.run_sync(SyncOptions::default()).await;

        assert!(!outcome.success);
        assert!(outcome.stats.is_zero());
        let log = orchestrator
            .get_sync_status(outcome.sync_log_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Failed);
        assert!(log.error_message.unwrap().contains("no feed source"));
        assert!(!orchestrator.is_sync_running().await.unwrap());
    }

    #[tokio::test]
    async fn panicking_progress_callback_does_not_abort_the_run() {
        let store = MemoryStore::new();
        let (orchestrator, _) = orchestrator(&store, Some("https://feeds.example.com/a.xml"));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let outcome = orchestrator
            .run_sync(SyncOptions {
                on_progress: Some(Arc::new(move |processed: usize, total: usize| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if processed == 1 {
                        panic!("progress sink exploded at {processed}/{total}");
                    }
                })),
                ..SyncOptions::default()
            })
            .await;

        assert!(outcome.success);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn error_chain_lists_sources() {
        let err = SyncError::Ledger(StoreError::SyncLogNotFound(Uuid::nil()));
        let chain = error_chain(&err);
        assert!(chain.starts_with("sync ledger error"));
    }
}
