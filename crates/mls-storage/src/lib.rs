//! Datastore contracts, Postgres/in-memory stores and feed HTTP fetching.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mls_core::{
    AgentDraft, Listing, ListingDraft, ListingPhoto, OfficeDraft, OpenHouse, OpenHouseDraft,
    PhotoDraft, SyncFeed, SyncLog,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "mls-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value in {column}: {value}")]
    Decode { column: &'static str, value: String },
    #[error("sync log {0} not found")]
    SyncLogNotFound(Uuid),
    #[error("sync log {0} was already closed")]
    SyncLogClosed(Uuid),
    #[error("listing {0} not found")]
    ListingNotFound(Uuid),
    #[error("duplicate mls_id {0}")]
    DuplicateMlsId(String),
}

/// Writes that make up one listing's upsert. Dropping a transaction without
/// calling [`ListingTx::commit`] discards every write made through it.
#[async_trait]
pub trait ListingTx: Send {
    async fn find_agent_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError>;
    async fn insert_agent(&mut self, agent: &AgentDraft) -> Result<Uuid, StoreError>;
    async fn find_office_by_name(&mut self, name: &str) -> Result<Option<Uuid>, StoreError>;
    async fn insert_office(&mut self, office: &OfficeDraft) -> Result<Uuid, StoreError>;

    async fn find_listing_id(&mut self, mls_id: &str) -> Result<Option<Uuid>, StoreError>;
    async fn insert_listing(
        &mut self,
        listing: &ListingDraft,
        agent_id: Option<Uuid>,
        office_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError>;
    async fn update_listing(
        &mut self,
        id: Uuid,
        listing: &ListingDraft,
        agent_id: Option<Uuid>,
        office_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Removes every photo and open house owned by the listing.
    async fn clear_listing_media(&mut self, listing_id: Uuid) -> Result<(), StoreError>;
    async fn insert_photo(
        &mut self,
        listing_id: Uuid,
        photo: &PhotoDraft,
        sort_order: i32,
    ) -> Result<(), StoreError>;
    async fn insert_open_house(
        &mut self,
        listing_id: Uuid,
        open_house: &OpenHouseDraft,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ListingTx>, StoreError>;

    /// Inserts `log` (status `pending`) only when no other run is pending or
    /// running. Returns `false` when another run holds the claim.
    async fn claim_sync_run(&self, log: &SyncLog) -> Result<bool, StoreError>;
    async fn mark_sync_running(&self, id: Uuid, started_at: DateTime<Utc>)
        -> Result<(), StoreError>;
    /// Persists the terminal state of a run, releasing its claim. A run
    /// already closed (for example reconciled as abandoned) is left as is and
    /// reported as `SyncLogClosed`.
    async fn finish_sync_run(&self, log: &SyncLog) -> Result<(), StoreError>;
    /// Fails non-terminal runs that started (or, never started, were
    /// created) before `stale_before`.
    async fn reconcile_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn is_sync_running(&self) -> Result<bool, StoreError>;
    async fn get_sync_log(&self, id: Uuid) -> Result<Option<SyncLog>, StoreError>;
    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError>;
    async fn last_completed_sync(&self) -> Result<Option<SyncLog>, StoreError>;

    async fn get_feed(&self, id: Uuid) -> Result<Option<SyncFeed>, StoreError>;
    async fn list_feeds(&self) -> Result<Vec<SyncFeed>, StoreError>;
    async fn save_feed(&self, feed: &SyncFeed) -> Result<(), StoreError>;

    async fn find_listing(&self, mls_id: &str) -> Result<Option<Listing>, StoreError>;
    async fn listing_photos(&self, listing_id: Uuid) -> Result<Vec<ListingPhoto>, StoreError>;
    async fn listing_open_houses(&self, listing_id: Uuid) -> Result<Vec<OpenHouse>, StoreError>;
}

pub(crate) const ABANDONED_RUN_MESSAGE: &str =
    "sync abandoned: run never reached a terminal state";

/// Hex-encoded SHA-256 of a fetched feed payload.
pub fn payload_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
