//! In-process store used by tests and `--dry-run` syncs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mls_core::{
    Agent, AgentDraft, Listing, ListingDraft, ListingPhoto, Office, OfficeDraft, OpenHouse,
    OpenHouseDraft, PhotoDraft, SyncFeed, SyncLog, SyncStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{ListingStore, ListingTx, StoreError, ABANDONED_RUN_MESSAGE};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    listings: BTreeMap<Uuid, Listing>,
    listing_ids_by_mls: HashMap<String, Uuid>,
    photos: Vec<ListingPhoto>,
    open_houses: Vec<OpenHouse>,
    agents: Vec<Agent>,
    offices: Vec<Office>,
    sync_logs: Vec<SyncLog>,
    feeds: BTreeMap<Uuid, SyncFeed>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.state.lock().await.listings.values().cloned().collect()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.state.lock().await.agents.clone()
    }

    pub async fn offices(&self) -> Vec<Office> {
        self.state.lock().await.offices.clone()
    }

    /// Seeds a ledger row as-is, bypassing the single-flight claim.
    pub async fn insert_sync_log(&self, log: SyncLog) {
        self.state.lock().await.sync_logs.push(log);
    }
}

/// Works on a copy of the state and swaps it in on commit. The store lock is
/// held for the lifetime of the transaction.
struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl ListingTx for MemoryTx {
    async fn find_agent_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .working
            .agents
            .iter()
            .find(|agent| agent.fields.email.as_deref() == Some(email))
            .map(|agent| agent.id))
    }

    async fn insert_agent(&mut self, agent: &AgentDraft) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.working.agents.push(Agent {
            id,
            fields: agent.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn find_office_by_name(&mut self, name: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .working
            .offices
            .iter()
            .find(|office| office.fields.name == name)
            .map(|office| office.id))
    }

    async fn insert_office(&mut self, office: &OfficeDraft) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.working.offices.push(Office {
            id,
            fields: office.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn find_listing_id(&mut self, mls_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.working.listing_ids_by_mls.get(mls_id).copied())
    }

    async fn insert_listing(
        &mut self,
        listing: &ListingDraft,
        agent_id: Option<Uuid>,
        office_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        if self.working.listing_ids_by_mls.contains_key(&listing.mls_id) {
            return Err(StoreError::DuplicateMlsId(listing.mls_id.clone()));
        }
        let id = Uuid::new_v4();
        self.working
            .listing_ids_by_mls
            .insert(listing.mls_id.clone(), id);
        self.working.listings.insert(
            id,
            Listing {
                id,
                fields: listing.clone(),
                agent_id,
                office_id,
                created_at: now,
                updated_at: now,
                synced_at: now,
            },
        );
        Ok(id)
    }

    async fn update_listing(
        &mut self,
        id: Uuid,
        listing: &ListingDraft,
        agent_id: Option<Uuid>,
        office_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(existing) = self.working.listings.get_mut(&id) else {
            return Err(StoreError::ListingNotFound(id));
        };
        if existing.fields.mls_id != listing.mls_id {
            if self.working.listing_ids_by_mls.contains_key(&listing.mls_id) {
                return Err(StoreError::DuplicateMlsId(listing.mls_id.clone()));
            }
            self.working.listing_ids_by_mls.remove(&existing.fields.mls_id);
            self.working
                .listing_ids_by_mls
                .insert(listing.mls_id.clone(), id);
        }
        existing.fields = listing.clone();
        existing.agent_id = agent_id;
        existing.office_id = office_id;
        existing.updated_at = now;
        existing.synced_at = now;
        Ok(())
    }

    async fn clear_listing_media(&mut self, listing_id: Uuid) -> Result<(), StoreError> {
        self.working
            .photos
            .retain(|photo| photo.listing_id != listing_id);
        self.working
            .open_houses
            .retain(|open_house| open_house.listing_id != listing_id);
        Ok(())
    }

    async fn insert_photo(
        &mut self,
        listing_id: Uuid,
        photo: &PhotoDraft,
        sort_order: i32,
    ) -> Result<(), StoreError> {
        self.working.photos.push(ListingPhoto {
            id: Uuid::new_v4(),
            listing_id,
            url: photo.url.clone(),
            caption: photo.caption.clone(),
            sort_order,
        });
        Ok(())
    }

    async fn insert_open_house(
        &mut self,
        listing_id: Uuid,
        open_house: &OpenHouseDraft,
    ) -> Result<(), StoreError> {
        self.working.open_houses.push(OpenHouse {
            id: Uuid::new_v4(),
            listing_id,
            date: open_house.date,
            start_time: open_house.start_time,
            end_time: open_house.end_time,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn ListingTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn claim_sync_run(&self, log: &SyncLog) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .sync_logs
            .iter()
            .any(|existing| !existing.status.is_terminal())
        {
            return Ok(false);
        }
        state.sync_logs.push(log.clone());
        Ok(true)
    }

    async fn mark_sync_running(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let log = state
            .sync_logs
            .iter_mut()
            .find(|log| log.id == id)
            .ok_or(StoreError::SyncLogNotFound(id))?;
        log.status = SyncStatus::Running;
        log.started_at = Some(started_at);
        Ok(())
    }

    async fn finish_sync_run(&self, log: &SyncLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let existing = state
            .sync_logs
            .iter_mut()
            .find(|existing| existing.id == log.id)
            .ok_or(StoreError::SyncLogNotFound(log.id))?;
        if existing.status.is_terminal() {
            return Err(StoreError::SyncLogClosed(log.id));
        }
        *existing = log.clone();
        Ok(())
    }

    async fn reconcile_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut reconciled = 0;
        for log in state.sync_logs.iter_mut().filter(|log| {
            !log.status.is_terminal() && log.started_at.unwrap_or(log.created_at) < stale_before
        }) {
            log.status = SyncStatus::Failed;
            log.completed_at = Some(now);
            log.error_message = Some(ABANDONED_RUN_MESSAGE.to_string());
            reconciled += 1;
        }
        Ok(reconciled)
    }

    async fn is_sync_running(&self) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .any(|log| log.status == SyncStatus::Running))
    }

    async fn get_sync_log(&self, id: Uuid) -> Result<Option<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sync_logs.iter().find(|log| log.id == id).cloned())
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        let mut logs = state.sync_logs.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn last_completed_sync(&self) -> Result<Option<SyncLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .filter(|log| log.status == SyncStatus::Completed)
            .max_by_key(|log| log.completed_at.unwrap_or(log.created_at))
            .cloned())
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<SyncFeed>, StoreError> {
        Ok(self.state.lock().await.feeds.get(&id).cloned())
    }

    async fn list_feeds(&self) -> Result<Vec<SyncFeed>, StoreError> {
        Ok(self.state.lock().await.feeds.values().cloned().collect())
    }

    async fn save_feed(&self, feed: &SyncFeed) -> Result<(), StoreError> {
        self.state.lock().await.feeds.insert(feed.id, feed.clone());
        Ok(())
    }

    async fn find_listing(&self, mls_id: &str) -> Result<Option<Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listing_ids_by_mls
            .get(mls_id)
            .and_then(|id| state.listings.get(id))
            .cloned())
    }

    async fn listing_photos(&self, listing_id: Uuid) -> Result<Vec<ListingPhoto>, StoreError> {
        let state = self.state.lock().await;
        let mut photos = state
            .photos
            .iter()
            .filter(|photo| photo.listing_id == listing_id)
            .cloned()
            .collect::<Vec<_>>();
        photos.sort_by_key(|photo| photo.sort_order);
        Ok(photos)
    }

    async fn listing_open_houses(&self, listing_id: Uuid) -> Result<Vec<OpenHouse>, StoreError> {
        let state = self.state.lock().await;
        let mut open_houses = state
            .open_houses
            .iter()
            .filter(|open_house| open_house.listing_id == listing_id)
            .cloned()
            .collect::<Vec<_>>();
        open_houses.sort_by_key(|open_house| (open_house.date, open_house.start_time));
        Ok(open_houses)
    }
}
