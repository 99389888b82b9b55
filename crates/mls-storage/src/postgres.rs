use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use mls_core::{
    AgentDraft, Listing, ListingDraft, ListingPhoto, ListingStatus, OfficeDraft, OpenHouse,
    OpenHouseDraft, PhotoDraft, RecordError, SyncFeed, SyncFrequency, SyncLog, SyncStats,
    SyncStatus, SyncTrigger,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{ListingStore, ListingTx, StoreError, ABANDONED_RUN_MESSAGE};

const LISTING_COLUMNS: &str = "id, mls_id, street_address, unit_number, city, state, zip, \
    latitude, longitude, status, property_type, price, bedrooms, bathrooms, living_area, \
    lot_size, year_built, description, pets_allowed, listing_url, virtual_tour_url, \
    date_listed, agent_id, office_id, created_at, updated_at, synced_at";

const SYNC_LOG_COLUMNS: &str = "id, status, trigger_kind, triggered_by, feed_id, feed_url, \
    feed_sha256, created_at, started_at, completed_at, listings_created, listings_updated, \
    listings_deleted, agents_created, agents_updated, offices_created, offices_updated, \
    photos_processed, open_houses_processed, error_message, error_chain, record_errors";

const FEED_COLUMNS: &str = "id, name, feed_url, enabled, schedule_enabled, frequency, \
    time_of_day, day_of_week, next_scheduled_run, last_synced_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database schema is up to date");
        Ok(())
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ListingTx for PgTx {
    async fn find_agent_by_email(&mut self, email: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM agents WHERE email = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_agent(&mut self, agent: &AgentDraft) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO agents (id, first_name, last_name, email, phone, license_number)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&agent.first_name)
        .bind(&agent.last_name)
        .bind(&agent.email)
        .bind(&agent.phone)
        .bind(&agent.license_number)
        .execute(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn find_office_by_name(&mut self, name: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM offices WHERE name = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_office(&mut self, office: &OfficeDraft) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO offices (id, name, phone, email, website, street_address, city, state, zip)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&office.name)
        .bind(&office.phone)
        .bind(&office.email)
        .bind(&office.website)
        .bind(&office.street_address)
        .bind(&office.city)
        .bind(&office.state)
        .bind(&office.zip)
        .execute(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn find_listing_id(&mut self, mls_id: &str) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM listings WHERE mls_id = $1")
            .bind(mls_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(id)
    }

    async fn insert_listing(
        &mut self,
        listing: &ListingDraft,
        agent_id: Option<Uuid>,
        office_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO listings (
                id, mls_id, street_address, unit_number, city, state, zip,
                latitude, longitude, status, property_type, price, bedrooms, bathrooms,
                living_area, lot_size, year_built, description, pets_allowed, listing_url,
                virtual_tour_url, date_listed, agent_id, office_id,
                created_at, updated_at, synced_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $25, $25
            )
            "#,
        )
        .bind(id)
        .bind(&listing.mls_id)
        .bind(&listing.street_address)
        .bind(&listing.unit_number)
        .bind(&listing.city)
        .bind(&listing.state)
        .bind(&listing.zip)
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(listing.status.as_str())
        .bind(&listing.property_type)
        .bind(listing.price)
        .bind(listing.bedrooms)
        .bind(listing.bathrooms)
        .bind(listing.living_area)
        .bind(listing.lot_size)
        .bind(listing.year_built)
        .bind(&listing.description)
        .bind(listing.pets_allowed)
        .bind(&listing.listing_url)
        .bind(&listing.virtual_tour_url)
        .bind(listing.date_listed)
        .bind(agent_id)
        .bind(office_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
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
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET mls_id = $2, street_address = $3, unit_number = $4, city = $5,
                   state = $6, zip = $7, latitude = $8, longitude = $9, status = $10,
                   property_type = $11, price = $12, bedrooms = $13, bathrooms = $14,
                   living_area = $15, lot_size = $16, year_built = $17, description = $18,
                   pets_allowed = $19, listing_url = $20, virtual_tour_url = $21,
                   date_listed = $22, agent_id = $23, office_id = $24,
                   updated_at = $25, synced_at = $25
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&listing.mls_id)
        .bind(&listing.street_address)
        .bind(&listing.unit_number)
        .bind(&listing.city)
        .bind(&listing.state)
        .bind(&listing.zip)
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(listing.status.as_str())
        .bind(&listing.property_type)
        .bind(listing.price)
        .bind(listing.bedrooms)
        .bind(listing.bathrooms)
        .bind(listing.living_area)
        .bind(listing.lot_size)
        .bind(listing.year_built)
        .bind(&listing.description)
        .bind(listing.pets_allowed)
        .bind(&listing.listing_url)
        .bind(&listing.virtual_tour_url)
        .bind(listing.date_listed)
        .bind(agent_id)
        .bind(office_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ListingNotFound(id));
        }
        Ok(())
    }

    async fn clear_listing_media(&mut self, listing_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM listing_photos WHERE listing_id = $1")
            .bind(listing_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM open_houses WHERE listing_id = $1")
            .bind(listing_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_photo(
        &mut self,
        listing_id: Uuid,
        photo: &PhotoDraft,
        sort_order: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO listing_photos (id, listing_id, url, caption, sort_order) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(listing_id)
        .bind(&photo.url)
        .bind(&photo.caption)
        .bind(sort_order)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_open_house(
        &mut self,
        listing_id: Uuid,
        open_house: &OpenHouseDraft,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO open_houses (id, listing_id, date, start_time, end_time) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(listing_id)
        .bind(open_house.date)
        .bind(open_house.start_time)
        .bind(open_house.end_time)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn ListingTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn claim_sync_run(&self, log: &SyncLog) -> Result<bool, StoreError> {
        // Conflicts only on the partial unique index over non-terminal rows.
        let result = sqlx::query(
            r#"
            INSERT INTO sync_logs (id, status, trigger_kind, triggered_by, feed_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(log.id)
        .bind(log.status.as_str())
        .bind(log.trigger.as_str())
        .bind(&log.triggered_by)
        .bind(log.feed_id)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sync_running(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE sync_logs SET status = 'running', started_at = $2 WHERE id = $1")
                .bind(id)
                .bind(started_at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SyncLogNotFound(id));
        }
        Ok(())
    }

    async fn finish_sync_run(&self, log: &SyncLog) -> Result<(), StoreError> {
        let stats = &log.stats;
        let result = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = $2, feed_url = $3, feed_sha256 = $4, started_at = $5,
                   completed_at = $6, listings_created = $7, listings_updated = $8,
                   listings_deleted = $9, agents_created = $10, agents_updated = $11,
                   offices_created = $12, offices_updated = $13, photos_processed = $14,
                   open_houses_processed = $15, error_message = $16, error_chain = $17,
                   record_errors = $18
             WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(log.id)
        .bind(log.status.as_str())
        .bind(&log.feed_url)
        .bind(&log.feed_sha256)
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(i64::from(stats.listings_created))
        .bind(i64::from(stats.listings_updated))
        .bind(i64::from(stats.listings_deleted))
        .bind(i64::from(stats.agents_created))
        .bind(i64::from(stats.agents_updated))
        .bind(i64::from(stats.offices_created))
        .bind(i64::from(stats.offices_updated))
        .bind(i64::from(stats.photos_processed))
        .bind(i64::from(stats.open_houses_processed))
        .bind(&log.error_message)
        .bind(&log.error_chain)
        .bind(Json(&log.record_errors))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM sync_logs WHERE id = $1)",
            )
            .bind(log.id)
            .fetch_one(&self.pool)
            .await?;
            return Err(if exists {
                StoreError::SyncLogClosed(log.id)
            } else {
                StoreError::SyncLogNotFound(log.id)
            });
        }
        Ok(())
    }

    async fn reconcile_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = 'failed', completed_at = $2, error_message = $3
             WHERE status IN ('pending', 'running')
               AND COALESCE(started_at, created_at) < $1
            "#,
        )
        .bind(stale_before)
        .bind(now)
        .bind(ABANDONED_RUN_MESSAGE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_sync_running(&self) -> Result<bool, StoreError> {
        let running = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM sync_logs WHERE status = 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(running)
    }

    async fn get_sync_log(&self, id: Uuid) -> Result<Option<SyncLog>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sync_log_from_row).transpose()
    }

    async fn recent_sync_logs(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_log_from_row).collect()
    }

    async fn last_completed_sync(&self) -> Result<Option<SyncLog>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE status = 'completed' \
             ORDER BY completed_at DESC NULLS LAST LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_log_from_row).transpose()
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<SyncFeed>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FEED_COLUMNS} FROM sync_feeds WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(feed_from_row).transpose()
    }

    async fn list_feeds(&self) -> Result<Vec<SyncFeed>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {FEED_COLUMNS} FROM sync_feeds ORDER BY name"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(feed_from_row).collect()
    }

    async fn save_feed(&self, feed: &SyncFeed) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_feeds (
                id, name, feed_url, enabled, schedule_enabled, frequency,
                time_of_day, day_of_week, next_scheduled_run, last_synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE
              SET name = EXCLUDED.name,
                  feed_url = EXCLUDED.feed_url,
                  enabled = EXCLUDED.enabled,
                  schedule_enabled = EXCLUDED.schedule_enabled,
                  frequency = EXCLUDED.frequency,
                  time_of_day = EXCLUDED.time_of_day,
                  day_of_week = EXCLUDED.day_of_week,
                  next_scheduled_run = EXCLUDED.next_scheduled_run,
                  last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(feed.id)
        .bind(&feed.name)
        .bind(&feed.feed_url)
        .bind(feed.enabled)
        .bind(feed.schedule_enabled)
        .bind(feed.frequency.as_str())
        .bind(feed.time_of_day)
        .bind(feed.day_of_week.map(|d| d as i16))
        .bind(feed.next_scheduled_run)
        .bind(feed.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_listing(&self, mls_id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE mls_id = $1"
        ))
        .bind(mls_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn listing_photos(&self, listing_id: Uuid) -> Result<Vec<ListingPhoto>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, listing_id, url, caption, sort_order FROM listing_photos \
             WHERE listing_id = $1 ORDER BY sort_order",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ListingPhoto, StoreError> {
                Ok(ListingPhoto {
                    id: row.try_get("id")?,
                    listing_id: row.try_get("listing_id")?,
                    url: row.try_get("url")?,
                    caption: row.try_get("caption")?,
                    sort_order: row.try_get("sort_order")?,
                })
            })
            .collect()
    }

    async fn listing_open_houses(&self, listing_id: Uuid) -> Result<Vec<OpenHouse>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, listing_id, date, start_time, end_time FROM open_houses \
             WHERE listing_id = $1 ORDER BY date, start_time",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<OpenHouse, StoreError> {
                Ok(OpenHouse {
                    id: row.try_get("id")?,
                    listing_id: row.try_get("listing_id")?,
                    date: row.try_get("date")?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                })
            })
            .collect()
    }
}

fn counter(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ListingStatus::parse(&status).ok_or(StoreError::Decode {
        column: "listings.status",
        value: status,
    })?;
    Ok(Listing {
        id: row.try_get("id")?,
        fields: ListingDraft {
            mls_id: row.try_get("mls_id")?,
            street_address: row.try_get("street_address")?,
            unit_number: row.try_get("unit_number")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip: row.try_get("zip")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            status,
            property_type: row.try_get("property_type")?,
            price: row.try_get("price")?,
            bedrooms: row.try_get("bedrooms")?,
            bathrooms: row.try_get("bathrooms")?,
            living_area: row.try_get("living_area")?,
            lot_size: row.try_get("lot_size")?,
            year_built: row.try_get("year_built")?,
            description: row.try_get("description")?,
            pets_allowed: row.try_get("pets_allowed")?,
            listing_url: row.try_get("listing_url")?,
            virtual_tour_url: row.try_get("virtual_tour_url")?,
            date_listed: row.try_get("date_listed")?,
        },
        agent_id: row.try_get("agent_id")?,
        office_id: row.try_get("office_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLog, StoreError> {
    let status: String = row.try_get("status")?;
    let status = SyncStatus::parse(&status).ok_or(StoreError::Decode {
        column: "sync_logs.status",
        value: status,
    })?;
    let trigger: String = row.try_get("trigger_kind")?;
    let trigger = SyncTrigger::parse(&trigger).ok_or(StoreError::Decode {
        column: "sync_logs.trigger_kind",
        value: trigger,
    })?;
    let Json(record_errors): Json<Vec<RecordError>> = row.try_get("record_errors")?;

    Ok(SyncLog {
        id: row.try_get("id")?,
        status,
        trigger,
        triggered_by: row.try_get("triggered_by")?,
        feed_id: row.try_get("feed_id")?,
        feed_url: row.try_get("feed_url")?,
        feed_sha256: row.try_get("feed_sha256")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        stats: SyncStats {
            listings_created: counter(row, "listings_created")?,
            listings_updated: counter(row, "listings_updated")?,
            listings_deleted: counter(row, "listings_deleted")?,
            agents_created: counter(row, "agents_created")?,
            agents_updated: counter(row, "agents_updated")?,
            offices_created: counter(row, "offices_created")?,
            offices_updated: counter(row, "offices_updated")?,
            photos_processed: counter(row, "photos_processed")?,
            open_houses_processed: counter(row, "open_houses_processed")?,
        },
        error_message: row.try_get("error_message")?,
        error_chain: row.try_get("error_chain")?,
        record_errors,
    })
}

fn feed_from_row(row: &PgRow) -> Result<SyncFeed, StoreError> {
    let frequency: String = row.try_get("frequency")?;
    let time_of_day: NaiveTime = row.try_get("time_of_day")?;
    let day_of_week: Option<i16> = row.try_get("day_of_week")?;
    Ok(SyncFeed {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        feed_url: row.try_get("feed_url")?,
        enabled: row.try_get("enabled")?,
        schedule_enabled: row.try_get("schedule_enabled")?,
        frequency: SyncFrequency::parse_lossy(&frequency),
        time_of_day,
        day_of_week: day_of_week.and_then(|d| u32::try_from(d).ok()),
        next_scheduled_run: row.try_get("next_scheduled_run")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}
