//! Core domain model for the MLS feed sync engine.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;
pub mod schedule;

pub const CRATE_NAME: &str = "mls-core";

/// Market status of a listing as published by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Active,
    Pending,
    Contingent,
    ComingSoon,
    ForRent,
    Sold,
    Rented,
    Withdrawn,
    OffMarket,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Contingent => "contingent",
            Self::ComingSoon => "coming_soon",
            Self::ForRent => "for_rent",
            Self::Sold => "sold",
            Self::Rented => "rented",
            Self::Withdrawn => "withdrawn",
            Self::OffMarket => "off_market",
        }
    }

    /// Parses the stored form written by [`ListingStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "active" => Self::Active,
            "pending" => Self::Pending,
            "contingent" => Self::Contingent,
            "coming_soon" => Self::ComingSoon,
            "for_rent" => Self::ForRent,
            "sold" => Self::Sold,
            "rented" => Self::Rented,
            "withdrawn" => Self::Withdrawn,
            "off_market" => Self::OffMarket,
            _ => return None,
        })
    }

    /// Maps the feed's free-text status ("For Rent", "Coming Soon", ...).
    /// Missing or unknown statuses are treated as active inventory.
    pub fn from_feed(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Active;
        };
        let key = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>();
        match key.as_str() {
            "pending" | "undercontract" => Self::Pending,
            "contingent" | "activecontingent" | "activeundercontract" => Self::Contingent,
            "comingsoon" => Self::ComingSoon,
            "forrent" | "rental" | "forlease" => Self::ForRent,
            "sold" | "closed" => Self::Sold,
            "rented" | "leased" => Self::Rented,
            "withdrawn" | "cancelled" | "canceled" => Self::Withdrawn,
            "offmarket" | "expired" => Self::OffMarket,
            _ => Self::Active,
        }
    }
}

/// Normalized listing projection built from one feed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub mls_id: String,
    pub street_address: Option<String>,
    pub unit_number: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: ListingStatus,
    pub property_type: Option<String>,
    pub price: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub living_area: Option<i32>,
    pub lot_size: Option<f64>,
    pub year_built: Option<i32>,
    pub description: Option<String>,
    pub pets_allowed: Option<bool>,
    pub listing_url: Option<String>,
    pub virtual_tour_url: Option<String>,
    pub date_listed: Option<NaiveDate>,
}

/// Persisted listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: ListingDraft,
    pub agent_id: Option<Uuid>,
    pub office_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoDraft {
    pub url: String,
    pub caption: Option<String>,
}

/// Image owned by one listing; `sort_order` 0 is the representative photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPhoto {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub url: String,
    pub caption: Option<String>,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHouseDraft {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHouse {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentDraft {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub license_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: AgentDraft,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OfficeDraft {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Office {
    pub id: Uuid,
    #[serde(flatten)]
    pub fields: OfficeDraft,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
    Webhook,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

/// The nine per-run counters kept on every ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStats {
    pub listings_created: u32,
    pub listings_updated: u32,
    pub listings_deleted: u32,
    pub agents_created: u32,
    pub agents_updated: u32,
    pub offices_created: u32,
    pub offices_updated: u32,
    pub photos_processed: u32,
    pub open_houses_processed: u32,
}

impl SyncStats {
    pub fn merge(&mut self, other: &SyncStats) {
        self.listings_created += other.listings_created;
        self.listings_updated += other.listings_updated;
        self.listings_deleted += other.listings_deleted;
        self.agents_created += other.agents_created;
        self.agents_updated += other.agents_updated;
        self.offices_created += other.offices_created;
        self.offices_updated += other.offices_updated;
        self.photos_processed += other.photos_processed;
        self.open_houses_processed += other.open_houses_processed;
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// A single feed record that failed to upsert during an otherwise completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub mls_id: Option<String>,
    pub message: String,
}

/// Run ledger entry: one row per sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub status: SyncStatus,
    pub trigger: SyncTrigger,
    pub triggered_by: Option<String>,
    pub feed_id: Option<Uuid>,
    pub feed_url: Option<String>,
    pub feed_sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: SyncStats,
    pub error_message: Option<String>,
    pub error_chain: Option<String>,
    pub record_errors: Vec<RecordError>,
}

impl SyncLog {
    pub fn pending(
        trigger: SyncTrigger,
        triggered_by: Option<String>,
        feed_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SyncStatus::Pending,
            trigger,
            triggered_by,
            feed_id,
            feed_url: None,
            feed_sha256: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            stats: SyncStats::default(),
            error_message: None,
            error_chain: None,
            record_errors: Vec::new(),
        }
    }
}

/// How often a configured feed should be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Hourly,
    #[serde(rename = "every_6_hours")]
    Every6Hours,
    #[serde(rename = "every_12_hours")]
    Every12Hours,
    Daily,
    Weekly,
}

impl SyncFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Every6Hours => "every_6_hours",
            Self::Every12Hours => "every_12_hours",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// Unrecognized values fall back to `Daily`.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "every_6_hours" => Self::Every6Hours,
            "every_12_hours" => Self::Every12Hours,
            "weekly" => Self::Weekly,
            _ => Self::Daily,
        }
    }
}

/// Configured feed source, owned by the feed-configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFeed {
    pub id: Uuid,
    pub name: String,
    pub feed_url: String,
    pub enabled: bool,
    pub schedule_enabled: bool,
    pub frequency: SyncFrequency,
    pub time_of_day: NaiveTime,
    pub day_of_week: Option<u32>,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncFeed {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.schedule_enabled
            && self.next_scheduled_run.map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn feed_status_text_maps_to_enum() {
        assert_eq!(ListingStatus::from_feed(Some("For Rent")), ListingStatus::ForRent);
        assert_eq!(ListingStatus::from_feed(Some("coming-soon")), ListingStatus::ComingSoon);
        assert_eq!(ListingStatus::from_feed(Some("PENDING")), ListingStatus::Pending);
        assert_eq!(ListingStatus::from_feed(Some("Mystery")), ListingStatus::Active);
        assert_eq!(ListingStatus::from_feed(None), ListingStatus::Active);
    }

    #[test]
    fn stored_status_round_trips_through_text() {
        for status in [
            ListingStatus::Active,
            ListingStatus::ForRent,
            ListingStatus::OffMarket,
        ] {
            assert_eq!(ListingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("running"), Some(SyncStatus::Running));
        assert!(SyncStatus::Failed.is_terminal());
        assert!(!SyncStatus::Pending.is_terminal());
    }

    #[test]
    fn unknown_frequency_falls_back_to_daily() {
        assert_eq!(SyncFrequency::parse_lossy("every_6_hours"), SyncFrequency::Every6Hours);
        assert_eq!(SyncFrequency::parse_lossy("fortnightly"), SyncFrequency::Daily);
    }

    #[test]
    fn stats_merge_adds_every_counter() {
        let mut total = SyncStats {
            listings_created: 1,
            photos_processed: 3,
            ..Default::default()
        };
        total.merge(&SyncStats {
            listings_created: 2,
            agents_updated: 1,
            photos_processed: 4,
            ..Default::default()
        });
        assert_eq!(total.listings_created, 3);
        assert_eq!(total.agents_updated, 1);
        assert_eq!(total.photos_processed, 7);
        assert!(!total.is_zero());
        assert!(SyncStats::default().is_zero());
    }

    #[test]
    fn feed_without_next_run_is_due_when_enabled() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap();
        let mut feed = SyncFeed {
            id: Uuid::new_v4(),
            name: "primary".into(),
            feed_url: "https://feeds.example.com/listings.xml".into(),
            enabled: true,
            schedule_enabled: true,
            frequency: SyncFrequency::Daily,
            time_of_day: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            day_of_week: None,
            next_scheduled_run: None,
            last_synced_at: None,
        };
        assert!(feed.is_due(now));
        feed.next_scheduled_run = Some(now + chrono::Duration::minutes(5));
        assert!(!feed.is_due(now));
        feed.next_scheduled_run = Some(now);
        feed.schedule_enabled = false;
        assert!(!feed.is_due(now));
    }
}
