//! `feeds.yaml` registry used to seed configured feeds.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mls_core::schedule::{next_run_after, parse_time_of_day};
use mls_core::{SyncFeed, SyncFrequency};
use mls_storage::ListingStore;
use serde::Deserialize;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    /// Stable id; derived from `name` when omitted.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub feed_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default = "default_time_of_day")]
    pub time_of_day: String,
    #[serde(default)]
    pub day_of_week: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_frequency() -> String {
    SyncFrequency::Daily.as_str().to_string()
}

fn default_time_of_day() -> String {
    "00:00:00".to_string()
}

impl FeedRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

impl FeedEntry {
    pub fn feed_id(&self) -> Uuid {
        self.id
            .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, self.name.as_bytes()))
    }

    pub fn to_feed(&self, now: DateTime<Utc>) -> Result<SyncFeed> {
        let time_of_day = parse_time_of_day(&self.time_of_day)
            .with_context(|| format!("feed {}: invalid time_of_day {:?}", self.name, self.time_of_day))?;
        if let Some(day) = self.day_of_week {
            if day > 6 {
                bail!("feed {}: day_of_week must be 0 (Sunday) to 6, got {day}", self.name);
            }
        }
        let frequency = SyncFrequency::parse_lossy(&self.frequency);
        let next_scheduled_run = self
            .schedule_enabled
            .then(|| next_run_after(now, frequency, time_of_day, self.day_of_week));

        Ok(SyncFeed {
            id: self.feed_id(),
            name: self.name.clone(),
            feed_url: self.feed_url.trim().to_string(),
            enabled: self.enabled,
            schedule_enabled: self.schedule_enabled,
            frequency,
            time_of_day,
            day_of_week: self.day_of_week,
            next_scheduled_run,
            last_synced_at: None,
        })
    }
}

/// Upserts every registry entry, keeping `last_synced_at` of feeds that
/// already exist. Returns the number of feeds written.
pub async fn import_feeds(
    store: &dyn ListingStore,
    registry: &FeedRegistry,
    now: DateTime<Utc>,
) -> Result<usize> {
    for entry in &registry.feeds {
        let mut feed = entry.to_feed(now)?;
        if let Some(existing) = store
            .get_feed(feed.id)
            .await
            .with_context(|| format!("loading feed {}", feed.name))?
        {
            feed.last_synced_at = existing.last_synced_at;
        }
        store
            .save_feed(&feed)
            .await
            .with_context(|| format!("saving feed {}", feed.name))?;
        info!(feed_id = %feed.id, feed = %feed.name, "feed imported");
    }
    Ok(registry.feeds.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use mls_storage::MemoryStore;
    use std::io::Write;

    const REGISTRY: &str = r#"
feeds:
  - name: metro-residential
    feed_url: https://feeds.example.com/metro.xml
    schedule_enabled: true
    frequency: every_6_hours
  - name: coastal-rentals
    feed_url: " https://feeds.example.com/coastal.xml "
    enabled: false
    frequency: fortnightly
    time_of_day: "04:30"
"#;

    #[tokio::test]
    async fn loads_registry_from_disk_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();

        let registry = FeedRegistry::load(file.path()).await.unwrap();
        assert_eq!(registry.feeds.len(), 2);

        let now = Utc.with_ymd_and_hms(2026, 10, 14, 7, 15, 0).unwrap();
        let metro = registry.feeds[0].to_feed(now).unwrap();
        assert!(metro.enabled);
        assert_eq!(metro.frequency, SyncFrequency::Every6Hours);
        assert_eq!(
            metro.next_scheduled_run,
            Some(Utc.with_ymd_and_hms(2026, 10, 14, 12, 0, 0).unwrap())
        );

        let coastal = registry.feeds[1].to_feed(now).unwrap();
        assert!(!coastal.enabled);
        assert_eq!(coastal.frequency, SyncFrequency::Daily);
        assert_eq!(coastal.time_of_day, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert_eq!(coastal.feed_url, "https://feeds.example.com/coastal.xml");
        assert_eq!(coastal.next_scheduled_run, None);
    }

    #[tokio::test]
    async fn reimport_keeps_ids_and_last_sync() {
        let store = MemoryStore::new();
        let registry = FeedRegistry::parse(REGISTRY).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 7, 15, 0).unwrap();

        assert_eq!(import_feeds(&store, &registry, now).await.unwrap(), 2);
        let mut metro = store
            .get_feed(registry.feeds[0].feed_id())
            .await
            .unwrap()
            .unwrap();
        metro.last_synced_at = Some(now);
        store.save_feed(&metro).await.unwrap();

        import_feeds(&store, &registry, now).await.unwrap();
        let feeds = store.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
        let metro = store.get_feed(metro.id).await.unwrap().unwrap();
        assert_eq!(metro.last_synced_at, Some(now));
    }

    #[test]
    fn rejects_bad_time_and_weekday() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 7, 15, 0).unwrap();
        let registry = FeedRegistry::parse(
            r#"
feeds:
  - name: a
    feed_url: https://feeds.example.com/a.xml
    time_of_day: "25:99"
  - name: b
    feed_url: https://feeds.example.com/b.xml
    day_of_week: 9
"#,
        )
        .unwrap();
        assert!(registry.feeds[0].to_feed(now).is_err());
        assert!(registry.feeds[1].to_feed(now).is_err());
    }
}
