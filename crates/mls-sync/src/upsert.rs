//! Idempotent create-or-update of one feed record and its dependents.

use chrono::{DateTime, Utc};
use mls_core::normalize::{
    clean_value, parse_date, parse_integer, parse_number, parse_time, pets_allowed_from_no_pets,
};
use mls_core::{ListingDraft, ListingStatus, OpenHouseDraft, PhotoDraft, SyncStats};
use mls_feed::RawListing;
use mls_storage::{ListingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::resolver::{resolve_agent, resolve_office};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("listing record has no MlsId")]
    MissingMlsId,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub action: UpsertAction,
    pub mls_id: String,
}

/// Normalized listing fields for one record.
pub fn listing_draft(raw: &RawListing) -> Result<ListingDraft, UpsertError> {
    let details = &raw.listing_details;
    let basic = &raw.basic_details;
    let location = &raw.location;

    let mls_id = clean_value(details.mls_id.as_deref()).ok_or(UpsertError::MissingMlsId)?;

    Ok(ListingDraft {
        mls_id,
        street_address: clean_value(location.street_address.as_deref()),
        unit_number: clean_value(location.unit_number.as_deref()),
        city: clean_value(location.city.as_deref()),
        state: clean_value(location.state.as_deref()),
        zip: clean_value(location.zip.as_deref()),
        latitude: parse_number(location.latitude.as_deref()),
        longitude: parse_number(location.longitude.as_deref()),
        status: ListingStatus::from_feed(clean_value(details.status.as_deref()).as_deref()),
        property_type: clean_value(basic.property_type.as_deref()),
        price: parse_number(details.price.as_deref()),
        bedrooms: parse_i32(basic.bedrooms.as_deref()),
        bathrooms: bathrooms(raw),
        living_area: parse_i32(basic.living_area.as_deref()),
        lot_size: parse_number(basic.lot_size.as_deref()),
        year_built: parse_i32(basic.year_built.as_deref()),
        description: clean_value(basic.description.as_deref())
            .or_else(|| clean_value(basic.title.as_deref())),
        pets_allowed: pets_allowed_from_no_pets(raw.no_pets()),
        listing_url: clean_value(details.listing_url.as_deref()),
        virtual_tour_url: clean_value(details.virtual_tour_url.as_deref()),
        date_listed: parse_date(details.date_listed.as_deref()),
    })
}

fn parse_i32(raw: Option<&str>) -> Option<i32> {
    parse_integer(raw).and_then(|v| i32::try_from(v).ok())
}

/// `Bathrooms` when present, otherwise full baths plus half a bath per half bath.
fn bathrooms(raw: &RawListing) -> Option<f64> {
    let basic = &raw.basic_details;
    if let Some(total) = parse_number(basic.bathrooms.as_deref()) {
        return Some(total);
    }
    let full = parse_number(basic.full_bathrooms.as_deref());
    let half = parse_number(basic.half_bathrooms.as_deref());
    if full.is_none() && half.is_none() {
        return None;
    }
    Some(full.unwrap_or(0.0) + 0.5 * half.unwrap_or(0.0))
}

pub fn photo_drafts(raw: &RawListing) -> Vec<PhotoDraft> {
    raw.pictures
        .iter()
        .filter_map(|picture| {
            Some(PhotoDraft {
                url: clean_value(picture.picture_url.as_deref())?,
                caption: clean_value(picture.caption.as_deref()),
            })
        })
        .collect()
}

/// Entries missing or failing to parse any of date, start or end are dropped.
pub fn open_house_drafts(raw: &RawListing) -> Vec<OpenHouseDraft> {
    raw.open_houses
        .iter()
        .filter_map(|open_house| {
            Some(OpenHouseDraft {
                date: parse_date(open_house.date.as_deref())?,
                start_time: parse_time(open_house.start_time.as_deref())?,
                end_time: parse_time(open_house.end_time.as_deref())?,
            })
        })
        .collect()
}

/// Writes one record inside a single transaction. `stats` only receives the
/// agent, office, photo and open-house deltas once the transaction commits;
/// listing counters are left to the caller.
pub async fn upsert_listing(
    store: &dyn ListingStore,
    raw: &RawListing,
    stats: &mut SyncStats,
    now: DateTime<Utc>,
) -> Result<UpsertResult, UpsertError> {
    let mut delta = SyncStats::default();
    let mut tx = store.begin().await?;

    let agent_id = resolve_agent(tx.as_mut(), raw.agent.as_ref(), &mut delta).await?;
    let office_id = resolve_office(tx.as_mut(), raw.office.as_ref(), &mut delta).await?;

    let draft = listing_draft(raw)?;

    let (listing_id, action) = match tx.find_listing_id(&draft.mls_id).await? {
        Some(id) => {
            tx.update_listing(id, &draft, agent_id, office_id, now).await?;
            tx.clear_listing_media(id).await?;
            (id, UpsertAction::Updated)
        }
        None => {
            let id = tx.insert_listing(&draft, agent_id, office_id, now).await?;
            (id, UpsertAction::Created)
        }
    };

    for (position, photo) in photo_drafts(raw).iter().enumerate() {
        let sort_order = i32::try_from(position).unwrap_or(i32::MAX);
        tx.insert_photo(listing_id, photo, sort_order).await?;
        delta.photos_processed += 1;
    }

    for open_house in open_house_drafts(raw) {
        tx.insert_open_house(listing_id, &open_house).await?;
        delta.open_houses_processed += 1;
    }

    tx.commit().await?;
    stats.merge(&delta);

    debug!(mls_id = %draft.mls_id, ?action, %listing_id, "listing upserted");
    Ok(UpsertResult {
        action,
        mls_id: draft.mls_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use mls_feed::{RawAgent, RawOpenHouse, RawPicture};
    use mls_storage::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 9, 30, 0).unwrap()
    }

    fn picture(url: Option<&str>) -> RawPicture {
        RawPicture {
            picture_url: url.map(str::to_string),
            caption: None,
        }
    }

    fn record(mls_id: Option<&str>) -> RawListing {
        let mut raw = RawListing::default();
        raw.listing_details.mls_id = mls_id.map(str::to_string);
        raw.listing_details.price = Some("$415,000".into());
        raw.listing_details.status = Some("For Rent".into());
        raw.basic_details.bedrooms = Some("3".into());
        raw.basic_details.full_bathrooms = Some("2".into());
        raw.basic_details.half_bathrooms = Some("1".into());
        raw.basic_details.title = Some("Bright corner unit".into());
        raw.pictures = vec![
            picture(Some("https://img.example.com/a.jpg")),
            picture(None),
            picture(Some("https://img.example.com/b.jpg")),
        ];
        raw.open_houses = vec![
            RawOpenHouse {
                date: Some("2026-10-18".into()),
                start_time: Some("1:00 PM".into()),
                end_time: Some("3:00 PM".into()),
            },
            RawOpenHouse {
                date: Some("2026-10-19".into()),
                start_time: Some("10:00".into()),
                end_time: None,
            },
        ];
        raw
    }

    #[test]
    fn draft_normalizes_feed_text() {
        let draft = listing_draft(&record(Some(" A-100 "))).unwrap();
        assert_eq!(draft.mls_id, "A-100");
        assert_eq!(draft.price, Some(415_000.0));
        assert_eq!(draft.status, ListingStatus::ForRent);
        assert_eq!(draft.bedrooms, Some(3));
        assert_eq!(draft.bathrooms, Some(2.5));
        assert_eq!(draft.description.as_deref(), Some("Bright corner unit"));
        assert_eq!(draft.pets_allowed, None);
    }

    #[test]
    fn missing_mls_id_is_rejected() {
        assert!(matches!(
            listing_draft(&record(Some("  "))),
            Err(UpsertError::MissingMlsId)
        ));
    }

    #[test]
    fn incomplete_open_houses_and_urlless_photos_are_dropped() {
        let raw = record(Some("A-100"));
        let photos = photo_drafts(&raw);
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[1].url, "https://img.example.com/b.jpg");

        let open_houses = open_house_drafts(&raw);
        assert_eq!(open_houses.len(), 1);
        assert_eq!(open_houses[0].date, NaiveDate::from_ymd_opt(2026, 10, 18).unwrap());
        assert_eq!(open_houses[0].start_time, NaiveTime::from_hms_opt(13, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn first_upsert_creates_and_second_updates() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let raw = record(Some("A-100"));

        let first = upsert_listing(&store, &raw, &mut stats, now()).await.unwrap();
        let second = upsert_listing(&store, &raw, &mut stats, now()).await.unwrap();

        assert_eq!(first.action, UpsertAction::Created);
        assert_eq!(second.action, UpsertAction::Updated);
        assert_eq!(store.listings().await.len(), 1);

        let listing = store.find_listing("A-100").await.unwrap().unwrap();
        let photos = store.listing_photos(listing.id).await.unwrap();
        let sort_orders: Vec<i32> = photos.iter().map(|p| p.sort_order).collect();
        assert_eq!(sort_orders, vec![0, 1]);
        assert_eq!(store.listing_open_houses(listing.id).await.unwrap().len(), 1);

        assert_eq!(stats.photos_processed, 4);
        assert_eq!(stats.open_houses_processed, 2);
    }

    #[tokio::test]
    async fn failed_record_rolls_back_its_new_agent() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let mut raw = record(None);
        raw.agent = Some(RawAgent {
            first_name: Some("Mira".into()),
            email_address: Some("mira@realty.example.com".into()),
            ..Default::default()
        });

        let err = upsert_listing(&store, &raw, &mut stats, now())
            .await
            .unwrap_err();

        assert!(matches!(err, UpsertError::MissingMlsId));
        assert!(store.agents().await.is_empty());
        assert!(store.listings().await.is_empty());
        assert!(stats.is_zero());
    }
}
