//! Agent and office deduplication, run inside the owning listing's transaction.
//!
//! A match is counted as an update but the stored row is left untouched;
//! sync never rewrites agent or office attributes.

use mls_core::normalize::clean_value;
use mls_core::{AgentDraft, OfficeDraft, SyncStats};
use mls_feed::{RawAgent, RawOffice};
use mls_storage::{ListingTx, StoreError};
use tracing::debug;
use uuid::Uuid;

pub fn agent_draft(raw: &RawAgent) -> AgentDraft {
    AgentDraft {
        first_name: clean_value(raw.first_name.as_deref()),
        last_name: clean_value(raw.last_name.as_deref()),
        email: clean_value(raw.email_address.as_deref()),
        phone: clean_value(raw.office_line_number.as_deref())
            .or_else(|| clean_value(raw.mobile_phone_line_number.as_deref())),
        license_number: clean_value(raw.license_num.as_deref()),
    }
}

pub fn office_draft(raw: &RawOffice) -> Option<OfficeDraft> {
    let name = clean_value(raw.brokerage_name.as_deref())
        .or_else(|| clean_value(raw.office_name.as_deref()))?;
    Some(OfficeDraft {
        name,
        phone: clean_value(raw.broker_phone.as_deref()),
        email: clean_value(raw.broker_email.as_deref()),
        website: clean_value(raw.broker_website.as_deref()),
        street_address: clean_value(raw.street_address.as_deref()),
        city: clean_value(raw.city.as_deref()),
        state: clean_value(raw.state.as_deref()),
        zip: clean_value(raw.zip.as_deref()),
    })
}

/// Returns `None` when the record carries neither an email nor a first name.
pub async fn resolve_agent(
    tx: &mut dyn ListingTx,
    raw: Option<&RawAgent>,
    stats: &mut SyncStats,
) -> Result<Option<Uuid>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let draft = agent_draft(raw);
    if draft.email.is_none() && draft.first_name.is_none() {
        return Ok(None);
    }

    if let Some(email) = draft.email.as_deref() {
        if let Some(id) = tx.find_agent_by_email(email).await? {
            debug!(%id, email, "matched existing agent");
            stats.agents_updated += 1;
            return Ok(Some(id));
        }
    }

    let id = tx.insert_agent(&draft).await?;
    stats.agents_created += 1;
    Ok(Some(id))
}

/// Returns `None` when the record has no office name.
pub async fn resolve_office(
    tx: &mut dyn ListingTx,
    raw: Option<&RawOffice>,
    stats: &mut SyncStats,
) -> Result<Option<Uuid>, StoreError> {
    let Some(draft) = raw.and_then(office_draft) else {
        return Ok(None);
    };

    if let Some(id) = tx.find_office_by_name(&draft.name).await? {
        debug!(%id, name = %draft.name, "matched existing office");
        stats.offices_updated += 1;
        return Ok(Some(id));
    }

    let id = tx.insert_office(&draft).await?;
    stats.offices_created += 1;
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_storage::{ListingStore, MemoryStore};

    fn agent(email: Option<&str>, first_name: Option<&str>) -> RawAgent {
        RawAgent {
            first_name: first_name.map(str::to_string),
            last_name: Some("Okafor".into()),
            email_address: email.map(str::to_string),
            office_line_number: Some("555-0100".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_email_resolves_to_one_agent() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let raw = agent(Some("ada@realty.example.com"), Some("Ada"));

        let mut tx = store.begin().await.unwrap();
        let first = resolve_agent(tx.as_mut(), Some(&raw), &mut stats)
            .await
            .unwrap();
        let second = resolve_agent(tx.as_mut(), Some(&raw), &mut stats)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(stats.agents_created, 1);
        assert_eq!(stats.agents_updated, 1);
        let agents = store.agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].fields.phone.as_deref(), Some("555-0100"));
    }

    #[tokio::test]
    async fn agent_without_email_is_always_created() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let raw = agent(None, Some("Ada"));

        let mut tx = store.begin().await.unwrap();
        let first = resolve_agent(tx.as_mut(), Some(&raw), &mut stats)
            .await
            .unwrap();
        let second = resolve_agent(tx.as_mut(), Some(&raw), &mut stats)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(stats.agents_created, 2);
        assert_eq!(stats.agents_updated, 0);
    }

    #[tokio::test]
    async fn anonymous_agent_and_nameless_office_resolve_to_nothing() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let mut tx = store.begin().await.unwrap();

        let agent_id = resolve_agent(tx.as_mut(), Some(&agent(Some("  "), None)), &mut stats)
            .await
            .unwrap();
        let office_id = resolve_office(
            tx.as_mut(),
            Some(&RawOffice {
                brokerage_name: Some("null".into()),
                ..Default::default()
            }),
            &mut stats,
        )
        .await
        .unwrap();

        assert!(agent_id.is_none());
        assert!(office_id.is_none());
        assert!(stats.is_zero());
    }

    #[tokio::test]
    async fn offices_match_on_exact_name() {
        let store = MemoryStore::new();
        let mut stats = SyncStats::default();
        let office = RawOffice {
            brokerage_name: Some("Harbor Point Realty".into()),
            broker_phone: Some("555-0199".into()),
            ..Default::default()
        };
        let other_case = RawOffice {
            brokerage_name: Some("HARBOR POINT REALTY".into()),
            ..Default::default()
        };

        let mut tx = store.begin().await.unwrap();
        let a = resolve_office(tx.as_mut(), Some(&office), &mut stats).await.unwrap();
        let b = resolve_office(tx.as_mut(), Some(&office), &mut stats).await.unwrap();
        let c = resolve_office(tx.as_mut(), Some(&other_case), &mut stats)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(stats.offices_created, 2);
        assert_eq!(stats.offices_updated, 1);
        assert_eq!(store.offices().await.len(), 2);
    }

    #[test]
    fn office_name_falls_back_to_office_name_element() {
        let draft = office_draft(&RawOffice {
            office_name: Some(" Lakeside Branch ".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(draft.name, "Lakeside Branch");
    }
}
