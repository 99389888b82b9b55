//! XML listing feed contract: raw record types, parsing and fetching.
//!
//! The feed is a `Listings` document holding zero or more `Listing`
//! elements. Repeatable elements (`Listing`, `Pictures/Picture`,
//! `OpenHouses/OpenHouse`) are always deserialized into `Vec`s, so a
//! document with a single occurrence still yields a one-element sequence,
//! and unrelated siblings between repeats do not split the sequence.
//!
//! Fetched bytes are decoded per their BOM or XML declaration before
//! parsing; UTF-8 is assumed when neither is present.

use std::borrow::Cow;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use mls_storage::{FetchError, HttpFetcher};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mls-feed";

const ROOT_ELEMENT: &str = "Listings";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed listing feed: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("malformed listing feed: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("not a listing feed: root element is <{0}>")]
    UnexpectedRoot(String),
    #[error("not a listing feed: no root element")]
    MissingRoot,
    #[error("unsupported listing feed encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("listing feed is not valid {0} text")]
    Undecodable(&'static str),
}

/// One `Listing` element, fields kept as the raw feed text.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawListing {
    pub location: RawLocation,
    pub listing_details: RawListingDetails,
    pub basic_details: RawBasicDetails,
    #[serde(deserialize_with = "pictures")]
    pub pictures: Vec<RawPicture>,
    #[serde(deserialize_with = "open_houses")]
    pub open_houses: Vec<RawOpenHouse>,
    pub agent: Option<RawAgent>,
    pub office: Option<RawOffice>,
    pub rental_details: Option<RawRentalDetails>,
}

impl RawListing {
    pub fn mls_id(&self) -> Option<&str> {
        self.listing_details.mls_id.as_deref()
    }

    /// `RentalDetails/PetsAllowed/NoPets`, when present.
    pub fn no_pets(&self) -> Option<&str> {
        self.rental_details
            .as_ref()?
            .pets_allowed
            .as_ref()?
            .no_pets
            .as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawLocation {
    pub street_address: Option<String>,
    pub unit_number: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    #[serde(alias = "Lat")]
    pub latitude: Option<String>,
    #[serde(alias = "Long")]
    pub longitude: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawListingDetails {
    pub status: Option<String>,
    pub price: Option<String>,
    pub mls_id: Option<String>,
    pub mls_name: Option<String>,
    pub listing_url: Option<String>,
    pub virtual_tour_url: Option<String>,
    pub date_listed: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawBasicDetails {
    pub property_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub full_bathrooms: Option<String>,
    pub half_bathrooms: Option<String>,
    pub living_area: Option<String>,
    pub lot_size: Option<String>,
    pub year_built: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawPicture {
    pub picture_url: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawOpenHouse {
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawAgent {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_address: Option<String>,
    pub mobile_phone_line_number: Option<String>,
    pub office_line_number: Option<String>,
    pub license_num: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawOffice {
    pub brokerage_name: Option<String>,
    pub office_name: Option<String>,
    pub broker_phone: Option<String>,
    pub broker_email: Option<String>,
    pub broker_website: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawRentalDetails {
    pub pets_allowed: Option<RawPetsAllowed>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawPetsAllowed {
    pub no_pets: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedDocument {
    #[serde(rename = "Listing", default)]
    listings: Vec<RawListing>,
}

fn pictures<'de, D>(deserializer: D) -> Result<Vec<RawPicture>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Pictures {
        #[serde(rename = "Picture", default)]
        items: Vec<RawPicture>,
    }
    Ok(Option::<Pictures>::deserialize(deserializer)?
        .map(|p| p.items)
        .unwrap_or_default())
}

fn open_houses<'de, D>(deserializer: D) -> Result<Vec<RawOpenHouse>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct OpenHouses {
        #[serde(rename = "OpenHouse", default)]
        items: Vec<RawOpenHouse>,
    }
    Ok(Option::<OpenHouses>::deserialize(deserializer)?
        .map(|o| o.items)
        .unwrap_or_default())
}

/// What precedes the document element: the declared encoding label and the
/// root element's name.
#[derive(Debug, Default)]
struct Prolog {
    encoding: Option<Vec<u8>>,
    root: Option<String>,
}

fn read_prolog(bytes: &[u8]) -> Result<Prolog, FeedError> {
    let mut reader = Reader::from_reader(bytes);
    let mut prolog = Prolog::default();
    loop {
        match reader.read_event()? {
            Event::Decl(decl) => {
                if let Some(label) = decl.encoding() {
                    prolog.encoding = Some(label.map_err(quick_xml::Error::from)?.into_owned());
                }
            }
            Event::Start(start) | Event::Empty(start) => {
                prolog.root =
                    Some(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                return Ok(prolog);
            }
            Event::Eof => return Ok(prolog),
            _ => {}
        }
    }
}

/// Decodes fetched feed bytes to text. A BOM wins over the declaration;
/// input that is invalid in the chosen encoding is rejected, never patched
/// with replacement characters.
pub fn decode_feed(body: &[u8]) -> Result<Cow<'_, str>, FeedError> {
    let (encoding, text) = match Encoding::for_bom(body) {
        Some((encoding, bom_len)) => (encoding, &body[bom_len..]),
        None => {
            let encoding = match read_prolog(body)?.encoding {
                Some(label) => Encoding::for_label(&label).ok_or_else(|| {
                    FeedError::UnsupportedEncoding(String::from_utf8_lossy(&label).into_owned())
                })?,
                None => UTF_8,
            };
            (encoding, body)
        }
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(text)
        .ok_or(FeedError::Undecodable(encoding.name()))
}

/// Parses a feed document into its listing records, in document order.
/// Documents whose root is not `Listings` are rejected.
pub fn parse_feed(content: &str) -> Result<Vec<RawListing>, FeedError> {
    match read_prolog(content.as_bytes())?.root {
        Some(root) if root == ROOT_ELEMENT => {}
        Some(root) => return Err(FeedError::UnexpectedRoot(root)),
        None => return Err(FeedError::MissingRoot),
    }
    let document: FeedDocument = quick_xml::de::from_str(content)?;
    debug!(listings = document.listings.len(), "parsed listing feed");
    Ok(document.listings)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPayload {
    pub source_url: String,
    pub body: Vec<u8>,
}

impl FeedPayload {
    pub fn text(&self) -> Result<Cow<'_, str>, FeedError> {
        decode_feed(&self.body)
    }
}

/// Retrieves raw feed content from a URL. The orchestrator only sees this
/// seam, so tests can substitute canned responses and failures.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_feed(&self, sync_log_id: Uuid, url: &str) -> Result<FeedPayload, FetchError>;
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch_feed(&self, sync_log_id: Uuid, url: &str) -> Result<FeedPayload, FetchError> {
        let response = self.fetch_bytes(sync_log_id, url).await?;
        Ok(FeedPayload {
            source_url: response.final_url,
            body: response.body,
        })
    }
}
