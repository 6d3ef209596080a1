// Structs that map onto the tables in schema.sql, plus the loosely shaped rows we read from
// spreadsheets and JSON exports before they are turned into listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt::Display;
use uuid::Uuid;

use crate::places::{LatLng, NearbyPlace, OpeningHours, PlaceDetails};

/// Persisted progress of a job. `position` is a row offset for file sources and the last
/// processed listing id for database sources.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, sqlx::FromRow)]
#[sqlx(default)]
pub struct Checkpoint {
    pub job: String,
    pub position: i64,
    pub total_processed: i64,
    pub total_written: i64,
    pub last_run_id: Option<Uuid>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.into(),
            ..Default::default()
        }
    }
}

/// One row of the listing spreadsheet or a JSON export, after header aliases have been
/// resolved and cell values coerced (see `source::row_from_fields`). Every field is optional,
/// since the sources only partially overlap; validation happens in `transform`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SourceRow {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    /// "lat,lng"
    pub gps: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Comma separated list
    pub services: Option<String>,
    /// Free form opening hours, kept as given
    pub hours: Option<serde_json::Value>,
    pub machine_count: Option<MachineCount>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MachineCount {
    pub washers: Option<i32>,
    pub dryers: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListingTier {
    #[default]
    Standard,
    Featured,
    Premium,
}

impl ListingTier {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 70 => Self::Premium,
            s if s >= 50 => Self::Featured,
            _ => Self::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Featured => "featured",
            Self::Premium => "premium",
        }
    }
}

impl Display for ListingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location lookup row key, resolved to ids inside the import transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateKey {
    pub name: String,
    pub abbr: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CityKey {
    pub name: String,
    pub slug: String,
}

/// A validated listing, ready to be inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewListing {
    pub name: String,
    pub slug: String,
    pub address: Option<String>,
    pub city: CityKey,
    pub state: StateKey,
    pub zip: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    /// Google Maps search link, shown when there is no website
    pub map_url: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rating: Option<f64>,
    pub review_count: i32,
    pub hours: Option<serde_json::Value>,
    pub services: Vec<String>,
    pub amenities: Vec<String>,
    pub machine_count: Option<MachineCount>,
    pub premium_score: i32,
    pub tier: ListingTier,
    pub seo_title: String,
    pub seo_description: String,
    pub seo_tags: Vec<String>,
}

/// What the enrich job found for one listing. Every part may be empty: the listing is still
/// marked enriched so it is not retried on the next run, but empty parts never replace data
/// stored earlier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    /// Set when the listing had no coordinates and geocoding found some
    pub geocoded: Option<LatLng>,
    pub place_id: Option<String>,
    pub details: Option<PlaceDetails>,
    pub nearby: Vec<NearbyPlace>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.place_id.is_none() && self.details.is_none() && self.nearby.is_empty()
    }
}

/// Static text rendered from the stored Places data, kept in `places_text_data`
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PlacesText {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_summary: Option<String>,
    pub review_snippets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearby_text: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// The subset of a `laundromats` row that the enrichment, text and image jobs work from.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
#[sqlx(default)]
pub struct ListingRow {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub address: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub google_place_id: Option<String>,
    pub google_details: Option<Json<PlaceDetails>>,
    pub nearby_places: Option<Json<Vec<NearbyPlace>>>,
}

impl ListingRow {
    pub fn coordinates(&self) -> Option<LatLng> {
        self.latitude
            .zip(self.longitude)
            .map(|(lat, lng)| LatLng { lat, lng })
    }

    pub fn opening_hours(&self) -> Option<&OpeningHours> {
        self.google_details
            .as_ref()
            .and_then(|d| d.opening_hours.as_ref())
    }

    /// "name, address, city, state zip", skipping whatever is missing
    pub fn search_text(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        if let Some(a) = self.address.as_deref() {
            parts.push(a);
        }
        parts.push(&self.city);
        let state_zip = match self.zip.as_deref() {
            Some(z) => format!("{} {}", self.state, z),
            None => self.state.clone(),
        };
        let mut out = parts.join(", ");
        out.push_str(", ");
        out.push_str(&state_zip);
        out
    }
}
