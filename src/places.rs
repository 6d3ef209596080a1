//! Google Places / Maps web service client.
//!
//! Every payload is parsed once into the structs below, with unknown fields ignored and
//! missing ones defaulted, and that is also the shape we store in the JSONB columns. "Nothing
//! found" is a normal outcome, and so is a failure that retrying will not fix (denied key, bad
//! request): those are logged and come back as `None` or an empty `Vec`. Transient failures
//! (quota, server errors, timeouts) are returned as errors so the caller can retry later.
//!
//! Google reports most failures as HTTP 200 with an error `status` in the body, which the
//! response cache would happily keep. Such responses are evicted again before returning.

use crate::{
    cache::Client,
    error::{Error, Result},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::{DefaultOnNull, NoneAsEmptyString, serde_as};
use tracing::{debug, trace, warn};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api";

const DETAILS_FIELDS: &str = "place_id,name,formatted_address,formatted_phone_number,website,\
rating,user_ratings_total,opening_hours,reviews,photos,types,business_status,url,geometry";
const NEARBY_TYPES: &[&str] = &["restaurant", "cafe", "supermarket", "convenience_store"];
const NEARBY_RADIUS: u32 = 500;
const NEARBY_LIMIT: usize = 5;
const MAX_RADIUS_ATTEMPTS: usize = 3;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(default)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Geometry {
    pub location: LatLng,
}

/// Day is 0 for Sunday through 6 for Saturday, time is "HHMM"
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DayTime {
    pub day: u8,
    pub time: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Period {
    pub open: DayTime,
    /// Missing for places that never close
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<DayTime>,
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct OpeningHours {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_now: Option<bool>,
    #[serde_as(as = "DefaultOnNull")]
    pub periods: Vec<Period>,
    #[serde_as(as = "DefaultOnNull")]
    pub weekday_text: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Review {
    pub author_name: String,
    pub rating: f64,
    pub text: String,
    pub time: i64,
    pub relative_time_description: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Photo {
    pub photo_reference: String,
    pub width: u32,
    pub height: u32,
    pub html_attributions: Vec<String>,
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PlaceDetails {
    pub place_id: String,
    pub name: String,
    #[serde_as(as = "NoneAsEmptyString")]
    pub formatted_address: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub formatted_phone_number: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<i64>,
    pub opening_hours: Option<OpeningHours>,
    #[serde_as(as = "DefaultOnNull")]
    pub reviews: Vec<Review>,
    #[serde_as(as = "DefaultOnNull")]
    pub photos: Vec<Photo>,
    #[serde_as(as = "DefaultOnNull")]
    pub types: Vec<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub business_status: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub url: Option<String>,
    pub geometry: Option<Geometry>,
}

/// A search hit from nearby search or find place
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PlaceSummary {
    pub place_id: String,
    pub name: String,
    #[serde_as(as = "NoneAsEmptyString")]
    pub vicinity: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    pub formatted_address: Option<String>,
    pub geometry: Geometry,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<i64>,
    #[serde_as(as = "DefaultOnNull")]
    pub types: Vec<String>,
}

/// Point of interest around a listing, as stored in `nearby_places`
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NearbyPlace {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vicinity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    /// Straight line distance from the listing
    pub distance_m: u32,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default = "Vec::new")]
    candidates: Vec<T>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DetailsResponse {
    status: String,
    error_message: Option<String>,
    result: Option<PlaceDetails>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct StreetViewMetadata {
    status: String,
}

fn check_status(status: &str, message: Option<&str>) -> Result<()> {
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        _ => Err(Error::Api {
            status: status.into(),
            message: message.unwrap_or_default().into(),
        }),
    }
}

/// Responses carrying a status in the body
trait ApiStatus {
    fn check(&self) -> Result<()>;
}

impl<T> ApiStatus for ListResponse<T> {
    fn check(&self) -> Result<()> {
        check_status(&self.status, self.error_message.as_deref())
    }
}

impl ApiStatus for DetailsResponse {
    fn check(&self) -> Result<()> {
        check_status(&self.status, self.error_message.as_deref())
    }
}

impl ApiStatus for StreetViewMetadata {
    fn check(&self) -> Result<()> {
        match self.status.as_str() {
            "NOT_FOUND" => Ok(()),
            s => check_status(s, None),
        }
    }
}

/// Log failures that retrying will not fix and carry on with nothing
fn soften<T: Default>(res: Result<T>, what: &str, subject: &str) -> Result<T> {
    match res {
        Err(err) if !err.is_transient() => {
            warn!(%err, subject, "{} failed", what);
            Ok(T::default())
        }
        res => res,
    }
}

/// Radii to try for a nearby search: start, doubling, capped at max, at most three attempts.
pub fn radius_steps(start: u32, max: u32) -> Vec<u32> {
    let start = start.max(1).min(max.max(1));
    let mut steps = vec![start];
    let mut r = start;
    while steps.len() < MAX_RADIUS_ATTEMPTS && r < max {
        r = r.saturating_mul(2).min(max);
        steps.push(r);
    }
    steps
}

/// Haversine distance in metres
pub fn distance_m(a: LatLng, b: LatLng) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Clone)]
pub struct PlacesClient {
    client: Client,
    base_url: String,
    api_key: String,
    search_radius: u32,
    max_search_radius: u32,
}

impl PlacesClient {
    pub fn new(client: Client, api_key: &str) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            search_radius: 100,
            max_search_radius: 1000,
        }
    }

    pub fn with_base_url(self, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').into(),
            ..self
        }
    }

    pub fn with_search_radius(self, start: u32, max: u32) -> Self {
        Self {
            search_radius: start,
            max_search_radius: max,
            ..self
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, path))?;
        url.query_pairs_mut()
            .extend_pairs(params)
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    async fn get<T: DeserializeOwned + ApiStatus>(&self, url: Url) -> Result<T> {
        let res: T = self.client.get_json(url.as_str()).await?;
        if let Err(err) = res.check() {
            self.client.forget(url.as_str()).await;
            return Err(err);
        }
        Ok(res)
    }

    async fn list<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let res: ListResponse<T> = self.get(url).await?;
        if res.results.is_empty() {
            Ok(res.candidates)
        } else {
            Ok(res.results)
        }
    }

    async fn nearby_raw(
        &self,
        location: LatLng,
        radius: u32,
        kind: &str,
        keyword: Option<&str>,
    ) -> Result<Vec<PlaceSummary>> {
        let loc = format!("{},{}", location.lat, location.lng);
        let radius = radius.to_string();
        let mut params = vec![
            ("location", loc.as_str()),
            ("radius", radius.as_str()),
            ("type", kind),
        ];
        if let Some(k) = keyword {
            params.push(("keyword", k));
        }
        self.list(self.url("place/nearbysearch/json", &params)?)
            .await
    }

    async fn find_place_raw(&self, input: &str) -> Result<Option<PlaceSummary>> {
        let url = self.url(
            "place/findplacefromtext/json",
            &[
                ("input", input),
                ("inputtype", "textquery"),
                ("fields", "place_id,name,formatted_address,geometry,types"),
            ],
        )?;
        Ok(self.list(url).await?.into_iter().next())
    }

    async fn details_raw(&self, place_id: &str) -> Result<Option<PlaceDetails>> {
        let url = self.url(
            "place/details/json",
            &[("place_id", place_id), ("fields", DETAILS_FIELDS)],
        )?;
        let res: DetailsResponse = self.get(url).await?;
        Ok(res.result)
    }

    async fn geocode_raw(&self, address: &str) -> Result<Option<LatLng>> {
        let url = self.url("geocode/json", &[("address", address)])?;
        let results: Vec<GeocodeResult> = self.list(url).await?;
        Ok(results.into_iter().next().map(|r| r.geometry.location))
    }

    pub async fn geocode(&self, address: &str) -> Result<Option<LatLng>> {
        soften(self.geocode_raw(address).await, "Geocoding", address)
    }

    /// Find the place id for a listing: nearby search around its coordinates with a widening
    /// radius, then a text search as the last resort.
    pub async fn resolve_place(
        &self,
        name: &str,
        location: Option<LatLng>,
        search_text: &str,
    ) -> Result<Option<PlaceSummary>> {
        if let Some(loc) = location {
            for radius in radius_steps(self.search_radius, self.max_search_radius) {
                trace!(name, radius, "Nearby search...");
                match self.nearby_raw(loc, radius, "laundry", Some(name)).await {
                    Ok(hits) => {
                        if let Some(hit) = hits.into_iter().next() {
                            debug!(name, radius, place_id = %hit.place_id, "Found place");
                            return Ok(Some(hit));
                        }
                    }
                    Err(err) if err.is_transient() => return Err(err),
                    Err(err) => {
                        warn!(%err, name, radius, "Nearby search failed");
                        break;
                    }
                }
            }
        }
        soften(
            self.find_place_raw(search_text).await,
            "Find place",
            search_text,
        )
    }

    pub async fn details(&self, place_id: &str) -> Result<Option<PlaceDetails>> {
        soften(self.details_raw(place_id).await, "Place details", place_id)
    }

    /// Points of interest around a location, nearest first. Searches failing for good are
    /// skipped.
    pub async fn nearby_places(&self, location: LatLng) -> Result<Vec<NearbyPlace>> {
        let mut out: Vec<NearbyPlace> = Vec::new();
        for kind in NEARBY_TYPES {
            match self.nearby_raw(location, NEARBY_RADIUS, kind, None).await {
                Ok(hits) => {
                    for hit in hits {
                        if out.iter().any(|p| p.name == hit.name) {
                            continue;
                        }
                        out.push(NearbyPlace {
                            distance_m: distance_m(location, hit.geometry.location).round() as u32,
                            name: hit.name,
                            kind: kind.to_string(),
                            vicinity: hit.vicinity,
                            rating: hit.rating,
                        });
                    }
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => warn!(%err, kind, "Nearby places search failed"),
            }
        }
        out.sort_by_key(|p| p.distance_m);
        out.truncate(NEARBY_LIMIT);
        Ok(out)
    }

    /// Whether street view imagery exists at a location, false on any failure. The metadata
    /// endpoint is free, the image endpoint is not.
    pub async fn has_street_view(&self, location: LatLng) -> bool {
        let loc = format!("{},{}", location.lat, location.lng);
        let url = match self.url("streetview/metadata", &[("location", loc.as_str())]) {
            Ok(u) => u,
            Err(err) => {
                warn!(%err, "Invalid street view url");
                return false;
            }
        };
        match self.get::<StreetViewMetadata>(url).await {
            Ok(m) => m.status == "OK",
            Err(err) => {
                warn!(%err, "Street view metadata failed");
                false
            }
        }
    }
}
