// Source row -> listing. Everything here is pure, so it runs in the prepare phase of the
// import job, outside the database transaction.

use crate::{
    models::{CityKey, ListingTier, NewListing, SourceRow, StateKey},
    states,
    util::{non_empty, parse_lat_lng, valid_lat_lng},
};
use slugify::slugify;
use std::fmt::Display;

const MAX_SCORE: i32 = 100;
const FEATURE_POINTS: i32 = 5;
const MAX_REVIEW_POINTS: i64 = 30;

/// Why a row could not become a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    MissingName,
    MissingCity,
    MissingState,
    UnknownState(String),
}

impl Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::MissingName => write!(f, "missing name"),
            Self::MissingCity => write!(f, "missing city"),
            Self::MissingState => write!(f, "missing state"),
            Self::UnknownState(s) => write!(f, "unknown state {s:?}"),
        }
    }
}

/// Feature flags that add to the premium score, matched against services by keyword
const FEATURES: &[(&str, &[&str])] = &[
    ("Open 24 Hours", &["24 hour", "24/7", "24hr", "open 24"]),
    ("Free WiFi", &["wifi", "wi-fi", "internet"]),
    ("Attendant On Duty", &["attendant", "staffed"]),
    ("Card Payment", &["credit card", "card payment", "cards accepted", "debit"]),
    ("Wash & Fold", &["wash and fold", "wash & fold", "drop-off", "drop off", "fluff"]),
    ("Free Drying", &["free dry", "free drying"]),
    ("Parking", &["parking"]),
];

pub fn listing_slug(name: &str, city: &str, state_abbr: &str) -> String {
    slugify!(&format!("{name} {city} {state_abbr}"))
}

pub fn city_slug(city: &str, state_abbr: &str) -> String {
    format!("{}-{}", slugify!(city), state_abbr.to_lowercase())
}

/// Split a comma separated services cell, dropping blanks and case insensitive duplicates
pub fn parse_services(s: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in s.split([',', ';', '|']) {
        let Some(v) = non_empty(Some(part)) else {
            continue;
        };
        if !out.iter().any(|o| o.eq_ignore_ascii_case(&v)) {
            out.push(v);
        }
    }
    out
}

/// Feature flags present in the services, in the order of `FEATURES`
pub fn amenities(services: &[String]) -> Vec<String> {
    let lower: Vec<String> = services.iter().map(|s| s.to_lowercase()).collect();
    FEATURES
        .iter()
        .filter(|(_, keywords)| {
            lower
                .iter()
                .any(|s| keywords.iter().any(|k| s.contains(k)))
        })
        .map(|(name, _)| name.to_string())
        .collect()
}

pub fn premium_score(rating: Option<f64>, review_count: i64, amenities: &[String]) -> i32 {
    let rating_points = rating
        .filter(|r| r.is_finite())
        .map(|r| (r.clamp(0.0, 5.0) * 10.0).round() as i32)
        .unwrap_or(0);
    let review_points = (review_count.max(0) / 10).min(MAX_REVIEW_POINTS) as i32;
    let feature_points = FEATURE_POINTS * amenities.len() as i32;
    (rating_points + review_points + feature_points).min(MAX_SCORE)
}

pub fn seo_title(name: &str, city: &str, state_abbr: &str) -> String {
    format!("{name} - Laundromat in {city}, {state_abbr}")
}

pub fn seo_description(l: &NewListing) -> String {
    let mut out = match l.address.as_deref() {
        Some(a) => format!(
            "{} is a laundromat at {}, {}, {}",
            l.name, a, l.city.name, l.state.abbr
        ),
        None => format!(
            "{} is a laundromat in {}, {}",
            l.name, l.city.name, l.state.abbr
        ),
    };
    if let Some(z) = l.zip.as_deref() {
        out.push(' ');
        out.push_str(z);
    }
    out.push('.');
    if let Some(r) = l.rating {
        out.push_str(&format!(
            " Rated {:.1}/5 from {} reviews.",
            r, l.review_count
        ));
    }
    if !l.services.is_empty() {
        let top: Vec<&str> = l.services.iter().take(3).map(String::as_str).collect();
        out.push_str(&format!(" Services: {}.", top.join(", ")));
    }
    out
}

pub fn seo_tags(city: &str, state_abbr: &str, services: &[String]) -> Vec<String> {
    let mut tags = vec![
        "laundromat".to_string(),
        "laundromat near me".to_string(),
        format!("{} laundromat", city.to_lowercase()),
        format!("{state_abbr} laundromats"),
    ];
    for s in services {
        let s = s.to_lowercase();
        if !tags.contains(&s) {
            tags.push(s);
        }
    }
    tags
}

/// Link to a Google Maps search for the listing, used when it has no website of its own
pub fn map_search_url(name: &str, address: Option<&str>, city: &str, state_abbr: &str) -> String {
    let query = match address {
        Some(a) => format!("{name} {a} {city} {state_abbr}"),
        None => format!("{name} {city} {state_abbr}"),
    };
    format!(
        "https://www.google.com/maps/search/?api=1&query={}",
        urlencoding::encode(&query)
    )
}

pub fn to_listing(row: &SourceRow) -> Result<NewListing, Invalid> {
    let name = non_empty(row.name.as_deref()).ok_or(Invalid::MissingName)?;
    let city = non_empty(row.city.as_deref()).ok_or(Invalid::MissingCity)?;
    let state_raw = non_empty(row.state.as_deref()).ok_or(Invalid::MissingState)?;
    let state = states::lookup(&state_raw).ok_or(Invalid::UnknownState(state_raw))?;
    let abbr = state.abbr.as_str();

    let explicit = match (row.latitude, row.longitude) {
        (Some(lat), Some(lng)) => valid_lat_lng(lat, lng),
        _ => None,
    };
    let (latitude, longitude) = match explicit {
        Some((lat, lng)) => (Some(lat), Some(lng)),
        None => match row.gps.as_deref().and_then(parse_lat_lng) {
            Some((lat, lng)) => (Some(lat), Some(lng)),
            None => (None, None),
        },
    };

    let services = row
        .services
        .as_deref()
        .map(parse_services)
        .unwrap_or_default();
    let amenities = amenities(&services);
    let review_count = row.review_count.unwrap_or(0).max(0);
    let rating = row.rating.filter(|r| (0.0..=5.0).contains(r));
    let premium_score = premium_score(rating, review_count, &amenities);
    let address = non_empty(row.address.as_deref());

    let mut l = NewListing {
        map_url: map_search_url(&name, address.as_deref(), &city, abbr),
        slug: listing_slug(&name, &city, abbr),
        seo_title: seo_title(&name, &city, abbr),
        seo_tags: seo_tags(&city, abbr, &services),
        city: CityKey {
            slug: city_slug(&city, abbr),
            name: city,
        },
        state: StateKey {
            name: state.name.to_string(),
            abbr: abbr.to_string(),
            slug: slugify!(state.name.as_str()),
        },
        name,
        address,
        zip: non_empty(row.zip.as_deref()),
        phone: non_empty(row.phone.as_deref()),
        website: non_empty(row.website.as_deref()),
        latitude,
        longitude,
        rating,
        review_count: review_count.min(i32::MAX as i64) as i32,
        hours: row.hours.clone().filter(|h| !h.is_null()),
        services,
        amenities,
        machine_count: row.machine_count.clone(),
        premium_score,
        tier: ListingTier::from_score(premium_score),
        ..Default::default()
    };
    l.seo_description = seo_description(&l);
    Ok(l)
}
