// Renders the stored Places payloads into plain text once, so listing pages can be served
// without calling the API again.

use crate::{
    batch::{Job, Outcome, Prepared},
    error::Result,
    hours::hours_to_text,
    models::{ListingRow, PlacesText},
    places::{NearbyPlace, PlaceDetails},
    store::EnrichmentStore,
    util::reduce_whitespace,
};
use chrono::Utc;

pub const NAME: &str = "textify";

const MAX_SNIPPETS: usize = 3;
const SNIPPET_CHARS: usize = 200;

pub fn rating_summary(d: &PlaceDetails) -> Option<String> {
    let rating = d.rating?;
    Some(match d.user_ratings_total {
        Some(1) => format!("Rated {rating:.1} out of 5 from 1 review"),
        Some(n) if n > 0 => format!("Rated {rating:.1} out of 5 from {n} reviews"),
        _ => format!("Rated {rating:.1} out of 5"),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    // back up to the last full word
    match cut.rfind(' ') {
        Some(i) if i > 0 => format!("{}…", cut[..i].trim_end()),
        _ => format!("{cut}…"),
    }
}

/// Up to three non-empty reviews, best rated first, shortened to whole words
pub fn review_snippets(d: &PlaceDetails) -> Vec<String> {
    let mut reviews: Vec<_> = d
        .reviews
        .iter()
        .filter(|r| !r.text.trim().is_empty())
        .collect();
    reviews.sort_by(|a, b| b.rating.total_cmp(&a.rating));
    reviews
        .into_iter()
        .take(MAX_SNIPPETS)
        .map(|r| {
            let text = truncate(&reduce_whitespace(&r.text), SNIPPET_CHARS);
            format!("\"{}\" - {}", text, r.author_name)
        })
        .collect()
}

pub fn nearby_text(places: &[NearbyPlace]) -> Option<String> {
    if places.is_empty() {
        return None;
    }
    let parts: Vec<String> = places
        .iter()
        .map(|p| format!("{} ({} m)", p.name, p.distance_m))
        .collect();
    Some(format!("Nearby: {}", parts.join(", ")))
}

pub fn places_text(l: &ListingRow) -> PlacesText {
    let details = l.google_details.as_ref().map(|j| &j.0);
    PlacesText {
        hours_text: l.opening_hours().map(hours_to_text),
        rating_summary: details.and_then(rating_summary),
        review_snippets: details.map(review_snippets).unwrap_or_default(),
        nearby_text: l.nearby_places.as_ref().and_then(|n| nearby_text(&n.0)),
        generated_at: Some(Utc::now()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextifyJob;

impl<S: EnrichmentStore> Job<S> for TextifyJob {
    type Record = ListingRow;
    type Ready = (i64, PlacesText);

    fn name(&self) -> &str {
        NAME
    }

    async fn prepare(&self, record: ListingRow) -> Result<Prepared<Self::Ready>> {
        if record.google_details.is_none() && record.nearby_places.is_none() {
            return Ok(Prepared::Invalid("no places data".into()));
        }
        Ok(Prepared::Ready((record.id, places_text(&record))))
    }

    async fn write(&self, store: &S, tx: &mut S::Tx, ready: &Self::Ready) -> Result<Outcome> {
        store.save_text(tx, ready.0, &ready.1).await?;
        Ok(Outcome::Written)
    }
}
