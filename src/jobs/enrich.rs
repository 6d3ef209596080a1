use crate::{
    batch::{Job, Outcome, Prepared},
    db::ListingFilter,
    error::Result,
    models::{Enrichment, ListingRow},
    places::PlacesClient,
    store::EnrichmentStore,
};
use tracing::{debug, info};

pub const NAME: &str = "enrich";
/// Forced runs walk every listing, so they keep their own cursor
pub const FORCE_NAME: &str = "enrich-force";

/// Looks each listing up in Google Places and stores the place id, details, opening hours and
/// nearby places. Every API call happens in `prepare`, so the transaction only holds the
/// updates. A listing with no match is still marked enriched, and lookups that come back empty
/// never replace data stored by an earlier run.
#[derive(Clone)]
pub struct EnrichJob {
    places: PlacesClient,
    force: bool,
}

impl EnrichJob {
    pub fn new(places: PlacesClient) -> Self {
        Self {
            places,
            force: false,
        }
    }

    /// Also revisit listings that were enriched before
    pub fn forced(self) -> Self {
        Self {
            force: true,
            ..self
        }
    }

    pub fn listing_filter(&self) -> ListingFilter {
        if self.force {
            ListingFilter::All
        } else {
            ListingFilter::NotEnriched
        }
    }

    /// Transient API failures are returned, so the listing is retried by a later run
    pub async fn enrich(&self, l: &ListingRow) -> Result<Enrichment> {
        let search_text = l.search_text();
        let mut e = Enrichment::default();

        let location = match l.coordinates() {
            Some(loc) => Some(loc),
            None => {
                e.geocoded = self.places.geocode(&search_text).await?;
                e.geocoded
            }
        };

        e.place_id = match l.google_place_id.clone() {
            Some(id) => Some(id),
            None => self
                .places
                .resolve_place(&l.name, location, &search_text)
                .await?
                .map(|p| p.place_id)
                .filter(|id| !id.is_empty()),
        };

        if let Some(id) = e.place_id.as_deref() {
            e.details = self.places.details(id).await?;
        }

        let around = location.or_else(|| {
            e.details
                .as_ref()
                .and_then(|d| d.geometry.as_ref())
                .map(|g| g.location)
        });
        if let Some(loc) = around {
            e.nearby = self.places.nearby_places(loc).await?;
        }
        Ok(e)
    }
}

impl<S: EnrichmentStore> Job<S> for EnrichJob {
    type Record = ListingRow;
    type Ready = (i64, Enrichment);

    fn name(&self) -> &str {
        if self.force { FORCE_NAME } else { NAME }
    }

    async fn prepare(&self, record: ListingRow) -> Result<Prepared<Self::Ready>> {
        let e = self.enrich(&record).await?;
        if e.is_empty() {
            info!(id = record.id, name = %record.name, "No Places data found");
        } else {
            debug!(
                id = record.id,
                place_id = e.place_id.as_deref().unwrap_or_default(),
                nearby = e.nearby.len(),
                "Enriched listing"
            );
        }
        Ok(Prepared::Ready((record.id, e)))
    }

    async fn write(&self, store: &S, tx: &mut S::Tx, ready: &Self::Ready) -> Result<Outcome> {
        let (id, e) = ready;
        store.save_enrichment(tx, *id, e).await?;
        Ok(Outcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::{OffsetSource, run_batch},
        cache::tests::{StubServer, caching_client, offline_client},
        places::{LatLng, PlaceDetails},
        store::{Store, memory::MemoryStore},
    };

    fn listing(id: i64) -> ListingRow {
        ListingRow {
            id,
            name: format!("Listing {id}"),
            city: "Austin".into(),
            state: "TX".into(),
            latitude: Some(30.0),
            longitude: Some(-97.0),
            ..Default::default()
        }
    }

    fn json(body: &str) -> (u16, &'static str, Vec<u8>) {
        (200, "application/json", body.as_bytes().to_vec())
    }

    const DETAILS: &str = r#"{"status":"OK","result":{
        "place_id":"suds-1","name":"Suds","formatted_phone_number":"(512) 555-0100",
        "rating":4.6,"user_ratings_total":31,
        "opening_hours":{"periods":[{"open":{"day":1,"time":"0700"},"close":{"day":1,"time":"2200"}}]},
        "geometry":{"location":{"lat":30.0,"lng":-97.0}}
    }}"#;

    /// Answers like Places does for one laundromat with a cafe next door
    async fn places_stub() -> StubServer {
        StubServer::start(|t| {
            if t.starts_with("/place/details/json") {
                json(DETAILS)
            } else if t.contains("type=laundry") {
                json(r#"{"status":"OK","results":[{"place_id":"suds-1","name":"Suds"}]}"#)
            } else if t.contains("type=cafe") {
                json(
                    r#"{"status":"OK","results":[
                        {"name":"Bean There","geometry":{"location":{"lat":30.0,"lng":-97.0}}}
                    ]}"#,
                )
            } else if t.starts_with("/geocode/json") {
                json(r#"{"status":"OK","results":[{"geometry":{"location":{"lat":30.5,"lng":-97.5}}}]}"#)
            } else {
                json(r#"{"status":"ZERO_RESULTS"}"#)
            }
        })
        .await
    }

    #[tokio::test]
    async fn stores_details_hours_and_nearby() {
        let stub = places_stub().await;
        let places = PlacesClient::new(caching_client().await, "k").with_base_url(&stub.base_url);
        let job = EnrichJob::new(places);
        let store = MemoryStore::default();
        let mut src = OffsetSource::new(vec![listing(7)]);

        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!(1, r.written);
        let s = store.snapshot();
        let e = &s.enrichments[&7];
        assert_eq!(Some("suds-1"), e.place_id.as_deref());
        assert_eq!(None, e.geocoded);
        let d = e.details.as_ref().unwrap();
        assert_eq!(Some("(512) 555-0100"), d.formatted_phone_number.as_deref());
        assert_eq!(1, d.opening_hours.as_ref().unwrap().periods.len());
        assert_eq!(vec!["Bean There"], e.nearby.iter().map(|n| n.name.as_str()).collect::<Vec<_>>());
        assert_eq!(1, stub.count("/place/details/json"));
    }

    #[tokio::test]
    async fn geocodes_listings_without_coordinates() {
        let stub = places_stub().await;
        let places = PlacesClient::new(caching_client().await, "k").with_base_url(&stub.base_url);
        let job = EnrichJob::new(places);
        let mut l = listing(3);
        l.latitude = None;
        l.longitude = None;

        let e = job.enrich(&l).await.unwrap();
        assert_eq!(Some(LatLng { lat: 30.5, lng: -97.5 }), e.geocoded);
        assert_eq!(Some("suds-1"), e.place_id.as_deref());
        let t = stub.targets();
        assert!(t.iter().any(|t| t.contains("location=30.5%2C-97.5")));
    }

    #[tokio::test]
    async fn unreachable_api_defers_the_batch() {
        let places =
            PlacesClient::new(offline_client().await, "k").with_base_url("http://127.0.0.1:9");
        let job = EnrichJob::new(places);
        let store = MemoryStore::default();
        let mut src = OffsetSource::new(vec![listing(7), listing(9)]);

        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!((0, 0, 2), (r.written, r.errors, r.deferred));
        assert_eq!(0, r.position_after);
        assert!(store.snapshot().enrichments.is_empty());
    }

    #[tokio::test]
    async fn known_place_id_is_kept() {
        let stub = places_stub().await;
        let places = PlacesClient::new(caching_client().await, "k").with_base_url(&stub.base_url);
        let job = EnrichJob::new(places);
        let mut l = listing(1);
        l.google_place_id = Some("ChIJ-known".into());

        let e = job.enrich(&l).await.unwrap();
        assert_eq!(Some("ChIJ-known"), e.place_id.as_deref());
        assert!(!stub.targets().iter().any(|t| t.contains("type=laundry")));
        assert!(stub.targets().iter().any(|t| t.contains("place_id=ChIJ-known")));
    }

    #[tokio::test]
    async fn forced_run_has_its_own_cursor() {
        let stub = places_stub().await;
        let places = PlacesClient::new(caching_client().await, "k").with_base_url(&stub.base_url);
        let store = MemoryStore::default();

        let normal = EnrichJob::new(places.clone());
        assert_eq!(ListingFilter::NotEnriched, normal.listing_filter());
        let mut src = OffsetSource::new(vec![listing(1), listing(2)]);
        let r = run_batch(&store, &mut src, &normal, 10).await.unwrap();
        assert_eq!(2, r.position_after);

        let forced = EnrichJob::new(places).forced();
        assert_eq!(ListingFilter::All, forced.listing_filter());
        let r = run_batch(&store, &mut src, &forced, 10).await.unwrap();
        assert_eq!((0, 2, 2), (r.position_before, r.processed, r.written));
        assert_eq!(2, store.load_checkpoint(NAME).await.unwrap().position);
        assert_eq!(2, store.load_checkpoint(FORCE_NAME).await.unwrap().position);
    }

    #[tokio::test]
    async fn empty_lookup_keeps_stored_data() {
        let stub = StubServer::start(|_| json(r#"{"status":"NOT_FOUND"}"#)).await;
        let places = PlacesClient::new(caching_client().await, "k").with_base_url(&stub.base_url);
        let job = EnrichJob::new(places).forced();
        let store = MemoryStore::default();
        let paid_for = Enrichment {
            place_id: Some("suds-1".into()),
            details: Some(PlaceDetails {
                name: "Good".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        store.state.lock().unwrap().enrichments.insert(1, paid_for.clone());

        let mut l = listing(1);
        l.google_place_id = Some("suds-1".into());
        let mut src = OffsetSource::new(vec![l]);
        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!(1, r.written);
        assert_eq!(paid_for, store.snapshot().enrichments[&1]);
    }
}
