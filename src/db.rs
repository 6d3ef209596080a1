// Everything that touches more than one row runs in a transaction: an import batch writes the
// lookup rows, the listing, the counts and the checkpoint together, and the maintenance jobs
// recompute counts and delete duplicates atomically so readers never see a half-done pass.
// Batch writes go through `&mut **tx` on the batch transaction the runner hands us.

use crate::{
    batch::{Batch, Source},
    error::{Error, Result},
    models::{Checkpoint, Enrichment, ListingRow, NewListing, PlacesText},
    store::{EnrichmentStore, Inserted, ListingStore, Store},
};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions, types::Json};
use std::time::Instant;
use tracing::{debug, info, trace};

const SCHEMA: &str = include_str!("../schema.sql");

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    trace!(max_connections, "Connecting to database...");
    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?)
}

/// Apply schema.sql. Safe to run repeatedly.
pub async fn migrate(pg: &PgPool) -> Result<()> {
    let start = Instant::now();
    sqlx::raw_sql(SCHEMA)
        .execute(pg)
        .await
        .map_err(Error::Migrate)?;
    debug!("Schema applied in {:?}", start.elapsed());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pg: PgPool,
}

impl PgStore {
    pub fn new(pg: PgPool) -> Self {
        Self { pg }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pg
    }
}

impl Store for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn load_checkpoint(&self, job: &str) -> Result<Checkpoint> {
        let cp = sqlx::query_as::<_, Checkpoint>(
            r#"
                select job, position, total_processed, total_written, last_run_id, updated_at
                from sync_state where job = $1
            "#,
        )
        .bind(job)
        .fetch_optional(&self.pg)
        .await?;
        Ok(cp.unwrap_or_else(|| Checkpoint::new(job)))
    }

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pg.begin().await?)
    }

    async fn save_checkpoint(&self, tx: &mut Self::Tx, cp: &Checkpoint) -> Result<()> {
        save_checkpoint(&mut **tx, cp).await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        Ok(tx.commit().await?)
    }

    async fn begin_record(&self, tx: &mut Self::Tx) -> Result<()> {
        sqlx::query("savepoint batch_record")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn release_record(&self, tx: &mut Self::Tx) -> Result<()> {
        sqlx::query("release savepoint batch_record")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn rollback_record(&self, tx: &mut Self::Tx) -> Result<()> {
        sqlx::query("rollback to savepoint batch_record")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

async fn save_checkpoint<'e, E>(executor: E, cp: &Checkpoint) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
            insert into sync_state (job, position, total_processed, total_written, last_run_id, updated_at)
            values ($1, $2, $3, $4, $5, now())
            on conflict (job) do update set
                position = excluded.position,
                total_processed = excluded.total_processed,
                total_written = excluded.total_written,
                last_run_id = excluded.last_run_id,
                updated_at = excluded.updated_at
        "#,
    )
    .bind(&cp.job)
    .bind(cp.position)
    .bind(cp.total_processed)
    .bind(cp.total_written)
    .bind(cp.last_run_id)
    .execute(executor)
    .await?;
    Ok(())
}

impl ListingStore for PgStore {
    async fn insert_listing(&self, tx: &mut Self::Tx, l: &NewListing) -> Result<Inserted> {
        // "do update" instead of "do nothing", so that returning gives us the id either way
        let state_id: i32 = sqlx::query_scalar(
            r#"
                insert into states (name, abbr, slug) values ($1, $2, $3)
                on conflict (abbr) do update set name = excluded.name
                returning id
            "#,
        )
        .bind(&l.state.name)
        .bind(&l.state.abbr)
        .bind(&l.state.slug)
        .fetch_one(&mut **tx)
        .await?;

        let city_id: i32 = sqlx::query_scalar(
            r#"
                insert into cities (state_id, name, slug) values ($1, $2, $3)
                on conflict (slug) do update set name = cities.name
                returning id
            "#,
        )
        .bind(state_id)
        .bind(&l.city.name)
        .bind(&l.city.slug)
        .fetch_one(&mut **tx)
        .await?;

        let id: Option<i64> = sqlx::query_scalar(
            r#"
                insert into laundromats (
                    name, slug, address, city, state, zip, phone, website, map_url,
                    latitude, longitude, rating, review_count, hours, services, amenities,
                    machine_count, premium_score, listing_type, seo_title, seo_description,
                    seo_tags, city_id, state_id
                ) values (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24
                )
                on conflict (slug) do nothing
                returning id
            "#,
        )
        .bind(&l.name)
        .bind(&l.slug)
        .bind(&l.address)
        .bind(&l.city.name)
        .bind(&l.state.abbr)
        .bind(&l.zip)
        .bind(&l.phone)
        .bind(&l.website)
        .bind(&l.map_url)
        .bind(l.latitude)
        .bind(l.longitude)
        .bind(l.rating)
        .bind(l.review_count)
        .bind(&l.hours)
        .bind(Json(&l.services))
        .bind(Json(&l.amenities))
        .bind(l.machine_count.as_ref().map(Json))
        .bind(l.premium_score)
        .bind(l.tier.as_str())
        .bind(&l.seo_title)
        .bind(&l.seo_description)
        .bind(Json(&l.seo_tags))
        .bind(city_id)
        .bind(state_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(id) = id else {
            trace!(slug = %l.slug, "Listing exists");
            return Ok(Inserted::Duplicate);
        };

        sqlx::query("update states set laundry_count = laundry_count + 1 where id = $1")
            .bind(state_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("update cities set laundry_count = laundry_count + 1 where id = $1")
            .bind(city_id)
            .execute(&mut **tx)
            .await?;

        trace!(id, slug = %l.slug, "Listing inserted");
        Ok(Inserted::New(id))
    }
}

impl EnrichmentStore for PgStore {
    async fn save_enrichment(&self, tx: &mut Self::Tx, id: i64, e: &Enrichment) -> Result<()> {
        let details = e.details.as_ref();
        let hours = details.and_then(|d| d.opening_hours.as_ref());
        sqlx::query(
            r#"
                update laundromats set
                    latitude = coalesce(latitude, $2),
                    longitude = coalesce(longitude, $3),
                    google_place_id = coalesce($4, google_place_id),
                    google_details = coalesce($5, google_details),
                    business_hours = case when $5::jsonb is null then business_hours else $6 end,
                    nearby_places = coalesce(nullif($7::jsonb, '[]'::jsonb), nearby_places, $7),
                    phone = coalesce(phone, $8),
                    website = coalesce(website, $9),
                    enriched_at = now(),
                    updated_at = now()
                where id = $1
            "#,
        )
        .bind(id)
        .bind(e.geocoded.map(|p| p.lat))
        .bind(e.geocoded.map(|p| p.lng))
        .bind(&e.place_id)
        .bind(details.map(Json))
        .bind(hours.map(Json))
        .bind(Json(&e.nearby))
        .bind(details.and_then(|d| d.formatted_phone_number.as_deref()))
        .bind(details.and_then(|d| d.website.as_deref()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn save_text(&self, tx: &mut Self::Tx, id: i64, text: &PlacesText) -> Result<()> {
        sqlx::query(
            "update laundromats set places_text_data = $2, updated_at = now() where id = $1",
        )
        .bind(id)
        .bind(Json(text))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

/// Which listings a database source walks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingFilter {
    #[default]
    All,
    NotEnriched,
    Enriched,
    WithCoordinates,
}

impl ListingFilter {
    fn condition(&self) -> &'static str {
        match self {
            Self::All => "true",
            Self::NotEnriched => "enriched_at is null",
            Self::Enriched => "enriched_at is not null",
            Self::WithCoordinates => "latitude is not null and longitude is not null",
        }
    }
}

/// Keyset paginated listings: the position is the last id processed
#[derive(Debug, Clone)]
pub struct ListingSource {
    pg: PgPool,
    filter: ListingFilter,
}

impl ListingSource {
    pub fn new(pg: PgPool, filter: ListingFilter) -> Self {
        Self { pg, filter }
    }
}

impl Source for ListingSource {
    type Record = ListingRow;

    async fn next_batch(&mut self, position: i64, limit: usize) -> Result<Batch<ListingRow>> {
        let sql = format!(
            r#"
                select id, name, slug, address, city, state, zip, latitude, longitude,
                    google_place_id, google_details, nearby_places
                from laundromats
                where id > $1 and {}
                order by id
                limit $2
            "#,
            self.filter.condition()
        );
        let records = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(position)
            .bind(limit as i64)
            .fetch_all(&self.pg)
            .await?;
        Ok(Batch {
            positions: records.iter().map(|r| r.id).collect(),
            next_position: records.last().map(|r| r.id).unwrap_or(position),
            exhausted: records.len() < limit,
            records,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecountReport {
    pub states_changed: u64,
    pub cities_changed: u64,
}

async fn recount_in(tx: &mut Transaction<'static, Postgres>) -> Result<RecountReport> {
    let states = sqlx::query(
        r#"
            update states s set laundry_count = c.n
            from (
                select st.id, count(l.id)::int as n
                from states st left join laundromats l on l.state_id = st.id
                group by st.id
            ) c
            where s.id = c.id and s.laundry_count <> c.n
        "#,
    )
    .execute(&mut **tx)
    .await?;
    let cities = sqlx::query(
        r#"
            update cities ci set laundry_count = c.n
            from (
                select ct.id, count(l.id)::int as n
                from cities ct left join laundromats l on l.city_id = ct.id
                group by ct.id
            ) c
            where ci.id = c.id and ci.laundry_count <> c.n
        "#,
    )
    .execute(&mut **tx)
    .await?;
    Ok(RecountReport {
        states_changed: states.rows_affected(),
        cities_changed: cities.rows_affected(),
    })
}

/// Recompute the denormalized location counts from the listings
pub async fn recount(pg: &PgPool) -> Result<RecountReport> {
    let mut tx = pg.begin().await?;
    let report = recount_in(&mut tx).await?;
    tx.commit().await?;
    info!(
        states = report.states_changed,
        cities = report.cities_changed,
        "Location counts recomputed"
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub by_place_id: u64,
    pub by_address: u64,
    pub counts: RecountReport,
    pub dry_run: bool,
}

/// Delete listings that share a Google place id, or the same name, address and zip, keeping
/// the oldest of each group, then fix the counts. A dry run does the same work and rolls back.
pub async fn dedupe(pg: &PgPool, dry_run: bool) -> Result<DedupeReport> {
    let mut tx = pg.begin().await?;
    let by_place_id = sqlx::query(
        r#"
            delete from laundromats l using laundromats k
            where l.google_place_id is not null
                and l.google_place_id = k.google_place_id
                and l.id > k.id
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let by_address = sqlx::query(
        r#"
            delete from laundromats l using laundromats k
            where l.address is not null
                and lower(l.name) = lower(k.name)
                and lower(l.address) = lower(k.address)
                and l.zip is not distinct from k.zip
                and l.id > k.id
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let counts = recount_in(&mut tx).await?;

    if dry_run {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }
    let report = DedupeReport {
        by_place_id,
        by_address,
        counts,
        dry_run,
    };
    info!(by_place_id, by_address, dry_run, "Duplicates removed");
    Ok(report)
}

pub async fn list_checkpoints(pg: &PgPool) -> Result<Vec<Checkpoint>> {
    Ok(sqlx::query_as::<_, Checkpoint>(
        r#"
            select job, position, total_processed, total_written, last_run_id, updated_at
            from sync_state order by job
        "#,
    )
    .fetch_all(pg)
    .await?)
}

/// Overwrite a job's checkpoint, used to rewind it or to carry over an old cursor file
pub async fn put_checkpoint(pg: &PgPool, cp: &Checkpoint) -> Result<()> {
    save_checkpoint(pg, cp).await?;
    info!(job = %cp.job, position = cp.position, "Checkpoint set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::{OffsetSource, run_batch},
        jobs::import::ImportJob,
        models::SourceRow,
    };

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pg = connect(&url, 2).await.unwrap();
        migrate(&pg).await.unwrap();
        pg
    }

    fn row(name: &str) -> SourceRow {
        SourceRow {
            name: Some(name.into()),
            city: Some("Testville".into()),
            state: Some("VT".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn import_twice_inserts_nothing_new() {
        let pg = test_pool().await;
        let store = PgStore::new(pg.clone());
        let job = ImportJob::new(&format!("test-import-{}", uuid::Uuid::new_v4()));
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let rows = vec![row(&format!("A {suffix}")), row(&format!("B {suffix}"))];

        let mut src = OffsetSource::new(rows.clone());
        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!(2, r.written);

        let again_name = format!("test-import-{}", uuid::Uuid::new_v4());
        let again = ImportJob::new(&again_name);
        let mut src = OffsetSource::new(rows);
        let r = run_batch(&store, &mut src, &again, 10).await.unwrap();
        assert_eq!(0, r.written);
        assert_eq!(2, r.duplicates);

        let cp = store.load_checkpoint(&again_name).await.unwrap();
        assert_eq!(2, cp.position);
        assert_eq!(0, cp.total_written);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn empty_enrichment_keeps_stored_data() {
        let pg = test_pool().await;
        let store = PgStore::new(pg);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let l = crate::transform::to_listing(&row(&format!("Merge {suffix}"))).unwrap();

        // everything happens in one transaction that is dropped, so nothing is left behind
        let mut tx = store.begin().await.unwrap();
        let Inserted::New(id) = store.insert_listing(&mut tx, &l).await.unwrap() else {
            panic!("listing already exists");
        };
        let full = Enrichment {
            place_id: Some("suds-1".into()),
            details: Some(crate::places::PlaceDetails {
                name: "Good".into(),
                opening_hours: Some(Default::default()),
                ..Default::default()
            }),
            nearby: vec![crate::places::NearbyPlace {
                name: "Bean There".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.save_enrichment(&mut tx, id, &full).await.unwrap();
        store
            .save_enrichment(&mut tx, id, &Enrichment::default())
            .await
            .unwrap();

        let (place_id, name, has_hours, nearby): (Option<String>, Option<String>, bool, i32) =
            sqlx::query_as(
                r#"
                    select google_place_id, google_details->>'name', business_hours is not null,
                        jsonb_array_length(nearby_places)
                    from laundromats where id = $1
                "#,
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(Some("suds-1".into()), place_id);
        assert_eq!(Some("Good".into()), name);
        assert!(has_hours);
        assert_eq!(1, nearby);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn keyset_source_walks_by_id() {
        let pg = test_pool().await;
        let mut src = ListingSource::new(pg, ListingFilter::All);
        let first = src.next_batch(0, 2).await.unwrap();
        if let Some(last) = first.records.last() {
            assert_eq!(last.id, first.next_position);
            let next = src.next_batch(first.next_position, 2).await.unwrap();
            assert!(next.records.iter().all(|r| r.id > last.id));
        } else {
            assert!(first.exhausted);
        }
    }
}
