// The seam between the batch runner and the database. A batch's data writes and its checkpoint
// go through the same transaction handle, so they commit or vanish together. Each record is
// written inside its own savepoint, which lets one bad record fail without poisoning the rest
// of the transaction.

use crate::{
    error::Result,
    models::{Checkpoint, Enrichment, NewListing, PlacesText},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New(i64),
    /// A listing with the same slug already exists, nothing was written
    Duplicate,
}

#[allow(async_fn_in_trait)]
pub trait Store {
    type Tx;

    /// The saved checkpoint for a job, or a fresh one at position 0
    async fn load_checkpoint(&self, job: &str) -> Result<Checkpoint>;
    async fn begin(&self) -> Result<Self::Tx>;
    async fn save_checkpoint(&self, tx: &mut Self::Tx, cp: &Checkpoint) -> Result<()>;
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn begin_record(&self, tx: &mut Self::Tx) -> Result<()>;
    async fn release_record(&self, tx: &mut Self::Tx) -> Result<()>;
    async fn rollback_record(&self, tx: &mut Self::Tx) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait ListingStore: Store {
    /// Upsert the state and city rows, insert the listing unless its slug exists, and bump the
    /// location counts only when a row was actually inserted.
    async fn insert_listing(&self, tx: &mut Self::Tx, l: &NewListing) -> Result<Inserted>;
}

#[allow(async_fn_in_trait)]
pub trait EnrichmentStore: Store {
    async fn save_enrichment(&self, tx: &mut Self::Tx, id: i64, e: &Enrichment) -> Result<()>;
    async fn save_text(&self, tx: &mut Self::Tx, id: i64, text: &PlacesText) -> Result<()>;
}
