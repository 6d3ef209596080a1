use crate::{
    batch::{Job, Outcome, Prepared},
    error::Result,
    models::{NewListing, SourceRow},
    store::{Inserted, ListingStore},
    transform::to_listing,
};

pub const DEFAULT_NAME: &str = "import";

/// Spreadsheet or JSON rows into `laundromats`, with the state and city rows they need
#[derive(Debug, Clone)]
pub struct ImportJob {
    name: String,
}

impl ImportJob {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ImportJob {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

impl<S: ListingStore> Job<S> for ImportJob {
    type Record = SourceRow;
    type Ready = NewListing;

    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, record: SourceRow) -> Result<Prepared<NewListing>> {
        Ok(match to_listing(&record) {
            Ok(l) => Prepared::Ready(l),
            Err(reason) => Prepared::Invalid(reason.to_string()),
        })
    }

    async fn write(&self, store: &S, tx: &mut S::Tx, ready: &NewListing) -> Result<Outcome> {
        Ok(match store.insert_listing(tx, ready).await? {
            Inserted::New(_) => Outcome::Written,
            Inserted::Duplicate => Outcome::Duplicate,
        })
    }
}
