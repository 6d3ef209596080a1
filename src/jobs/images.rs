use crate::{
    assets::{AssetCache, Fetched, ImageRequest},
    batch::{Job, Outcome, Prepared},
    error::Result,
    models::ListingRow,
    store::Store,
};
use tracing::debug;

pub const NAME: &str = "images";

/// Warms the image cache for each listing. Only the checkpoint is written to the database;
/// the images themselves live on disk.
#[derive(Clone)]
pub struct ImagesJob {
    assets: AssetCache,
    requests: Vec<ImageRequest>,
}

impl ImagesJob {
    pub fn new(assets: AssetCache, requests: Vec<ImageRequest>) -> Self {
        Self { assets, requests }
    }
}

impl<S: Store> Job<S> for ImagesJob {
    type Record = ListingRow;
    type Ready = Vec<Fetched>;

    fn name(&self) -> &str {
        NAME
    }

    async fn prepare(&self, record: ListingRow) -> Result<Prepared<Vec<Fetched>>> {
        let Some(loc) = record.coordinates() else {
            return Ok(Prepared::Invalid("no coordinates".into()));
        };
        let mut out = Vec::with_capacity(self.requests.len());
        for req in &self.requests {
            let f = self.assets.fetch(loc, req).await?;
            debug!(id = record.id, %f, "Image ready");
            out.push(f);
        }
        Ok(Prepared::Ready(out))
    }

    async fn write(&self, _: &S, _: &mut S::Tx, ready: &Vec<Fetched>) -> Result<Outcome> {
        // stock images only, rerun from a reset checkpoint to try again
        if ready.iter().all(|f| matches!(f, Fetched::Fallback(_))) {
            return Ok(Outcome::Skipped);
        }
        Ok(Outcome::Written)
    }
}
