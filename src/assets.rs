// Static map and street view images, cached on disk under names derived from the request, so
// the same image is never paid for twice. There is no expiry: delete the file to refetch.

use crate::{
    error::Result,
    places::{LatLng, PlacesClient},
};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    StaticMap { zoom: u8 },
    StreetView { heading: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRequest {
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
}

impl ImageRequest {
    pub fn static_map(width: u32, height: u32, zoom: u8) -> Self {
        Self {
            kind: ImageKind::StaticMap { zoom },
            width,
            height,
        }
    }

    pub fn street_view(width: u32, height: u32, heading: u16) -> Self {
        Self {
            kind: ImageKind::StreetView { heading },
            width,
            height,
        }
    }

    fn size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

fn coord(v: f64) -> String {
    format!("{v:.5}").replace('-', "m")
}

/// e.g. "staticmap_30.26720_m97.74310_600x400_15.jpg"
pub fn cache_key(loc: LatLng, req: &ImageRequest) -> String {
    let (prefix, last) = match req.kind {
        ImageKind::StaticMap { zoom } => ("staticmap", zoom.to_string()),
        ImageKind::StreetView { heading } => ("streetview", heading.to_string()),
    };
    format!(
        "{prefix}_{}_{}_{}_{last}.jpg",
        coord(loc.lat),
        coord(loc.lng),
        req.size()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Already on disk
    Hit(PathBuf),
    Downloaded(PathBuf),
    /// Stock image, nothing was cached
    Fallback(PathBuf),
}

impl Fetched {
    pub fn path(&self) -> &Path {
        match self {
            Self::Hit(p) | Self::Downloaded(p) | Self::Fallback(p) => p,
        }
    }
}

impl Display for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Hit(p) => write!(f, "hit {}", p.display()),
            Self::Downloaded(p) => write!(f, "downloaded {}", p.display()),
            Self::Fallback(p) => write!(f, "fallback {}", p.display()),
        }
    }
}

#[derive(Clone)]
pub struct AssetCache {
    dir: PathBuf,
    fallback: PathBuf,
    places: PlacesClient,
}

impl AssetCache {
    pub fn new<P: Into<PathBuf>, F: Into<PathBuf>>(dir: P, fallback: F, places: PlacesClient) -> Self {
        Self {
            dir: dir.into(),
            fallback: fallback.into(),
            places,
        }
    }

    fn fallback(&self, reason: &str, key: &str) -> Fetched {
        warn!(key, reason, "Using fallback image");
        Fetched::Fallback(self.fallback.clone())
    }

    /// Cached file if present, otherwise download it. Any failure to get an image gives the
    /// fallback path; only failing to write the cache file is an error.
    pub async fn fetch(&self, loc: LatLng, req: &ImageRequest) -> Result<Fetched> {
        let key = cache_key(loc, req);
        let path = self.dir.join(&key);
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(key, "Image cache hit");
            return Ok(Fetched::Hit(path));
        }

        let center = format!("{},{}", loc.lat, loc.lng);
        let size = req.size();
        let url = match req.kind {
            ImageKind::StaticMap { zoom } => {
                let zoom = zoom.to_string();
                self.places.url(
                    "staticmap",
                    &[
                        ("center", center.as_str()),
                        ("zoom", zoom.as_str()),
                        ("size", size.as_str()),
                        ("markers", center.as_str()),
                    ],
                )
            }
            ImageKind::StreetView { heading } => {
                if !self.places.has_street_view(loc).await {
                    return Ok(self.fallback("no street view imagery", &key));
                }
                let heading = heading.to_string();
                self.places.url(
                    "streetview",
                    &[
                        ("location", center.as_str()),
                        ("size", size.as_str()),
                        ("heading", heading.as_str()),
                        ("fov", "90"),
                    ],
                )
            }
        }?;

        let (content_type, bytes) = match self.places.client().get_bytes(url).await {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, key, "Image download failed");
                return Ok(self.fallback("download failed", &key));
            }
        };
        if !content_type.is_some_and(|c| c.starts_with("image/")) || bytes.is_empty() {
            return Ok(self.fallback("response is not an image", &key));
        }

        fs::create_dir_all(&self.dir).await?;
        // write under a temporary name first, so an interrupted run never leaves a partial hit
        let tmp = self.dir.join(format!(".{key}.part"));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key, bytes = bytes.len(), "Image cached");
        Ok(Fetched::Downloaded(path))
    }
}
