use crate::{error::Result, util::wait_with_jitter};
use http_cache_reqwest::{
    Cache, CacheMode, HttpCache, HttpCacheOptions, MokaCache, MokaCacheBuilder, MokaManager,
};
use reqwest::IntoUrl;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::hash_map::RandomState,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, trace};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

type MCache = MokaCache<String, Arc<Vec<u8>>, RandomState>;

/// Key http-cache stores a GET response under
fn response_key(url: &str) -> String {
    format!("GET:{url}")
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    value: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    store: Vec<CacheEntry>,
}

impl CacheFile {
    fn with_capacity(cap: usize) -> Self {
        Self {
            store: Vec::with_capacity(cap),
        }
    }

    /// Try to populate the given cache with contents of the given file.
    /// If it fails to load the file, an error will be logged, and the cache will be returned
    /// unmodified.
    async fn populate_cache<P: AsRef<Path>>(path: P, cap: usize, cache: MCache) -> MCache {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No response cache file yet");
            return cache;
        }
        let mut this = Self::with_capacity(cap);
        if let Err(err) = this.load(path) {
            error!(%err, path = %path.display(), "Failed to load response cache file");
            return cache; // unmodified
        }
        let mut cnt = 0;
        for e in this.store {
            cache.insert(e.key, Arc::new(e.value)).await;
            cnt += 1;
        }
        trace!("Loaded {} responses into cache", cnt);
        cache
    }

    /// Copy the contents of the given cache into the internal Vec, for saving to file.
    async fn from_cache(cache: &MCache) -> Self {
        cache.run_pending_tasks().await;
        let mut this = Self::with_capacity(cache.entry_count() as usize);

        for (k, v) in cache.iter() {
            this.store.push(CacheEntry {
                key: (*k).clone(),
                value: (*v).clone(),
            });
        }
        trace!("Collected {} responses from cache", this.store.len());

        this
    }

    fn save<P: AsRef<Path>>(self, path: P) -> Result<()> {
        let mut f = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(&self.store, &mut f, bincode::config::standard())?;
        f.flush()?;
        Ok(())
    }

    fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut f = BufReader::new(File::open(path)?);
        self.store = bincode::serde::decode_from_std_read(&mut f, bincode::config::standard())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Opts {
    pub request_delay: Duration,
    pub request_jitter: Duration,
    pub request_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub cache_path: Option<PathBuf>,
}

impl Opts {
    fn cache_mode(&self) -> CacheMode {
        if self.cache_ttl.is_zero() {
            return CacheMode::NoStore;
        }
        // Places responses are sent with "no-cache", so we have to force it
        CacheMode::ForceCache
    }

    fn build_cache(&self) -> MCache {
        MokaCacheBuilder::new(self.cache_capacity as u64)
            .name("PlacesResponseCache")
            .time_to_live(self.cache_ttl)
            .build()
    }

    fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::ClientBuilder::new()
            .user_agent(APP_USER_AGENT)
            .timeout(self.request_timeout)
            .build()
    }
}

/// HTTP client used for every outbound call. Requests are sequential and each one waits for
/// the configured delay first, which is the only rate limiting we do.
#[derive(Clone)]
pub struct Client {
    client: ClientWithMiddleware,
    cache: MCache,
    cache_path: Option<PathBuf>,
    request_delay: Duration,
    request_jitter: Duration,
}

impl Client {
    pub async fn build(opts: Opts) -> Result<Self> {
        // if a file path is set, try to populate the cache from the file,
        // otherwise create empty cache
        let cache = match opts.cache_path.as_ref() {
            Some(p) => CacheFile::populate_cache(p, opts.cache_capacity, opts.build_cache()).await,
            None => opts.build_cache(),
        };
        Ok(Self {
            client: ClientBuilder::new(opts.build_client()?)
                .with(Cache(HttpCache {
                    mode: opts.cache_mode(),
                    manager: MokaManager::new(cache.clone()),
                    options: HttpCacheOptions::default(),
                }))
                .build(),
            cache,
            cache_path: opts.cache_path,
            request_delay: opts.request_delay,
            request_jitter: opts.request_jitter,
        })
    }

    /// Sleep for the configured delay plus a random share of the jitter
    pub async fn throttle(&self) {
        wait_with_jitter(self.request_delay, self.request_jitter).await;
    }

    pub async fn save(&self) -> Result<()> {
        // try to save to file if a path is given
        match self.cache_path.as_ref() {
            Some(p) => {
                CacheFile::from_cache(&self.cache).await.save(p)?;
                debug!(path = %p.display(), "Saved response cache");
                Ok(())
            }
            None => {
                debug!("No cache file path set, unable to save");
                Ok(())
            }
        }
    }

    /// Drop a cached response, for bodies that turned out to be errors
    pub async fn forget(&self, url: &str) {
        trace!(url, "Evicting cached response");
        self.cache.invalidate(&response_key(url)).await;
    }

    pub async fn get_json<U: IntoUrl, T: DeserializeOwned>(&self, url: U) -> Result<T> {
        self.throttle().await;
        let res = self.client.get(url).send().await?.error_for_status()?;
        Ok(res.json::<T>().await?)
    }

    /// Fetch raw bytes, returning the response content type alongside
    pub async fn get_bytes<U: IntoUrl>(&self, url: U) -> Result<(Option<String>, Vec<u8>)> {
        self.throttle().await;
        let res = self.client.get(url).send().await?.error_for_status()?;
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok((content_type, res.bytes().await?.to_vec()))
    }
}
