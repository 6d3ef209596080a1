use crate::{
    assets::ImageRequest,
    batch::RunOpts,
    build, cache,
    error::Result,
    jobs::import,
    places::DEFAULT_BASE_URL,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::log::LevelFilter;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::{io, path::PathBuf, time::Duration};
use tracing_subscriber::filter::LevelFilter as TFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum LogFormat {
    Normal,
    Compact,
    Pretty,
    #[default]
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, long_version = build::CLAP_LONG_VERSION, about, long_about = None, propagate_version = true)]
pub struct Cli {
    /// Log level verbosity
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Which log formatter to use
    // env will pick up the value if the field name is given as the key in uppercase
    #[arg(short = 'f', long, env, default_value_t, value_enum, global = true)]
    pub log_format: LogFormat,

    /// Postgres connection string
    #[arg(long, env, global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Size of the connection pool
    #[arg(long, env, default_value_t = 5, global = true)]
    pub max_connections: u32,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Create or update the database schema
    Migrate,
    /// Import listings from a .csv, .xlsx or .json file
    Import {
        /// File to read
        file: PathBuf,

        /// Checkpoint name, use one per source file
        #[arg(short, long, default_value = import::DEFAULT_NAME)]
        job: String,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Look listings up in Google Places and store details, hours and nearby places
    Enrich {
        /// Also walk listings that were enriched before. Forced runs keep their own checkpoint,
        /// "enrich-force", which `checkpoint reset` starts over.
        #[arg(long)]
        force: bool,

        /// First nearby search radius in metres
        #[arg(long, default_value_t = 100)]
        radius: u32,

        /// Largest nearby search radius in metres
        #[arg(long, default_value_t = 1000)]
        max_radius: u32,

        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        http: HttpArgs,
    },
    /// Render stored Places data into static text
    Textify {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Download static map and street view images into a local cache
    Images {
        /// Cache directory
        #[arg(short, long, default_value = "images")]
        dir: PathBuf,

        /// Served in place of images that can't be fetched
        #[arg(long, default_value = "static/laundromat-placeholder.jpg")]
        fallback_image: PathBuf,

        #[arg(long, default_value_t = 600)]
        width: u32,

        #[arg(long, default_value_t = 400)]
        height: u32,

        /// Static map zoom level
        #[arg(long, default_value_t = 15)]
        zoom: u8,

        /// Street view camera heading in degrees
        #[arg(long, default_value_t = 0)]
        heading: u16,

        /// Only fetch static maps
        #[arg(long)]
        no_street_view: bool,

        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        http: HttpArgs,
    },
    /// Recompute the listing counts of states and cities
    Recount,
    /// Delete duplicate listings, then recount
    Dedupe {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect or change job checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum CheckpointCommands {
    /// Print one checkpoint, or all of them
    Show { job: Option<String> },
    /// Move a job back to the start, or to a given position
    Reset {
        job: String,
        #[arg(long, default_value_t = 0)]
        position: i64,
    },
    /// Carry over a progress file from the old import scripts
    Seed { job: String, file: PathBuf },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Records per transaction
    #[arg(short, long, default_value_t = 50)]
    pub batch_size: usize,

    /// Keep running batches until the source is exhausted
    #[arg(long)]
    pub until_done: bool,

    /// Sleep between batches
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub pause: Duration,

    /// Stop after this many batches
    #[arg(long)]
    pub max_batches: Option<usize>,
}

impl From<&RunArgs> for RunOpts {
    fn from(a: &RunArgs) -> Self {
        Self {
            batch_size: a.batch_size,
            until_done: a.until_done,
            pause: a.pause,
            max_batches: a.max_batches,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct HttpArgs {
    /// Google Maps Platform key
    #[arg(long, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env, default_value = DEFAULT_BASE_URL, hide = true)]
    pub places_base_url: String,

    /// Wait this long before every API call
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub request_delay: Duration,

    /// Add up to this much random time to each delay
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    pub jitter: Duration,

    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// How long API responses stay cached, 0s disables the cache
    #[arg(long, default_value = "7d", value_parser = humantime::parse_duration)]
    pub http_cache_ttl: Duration,

    #[arg(long, default_value_t = 10_000)]
    pub http_cache_capacity: usize,

    /// Persist the response cache in this file between runs
    #[arg(long, env)]
    pub http_cache_path: Option<PathBuf>,
}

impl HttpArgs {
    pub fn cache_opts(&self) -> cache::Opts {
        cache::Opts {
            request_delay: self.request_delay,
            request_jitter: self.jitter,
            request_timeout: self.request_timeout,
            cache_ttl: self.http_cache_ttl,
            cache_capacity: self.http_cache_capacity,
            cache_path: self.http_cache_path.clone(),
        }
    }
}

/// Image requests for the images subcommand
pub fn image_requests(
    width: u32,
    height: u32,
    zoom: u8,
    heading: u16,
    street_view: bool,
) -> Vec<ImageRequest> {
    let mut v = vec![ImageRequest::static_map(width, height, zoom)];
    if street_view {
        v.push(ImageRequest::street_view(width, height, heading));
    }
    v
}

impl Cli {
    /// Wrapper for clap::Parser::try_parse_from
    pub fn try_parse_opts<I, T>(itr: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(itr)
    }

    // this thin wrapper makes it possible to do the parsing without importing clap::Parser at the
    // call site
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Maps clap_verbosity_flag::LevelFilter values to tracing_subscriber::filter::LevelFilter
    /// values
    fn tracing_level_filter(&self) -> TFilter {
        match self.verbosity.log_level_filter() {
            LevelFilter::Off => TFilter::OFF,
            LevelFilter::Error => TFilter::ERROR,
            LevelFilter::Warn => TFilter::WARN,
            LevelFilter::Info => TFilter::INFO,
            LevelFilter::Debug => TFilter::DEBUG,
            LevelFilter::Trace => TFilter::TRACE,
        }
    }

    pub fn init_logger(&self) -> Result<(), tracing_subscriber::filter::FromEnvError> {
        let layer = match self.log_format {
            LogFormat::Json => fmt::layer().json().with_writer(io::stderr).boxed(),
            LogFormat::Pretty => fmt::layer().pretty().with_writer(io::stderr).boxed(),
            LogFormat::Compact => fmt::layer()
                .without_time()
                .compact()
                .with_writer(io::stderr)
                .boxed(),
            LogFormat::Normal => fmt::layer().with_writer(io::stderr).boxed(),
        };
        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(self.tracing_level_filter().into())
                    .from_env()?,
            )
            .with(layer)
            .init();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_args() {
        let cli = Cli::try_parse_opts([
            "washdir",
            "import",
            "listings.xlsx",
            "--until-done",
            "--pause",
            "250ms",
            "-b",
            "20",
        ])
        .unwrap();
        let Commands::Import { file, job, run } = cli.command else {
            panic!("not an import");
        };
        assert_eq!(PathBuf::from("listings.xlsx"), file);
        assert_eq!("import", job);
        let opts = RunOpts::from(&run);
        assert_eq!(20, opts.batch_size);
        assert!(opts.until_done);
        assert_eq!(Duration::from_millis(250), opts.pause);
        assert_eq!(None, opts.max_batches);
    }

    #[test]
    fn enrich_args() {
        let cli = Cli::try_parse_opts([
            "washdir",
            "enrich",
            "--api-key",
            "k",
            "--request-delay",
            "1s",
            "--http-cache-ttl",
            "0s",
        ])
        .unwrap();
        let Commands::Enrich {
            http, radius, max_radius, ..
        } = cli.command
        else {
            panic!("not enrich");
        };
        assert_eq!((100, 1000), (radius, max_radius));
        let o = http.cache_opts();
        assert_eq!(Duration::from_secs(1), o.request_delay);
        assert!(o.cache_ttl.is_zero());
    }

    #[test]
    fn street_view_is_optional() {
        assert_eq!(2, image_requests(600, 400, 15, 0, true).len());
        assert_eq!(
            vec![ImageRequest::static_map(600, 400, 15)],
            image_requests(600, 400, 15, 0, false)
        );
    }
}
