use anyhow::{Context, Result};
use serde::Serialize;
use washdir::{
    assets::AssetCache,
    batch::{self, OffsetSource, RunOpts, RunSummary},
    build, cache,
    cli::{CheckpointCommands, Cli, Commands, HttpArgs, image_requests},
    db::{self, ListingFilter, ListingSource, PgStore},
    jobs::{enrich::EnrichJob, images::ImagesJob, import::ImportJob, textify::TextifyJob},
    models::Checkpoint,
    places::PlacesClient,
    signals, source,
    store::Store,
};
use tracing::{info, trace, warn};

fn print<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn finish(summary: RunSummary) -> Result<()> {
    if summary.interrupted {
        warn!(job = %summary.job, position = summary.position, "Stopped early on request");
    }
    if summary.deferred > 0 {
        warn!(
            job = %summary.job,
            position = summary.position,
            deferred = summary.deferred,
            "Stopped on a transient failure, run again later to continue"
        );
    }
    print(&summary)
}

async fn http_client(http: &HttpArgs) -> Result<(cache::Client, PlacesClient)> {
    let client = cache::Client::build(http.cache_opts())
        .await
        .context("Failed to build HTTP client")?;
    let places =
        PlacesClient::new(client.clone(), &http.api_key).with_base_url(&http.places_base_url);
    Ok((client, places))
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env file is fine, the environment may be set up already
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();
    cli.init_logger()?;
    trace!(version = build::PKG_VERSION, commit = build::SHORT_COMMIT, "Starting");

    let url = cli
        .database_url
        .as_deref()
        .context("No database url, set DATABASE_URL or pass --database-url")?;
    let pg = db::connect(url, cli.max_connections)
        .await
        .context("Failed to connect to database")?;

    match &cli.command {
        Commands::Migrate => {
            db::migrate(&pg).await?;
            info!("Schema is up to date");
        }
        Commands::Import { file, job, run } => {
            let rows = source::read_rows(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            info!(file = %file.display(), rows = rows.len(), "Source loaded");
            let store = PgStore::new(pg);
            let mut src = OffsetSource::new(rows);
            let summary = batch::run(
                &store,
                &mut src,
                &ImportJob::new(job),
                &RunOpts::from(run),
                &mut signals::listen()?,
            )
            .await?;
            finish(summary)?;
        }
        Commands::Enrich {
            force,
            radius,
            max_radius,
            run,
            http,
        } => {
            let (client, places) = http_client(http).await?;
            let mut job = EnrichJob::new(places.with_search_radius(*radius, *max_radius));
            if *force {
                job = job.forced();
            }
            let store = PgStore::new(pg.clone());
            let mut src = ListingSource::new(pg, job.listing_filter());
            let res = batch::run(
                &store,
                &mut src,
                &job,
                &RunOpts::from(run),
                &mut signals::listen()?,
            )
            .await;
            // keep what we paid for, even if the run failed
            client.save().await?;
            finish(res?)?;
        }
        Commands::Textify { run } => {
            let store = PgStore::new(pg.clone());
            let mut src = ListingSource::new(pg, ListingFilter::Enriched);
            let summary = batch::run(
                &store,
                &mut src,
                &TextifyJob,
                &RunOpts::from(run),
                &mut signals::listen()?,
            )
            .await?;
            finish(summary)?;
        }
        Commands::Images {
            dir,
            fallback_image,
            width,
            height,
            zoom,
            heading,
            no_street_view,
            run,
            http,
        } => {
            let (client, places) = http_client(http).await?;
            let job = ImagesJob::new(
                AssetCache::new(dir, fallback_image, places),
                image_requests(*width, *height, *zoom, *heading, !*no_street_view),
            );
            let store = PgStore::new(pg.clone());
            let mut src = ListingSource::new(pg, ListingFilter::WithCoordinates);
            let res = batch::run(
                &store,
                &mut src,
                &job,
                &RunOpts::from(run),
                &mut signals::listen()?,
            )
            .await;
            client.save().await?;
            finish(res?)?;
        }
        Commands::Recount => print(&db::recount(&pg).await?)?,
        Commands::Dedupe { dry_run } => print(&db::dedupe(&pg, *dry_run).await?)?,
        Commands::Checkpoint { command } => match command {
            CheckpointCommands::Show { job: Some(job) } => {
                print(&PgStore::new(pg).load_checkpoint(job).await?)?
            }
            CheckpointCommands::Show { job: None } => print(&db::list_checkpoints(&pg).await?)?,
            CheckpointCommands::Reset { job, position } => {
                let store = PgStore::new(pg.clone());
                let cp = Checkpoint {
                    position: (*position).max(0),
                    ..store.load_checkpoint(job).await?
                };
                db::put_checkpoint(&pg, &cp).await?;
                print(&cp)?;
            }
            CheckpointCommands::Seed { job, file } => {
                let cp = source::read_legacy_cursor(file, job)
                    .with_context(|| format!("Failed to read cursor file {}", file.display()))?;
                db::put_checkpoint(&pg, &cp).await?;
                print(&cp)?;
            }
        },
    }
    Ok(())
}
