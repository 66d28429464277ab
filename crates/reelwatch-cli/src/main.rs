use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reelwatch_scraper::{HttpClientConfig, HttpFetcher, LetterboxdScraper};
use reelwatch_storage::{FilmStore, PgFilmStore};
use reelwatch_sync::{
    extract_slug, ScrapePipeline, TickOutcome, TrackerConfig, TrackerScheduler,
};
use reelwatch_web::AppState;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reelwatch")]
#[command(about = "Letterboxd rating tracker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations and serve the HTTP API. Also runs the refresh
    /// scheduler when REELWATCH_SCHEDULER_ENABLED is set.
    Serve {
        #[arg(long, env = "REELWATCH_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Run the refresh scheduler as a standalone process.
    Scheduler,
    /// Run one refresh pass over all tracked films and exit.
    Tick,
    /// Register a film by slug or letterboxd URL.
    Add { film: String },
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::from_env();

    match cli.command {
        Commands::Serve { port } => {
            let pool = connect(&config).await?;
            reelwatch_storage::run_migrations(&pool).await?;
            let pipeline = build_pipeline(&config, pool)?;

            let scheduler = if config.scheduler_enabled {
                let scheduler =
                    Arc::new(TrackerScheduler::new(Arc::clone(&pipeline), &config).await?);
                scheduler.register().await?;
                scheduler.start().await?;
                Some(scheduler)
            } else {
                None
            };

            let state = AppState {
                pipeline,
                scheduler,
                admin_token: std::env::var("REELWATCH_ADMIN_TOKEN").ok(),
                scheduler_enabled: config.scheduler_enabled,
            };
            reelwatch_web::serve(state, port).await?;
        }
        Commands::Scheduler => {
            let pool = connect(&config).await?;
            reelwatch_storage::run_migrations(&pool).await?;
            let pipeline = build_pipeline(&config, pool)?;

            let scheduler = TrackerScheduler::new(pipeline, &config).await?;
            scheduler.register().await?;
            scheduler.start().await?;
            info!(
                interval_minutes = config.interval_minutes,
                "scheduler running, ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::Tick => {
            let pool = connect(&config).await?;
            reelwatch_storage::run_migrations(&pool).await?;
            let pipeline = build_pipeline(&config, pool)?;

            match pipeline.run_tick().await? {
                TickOutcome::Completed(summary) => {
                    println!(
                        "tick complete: films={} succeeded={} failed={} snapshots={}",
                        summary.films, summary.succeeded, summary.failed,
                        summary.snapshots_recorded
                    );
                }
                TickOutcome::Skipped => println!("tick skipped: another pass is running"),
            }
        }
        Commands::Add { film } => {
            let slug = extract_slug(&film)
                .with_context(|| format!("not a film slug or film url: {film}"))?;

            let pool = connect(&config).await?;
            reelwatch_storage::run_migrations(&pool).await?;
            let pipeline = build_pipeline(&config, pool)?;

            let film = pipeline.register_film(&slug).await?;
            println!(
                "added film {} ({}) rating={:?} count={:?}",
                film.display_name,
                film.letterboxd_slug,
                film.last_known_average_rating,
                film.last_known_rating_count
            );
        }
        Commands::Migrate => {
            let pool = connect(&config).await?;
            reelwatch_storage::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn connect(config: &TrackerConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))
}

fn build_pipeline(config: &TrackerConfig, pool: PgPool) -> Result<Arc<ScrapePipeline>> {
    let store: Arc<dyn FilmStore> = Arc::new(PgFilmStore::new(pool));
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: std::time::Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
    })?;
    let scraper = Arc::new(LetterboxdScraper::new(http, &config.base_url));
    Ok(Arc::new(ScrapePipeline::new(
        store,
        scraper,
        config.politeness_delay_secs,
    )))
}
