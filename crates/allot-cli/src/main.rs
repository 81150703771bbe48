use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use allot_engine::{
    build_scraper_registry, load_registrar_registry, maybe_build_scheduler, EngineConfig,
    Resolver, Sweeper, WorkerPool,
};
use allot_registrars::ScraperRegistry;
use allot_store::{
    connect_pool, migrator, IpoDirectory, JobQueue, PgIpoDirectory, PgJobQueue, PgResultStore,
    QueueConfig, ResultStore,
};
use allot_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "allot")]
#[command(about = "IPO allotment status resolution service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web surface, the scrape worker pool, and the sweep scheduler.
    Serve,
    /// Run only the scrape worker pool.
    Worker,
    /// Run one reconciliation sweep and exit.
    Sweep,
    /// Apply database migrations and exit.
    Migrate,
    /// Resolve allotment status for one IPO and a set of tax IDs.
    Resolve {
        ipo_id: Uuid,
        #[arg(required = true)]
        tax_ids: Vec<String>,
    },
}

struct Runtime {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    ipos: Arc<dyn IpoDirectory>,
}

async fn build_runtime(config: &EngineConfig) -> Result<Runtime> {
    let pool = connect_pool(&config.database_url)
        .await
        .context("connecting to database")?;
    migrator().run(&pool).await.context("applying migrations")?;
    Ok(Runtime {
        store: Arc::new(PgResultStore::new(pool.clone())),
        queue: Arc::new(PgJobQueue::new(pool.clone(), QueueConfig::default())),
        ipos: Arc::new(PgIpoDirectory::new(pool)),
    })
}

fn build_registry(config: &EngineConfig) -> Result<Arc<ScraperRegistry>> {
    let file = load_registrar_registry(&config.registrars_file)?;
    let registry = build_scraper_registry(
        &file,
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
    )?;
    Ok(Arc::new(registry))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = build_runtime(&config).await?;
            let registry = build_registry(&config)?;

            let pool = WorkerPool::new(
                Arc::clone(&runtime.store),
                Arc::clone(&runtime.queue),
                Arc::clone(&registry),
                config.worker_concurrency,
            )
            .with_poll_interval(Duration::from_millis(config.worker_poll_ms));
            tokio::spawn(async move { pool.run().await });

            let sweeper = Arc::new(Sweeper::new(
                Arc::clone(&runtime.store),
                Arc::clone(&runtime.queue),
                Arc::clone(&runtime.ipos),
                config.sweep_window_days,
            ));
            if let Some(scheduler) = maybe_build_scheduler(&config, sweeper).await? {
                scheduler.start().await.context("starting sweep scheduler")?;
            }

            let resolver = Arc::new(Resolver::new(runtime.store, runtime.queue, runtime.ipos));
            info!(port = config.web_port, "serving allotment resolution api");
            allot_web::serve(AppState::new(resolver), config.web_port).await?;
        }
        Commands::Worker => {
            let runtime = build_runtime(&config).await?;
            let registry = build_registry(&config)?;
            let pool = WorkerPool::new(
                runtime.store,
                runtime.queue,
                registry,
                config.worker_concurrency,
            )
            .with_poll_interval(Duration::from_millis(config.worker_poll_ms));
            info!(concurrency = config.worker_concurrency, "running scrape worker pool");
            pool.run().await;
        }
        Commands::Sweep => {
            let runtime = build_runtime(&config).await?;
            let sweeper = Sweeper::new(
                runtime.store,
                runtime.queue,
                runtime.ipos,
                config.sweep_window_days,
            );
            let summary = sweeper.sweep_once().await?;
            println!(
                "sweep complete: run_id={} examined_ipos={} requeued_jobs={}",
                summary.run_id, summary.examined_ipos, summary.requeued_jobs
            );
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url)
                .await
                .context("connecting to database")?;
            migrator().run(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Resolve { ipo_id, tax_ids } => {
            let runtime = build_runtime(&config).await?;
            let resolver = Resolver::new(runtime.store, runtime.queue, runtime.ipos);
            let response = resolver
                .resolve(ipo_id, &tax_ids, None)
                .await
                .context("resolving allotment status")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}
