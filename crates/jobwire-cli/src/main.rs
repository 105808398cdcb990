use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobwire_storage::{ImportStore, PgQueue, PgStore, TaskQueue};
use jobwire_sync::{
    maybe_build_scheduler, BroadcastPublisher, ImportPipeline, NoopPublisher, RunPublisher,
    SyncConfig, Worker, WorkerOptions,
};
use jobwire_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "jobwire-cli")]
#[command(about = "jobwire job feed importer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one import pass and drain the task queue, then exit.
    Import,
    /// Run the queue worker loop until interrupted.
    Worker,
    /// Run the web server, workers and scheduler together.
    Serve,
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Import => {
            let (store, queue) = connect(&config).await?;
            let publisher: Arc<dyn RunPublisher> = Arc::new(NoopPublisher);
            let pipeline =
                ImportPipeline::from_config(&config, store.clone(), queue.clone(), publisher.clone())?;
            pipeline.run_import().await?;
            let worker = Worker::new(
                store,
                queue,
                publisher,
                Arc::new(config.rate_limiter()),
                WorkerOptions::from_config(&config),
            );
            worker.drain().await.context("draining task queue")?;
            info!("import complete");
        }
        Commands::Worker => {
            let (store, queue) = connect(&config).await?;
            let worker = Worker::new(
                store,
                queue,
                Arc::new(NoopPublisher),
                Arc::new(config.rate_limiter()),
                WorkerOptions::from_config(&config),
            );
            worker.run().await;
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<(Arc<dyn ImportStore>, Arc<dyn TaskQueue>)> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let queue = PgQueue::new(store.pool().clone());
    Ok((Arc::new(store), Arc::new(queue)))
}

async fn serve(config: SyncConfig) -> Result<()> {
    let pg = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    pg.migrate().await.context("applying migrations")?;
    let store: Arc<dyn ImportStore> = Arc::new(pg.clone());
    let queue: Arc<dyn TaskQueue> = Arc::new(PgQueue::new(pg.pool().clone()));

    let broadcast = Arc::new(BroadcastPublisher::new(256));
    let events = broadcast.sender();
    let publisher: Arc<dyn RunPublisher> = broadcast;

    let pipeline = Arc::new(ImportPipeline::from_config(
        &config,
        store.clone(),
        queue.clone(),
        publisher.clone(),
    )?);

    let limiter = Arc::new(config.rate_limiter());
    for _ in 0..config.worker_concurrency.max(1) {
        let worker = Worker::new(
            store.clone(),
            queue.clone(),
            publisher.clone(),
            limiter.clone(),
            WorkerOptions::from_config(&config),
        );
        tokio::spawn(async move { worker.run().await });
    }

    let scheduler = maybe_build_scheduler(&config, pipeline.clone()).await?;
    if let Some(mut sched) = scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.import_cron, "scheduler running");
    }

    // Kick off an import at startup, same as a scheduled run.
    let startup_pipeline = pipeline.clone();
    tokio::spawn(async move {
        if let Err(err) = startup_pipeline.run_import().await {
            warn!(error = %err, "startup import failed");
        }
    });

    let state = AppState::new(store, pipeline, events);
    jobwire_web::serve(state, config.web_port).await
}
