//! Worker process: connects to Postgres, starts the engine, runs one command and
//! drains before exiting.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use collectionjobs_infra::jobs::{Engine, JobService};
use collectionjobs_infra::storage::PostgresStorage;

use config::{Cli, Command};

fn main() -> anyhow::Result<()> {
    collectionjobs_observability::init();
    let cli = Cli::parse();

    // Workers are OS threads; this runtime only drives SQLx futures for them.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("collectionjobs-db")
        .build()
        .context("failed to build tokio runtime")?;

    let pool = runtime
        .block_on(
            PgPoolOptions::new()
                .max_connections(cli.max_connections)
                .connect(&cli.database_url),
        )
        .context("failed to connect to Postgres")?;
    let storage = Arc::new(PostgresStorage::new(pool, runtime.handle().clone()));

    if cli.migrate {
        storage.migrate().context("failed to apply schema")?;
        info!("schema up to date");
    }

    let engine = Engine::start(cli.engine_config(), storage.clone())?;
    let outcome = run(cli.command, &engine, storage);

    // Drain even when the command failed: jobs that were already queued still finish.
    let stats = engine.shutdown();
    info!(
        batches_processed = stats.batches_processed,
        batches_failed = stats.batches_failed,
        unknown_messages = stats.unknown_messages,
        "worker exiting"
    );

    outcome
}

fn run(
    command: Command,
    engine: &Engine<PostgresStorage>,
    storage: Arc<PostgresStorage>,
) -> anyhow::Result<()> {
    let service = JobService::new(storage, engine);

    match command {
        Command::Resume => {
            let resumed = service.resume_active_jobs()?;
            println!("resumed {resumed} job(s)");
        }
        Command::Import {
            source,
            target,
            companies,
        } => {
            let id = service.create_import_job(source, target, companies)?;
            println!("{id}");
        }
        Command::Status { job } => match service.job(job)? {
            Some(record) => println!("{} {} {}", record.id, record.status, record.message),
            None => anyhow::bail!("job {job} not found"),
        },
    }

    Ok(())
}
