use std::time::Duration;

use clap::{Parser, Subcommand};

use collectionjobs_core::{CollectionId, CompanyId, JobId};
use collectionjobs_infra::jobs::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "collectionjobs-worker")]
#[command(about = "Run and resume collection import jobs")]
#[command(version)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Connection pool size
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Worker threads (defaults to COLLECTIONJOBS_WORKERS, then 2)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Idle poll interval in milliseconds (defaults to COLLECTIONJOBS_POLL_INTERVAL_MS, then 1000)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Create missing tables before running
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resubmit every active job from its stored cursor and wait for them to finish
    Resume,

    /// Copy members of one collection into another and wait for the job to finish
    Import {
        source: CollectionId,
        target: CollectionId,
        /// Only copy these companies (all members when omitted)
        companies: Vec<CompanyId>,
    },

    /// Print a job record
    Status { job: JobId },
}

impl Cli {
    /// Engine settings from the environment, overridden by command-line flags.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env().with_name("collectionjobs");
        if let Some(workers) = self.workers {
            config = config.with_worker_count(workers);
        }
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        config
    }
}
