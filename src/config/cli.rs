use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::domain::types::{CacheEntryId, EntityId};

/// Command-line arguments for the Tessera binary.
#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Tessera fragment cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TESSERA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Apply database migrations for the cache tables and the job queue.
    Migrate(DatabaseOverride),
    /// Remove expired fragments.
    Sweep(SweepArgs),
    /// Delete fragments by id, or every fragment when no id is given.
    Purge(PurgeArgs),
    /// Invalidate fragments that depend on the given entities or entity types.
    Invalidate(InvalidateArgs),
    /// Print row counts of the cache tables.
    Stats(StatsArgs),
    /// Run the requery job worker and the periodic expiry sweeper.
    Worker(Box<WorkerArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Sweep even when the throttle window has not elapsed.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Fragment id to delete; repeatable.
    #[arg(long = "entry-id", value_name = "ID")]
    pub entry_ids: Vec<CacheEntryId>,
}

#[derive(Debug, Args, Clone)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .multiple(true)
        .args(["entity_ids", "entity_types"])
))]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Changed entity id; repeatable.
    #[arg(long = "entity-id", value_name = "ID")]
    pub entity_ids: Vec<EntityId>,

    /// Changed entity type handle; repeatable.
    #[arg(long = "entity-type", value_name = "HANDLE")]
    pub entity_types: Vec<String>,

    /// Do not schedule a saved-query requery for the ids.
    #[arg(long = "no-requery", action = clap::ArgAction::SetTrue)]
    pub no_requery: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatsArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Print the counts as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the requery worker concurrency.
    #[arg(long = "jobs-requery-concurrency", value_name = "COUNT")]
    pub jobs_requery_concurrency: Option<u32>,

    /// Override how often the worker attempts an expiry sweep.
    #[arg(long = "jobs-sweep-interval-seconds", value_name = "SECONDS")]
    pub jobs_sweep_interval_seconds: Option<u64>,

    /// Override the minimum time between two sweeps.
    #[arg(long = "cache-sweep-throttle-seconds", value_name = "SECONDS")]
    pub cache_sweep_throttle_seconds: Option<u64>,

    /// Toggle saved-query tracking and deferred requery.
    #[arg(
        long = "cache-query-caching",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_query_caching: Option<bool>,
}
