//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;
#[cfg(test)]
mod tests;

pub use cli::{
    CliArgs, Command, DatabaseOverride, InvalidateArgs, LoggingOverrides, PurgeArgs, StatsArgs,
    SweepArgs, WorkerArgs,
};

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tessera";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_JOB_REQUERY_CONCURRENCY: u32 = 1;
const DEFAULT_JOB_SWEEP_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_SWEEP_THROTTLE_SECS: u64 = 86_400;
const DEFAULT_PATH_QUERY_PARAM: &str = "p";
const DEFAULT_PAGE_TRIGGER: &str = "p";
const DEFAULT_RESOURCE_TRIGGER: &str = "cpresources";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub jobs: JobsSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub requery_concurrency: NonZeroU32,
    /// How often the worker attempts a throttled expiry sweep.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub query_caching_enabled: bool,
    pub default_cache_duration_seconds: i64,
    pub sweep_throttle: Duration,
    pub path_query_param: String,
    pub page_trigger: String,
    pub site_url: Option<Url>,
    pub resource_trigger: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("TESSERA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match cli.command.as_ref() {
        Some(Command::Migrate(database)) => raw.apply_database_override(database),
        Some(Command::Sweep(args)) => raw.apply_database_override(&args.database),
        Some(Command::Purge(args)) => raw.apply_database_override(&args.database),
        Some(Command::Invalidate(args)) => raw.apply_database_override(&args.database),
        Some(Command::Stats(args)) => raw.apply_database_override(&args.database),
        Some(Command::Worker(args)) => raw.apply_worker_overrides(args),
        None => raw.apply_worker_overrides(&WorkerArgs::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    jobs: RawJobsSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_worker_overrides(&mut self, overrides: &WorkerArgs) {
        self.apply_database_override(&overrides.database);

        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(value) = overrides.jobs_requery_concurrency {
            self.jobs.requery_concurrency = Some(value);
        }
        if let Some(seconds) = overrides.jobs_sweep_interval_seconds {
            self.jobs.sweep_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_sweep_throttle_seconds {
            self.cache.sweep_throttle_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.cache_query_caching {
            self.cache.query_caching_enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            jobs,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            jobs: build_jobs_settings(jobs)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);

    Ok(DatabaseSettings {
        url,
        max_connections: non_zero_u32(max_connections.into(), "database.max_connections")?,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let requery = jobs
        .requery_concurrency
        .unwrap_or(DEFAULT_JOB_REQUERY_CONCURRENCY);

    let interval_seconds = jobs
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_JOB_SWEEP_INTERVAL_SECS);
    if interval_seconds == 0 {
        return Err(LoadError::invalid(
            "jobs.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(JobsSettings {
        requery_concurrency: non_zero_u32(requery.into(), "jobs.requery_concurrency")?,
        sweep_interval: Duration::from_secs(interval_seconds),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let path_query_param = non_empty(
        cache.path_query_param,
        DEFAULT_PATH_QUERY_PARAM,
        "cache.path_query_param",
    )?;
    let page_trigger = non_empty(cache.page_trigger, DEFAULT_PAGE_TRIGGER, "cache.page_trigger")?;
    let resource_trigger = non_empty(
        cache.resource_trigger,
        DEFAULT_RESOURCE_TRIGGER,
        "cache.resource_trigger",
    )?;

    let site_url = match cache.site_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => {
            let url = Url::parse(value).map_err(|err| {
                LoadError::invalid("cache.site_url", format!("failed to parse: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "cache.site_url",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        query_caching_enabled: cache.query_caching_enabled.unwrap_or(true),
        default_cache_duration_seconds: cache.default_cache_duration_seconds.unwrap_or(0),
        sweep_throttle: Duration::from_secs(
            cache
                .sweep_throttle_seconds
                .unwrap_or(DEFAULT_SWEEP_THROTTLE_SECS),
        ),
        path_query_param,
        page_trigger,
        site_url,
        resource_trigger,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    requery_concurrency: Option<u32>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    query_caching_enabled: Option<bool>,
    default_cache_duration_seconds: Option<i64>,
    sweep_throttle_seconds: Option<u64>,
    path_query_param: Option<String>,
    page_trigger: Option<String>,
    site_url: Option<String>,
    resource_trigger: Option<String>,
}

fn non_empty(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<String, LoadError> {
    let value = value.unwrap_or_else(|| default.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
