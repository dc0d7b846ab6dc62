use std::{process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use tessera::{
    application::{
        error::AppError,
        jobs::{RequeryWorkerContext, process_requery_job},
        repos::{FragmentStore, RequeryQueue},
    },
    cache::{
        CacheConfig, ClearTarget, ConservativeResolver, ExpirySweeper, InvalidationEngine,
        InvalidationPass, RequeryCoordinator,
    },
    config,
    domain::types::{EntityType, JobType},
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Worker(Box::<config::WorkerArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Migrate(_) => run_migrate(&settings).await,
        config::Command::Sweep(args) => run_sweep(&settings, args).await,
        config::Command::Purge(args) => run_purge(&settings, args).await,
        config::Command::Invalidate(args) => run_invalidate(&settings, args).await,
        config::Command::Stats(args) => run_stats(&settings, args).await,
        config::Command::Worker(_) => run_worker(&settings).await,
    }
}

async fn connect(settings: &config::Settings) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool =
        PostgresRepositories::connect(database_url, settings.database.max_connections.get())
            .await
            .map_err(InfraError::from)?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

fn build_engine(
    repositories: &Arc<PostgresRepositories>,
    cache: CacheConfig,
) -> InvalidationEngine<PostgresRepositories> {
    let queue: Arc<dyn RequeryQueue> = repositories.clone();
    InvalidationEngine::new(
        repositories.clone(),
        Arc::new(cache),
        RequeryCoordinator::new(queue),
        Arc::new(ConservativeResolver),
    )
}

async fn run_migrate(settings: &config::Settings) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    PostgresRepositories::run_migrations(repositories.pool()).await?;
    Ok(())
}

async fn run_sweep(settings: &config::Settings, args: config::SweepArgs) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    let sweeper = ExpirySweeper::new(repositories, settings.cache.sweep_throttle);

    let deleted = if args.force {
        sweeper.sweep_now().await?
    } else {
        sweeper.sweep_if_due(&mut InvalidationPass::new()).await?
    };

    info!(deleted, forced = args.force, "Sweep command finished");
    Ok(())
}

async fn run_purge(settings: &config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    let engine = build_engine(&repositories, CacheConfig::from(&settings.cache));

    let target = if args.entry_ids.is_empty() {
        ClearTarget::All
    } else {
        ClearTarget::Entries(args.entry_ids)
    };
    let deleted = engine
        .on_explicit_ids(&mut InvalidationPass::new(), target)
        .await?;

    info!(deleted, "Purge command finished");
    Ok(())
}

async fn run_invalidate(
    settings: &config::Settings,
    args: config::InvalidateArgs,
) -> Result<(), AppError> {
    if args.entity_ids.is_empty() && args.entity_types.is_empty() {
        return Err(AppError::validation(
            "at least one --entity-id or --entity-type is required",
        ));
    }

    let repositories = connect(settings).await?;
    let mut cache = CacheConfig::from(&settings.cache);
    if args.no_requery {
        cache.query_caching_enabled = false;
    }
    let engine = build_engine(&repositories, cache);

    let mut pass = InvalidationPass::new();
    let mut deleted = 0;
    for handle in &args.entity_types {
        deleted += engine
            .on_entity_type_changed(&mut pass, &EntityType::from(handle.as_str()))
            .await?;
    }
    deleted += engine.on_entities_changed(&mut pass, &args.entity_ids).await?;

    info!(
        deleted,
        entity_count = args.entity_ids.len(),
        type_count = args.entity_types.len(),
        "Invalidate command finished"
    );
    Ok(())
}

async fn run_stats(settings: &config::Settings, args: config::StatsArgs) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    let stats = repositories.stats(OffsetDateTime::now_utc()).await?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&stats)
            .map_err(|err| AppError::unexpected(err.to_string()))?;
        println!("{rendered}");
    } else {
        println!("live entries:    {}", stats.live_entries);
        println!("expired entries: {}", stats.expired_entries);
        println!("entity refs:     {}", stats.entity_refs);
        println!("query refs:      {}", stats.query_refs);
    }
    Ok(())
}

async fn run_worker(settings: &config::Settings) -> Result<(), AppError> {
    let repositories = connect(settings).await?;
    let cache = CacheConfig::from(&settings.cache);
    let throttle = cache.sweep_throttle;
    let engine = Arc::new(build_engine(&repositories, cache));

    let sweep_handle = spawn_sweep_loop(
        ExpirySweeper::new(repositories.clone(), throttle),
        settings.jobs.sweep_interval,
    );

    let storage = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::RequeryStaleCaches.as_str()),
    );
    let requery_worker = WorkerBuilder::new("requery-worker")
        .concurrency(settings.jobs.requery_concurrency.get() as usize)
        .data(RequeryWorkerContext::new(engine))
        .backend(storage)
        .build_fn(process_requery_job::<PostgresRepositories>);

    info!(
        requery_concurrency = settings.jobs.requery_concurrency.get(),
        sweep_interval_secs = settings.jobs.sweep_interval.as_secs(),
        "Worker started"
    );

    let result = Monitor::new().register(requery_worker).run().await;
    sweep_handle.abort();
    result.map_err(|err| AppError::from(InfraError::worker(err.to_string())))
}

fn spawn_sweep_loop(
    sweeper: ExpirySweeper<PostgresRepositories>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            // A fresh pass per tick; the store-level claim does the throttling.
            if let Err(err) = sweeper.sweep_if_due(&mut InvalidationPass::new()).await {
                warn!(error = %err, "Periodic sweep failed");
            }
        }
    })
}
