use std::{process, sync::Arc};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::CronStream;
use axum::http::Method;
use renderstash::{
    application::{
        error::AppError,
        jobs::{PruneHistoryContext, process_prune_history_job, prune_history_schedule},
        repos::MetadataLedger,
        request::RequestContext,
    },
    cache::{CacheConfig, CacheOrchestrator, RetentionPolicy, StoreContext},
    config,
    infra::{
        blobs::FsContentStore,
        db::{self, PostgresLedger},
        error::InfraError,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
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
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Prune(_) => run_prune(settings).await,
        config::Command::History(args) => run_history(settings, args).await,
        config::Command::Lookup(args) => run_lookup(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let ledger = init_ledger(&settings).await?;
    ledger.provision().await?;

    let policy = RetentionPolicy::new(settings.retention.window);
    let monitor_handle = spawn_job_monitor(
        PruneHistoryContext {
            ledger: ledger.clone(),
            policy,
        },
        &settings.retention,
    )?;

    info!(
        table = %ledger.table(),
        retention_secs = policy.window().as_secs(),
        sweep_cron = %settings.retention.sweep_cron,
        "renderstash running, press Ctrl-C to stop"
    );

    let result = tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)));

    monitor_handle.abort();
    let _ = monitor_handle.await;
    info!("renderstash stopped");

    result
}

async fn run_prune(settings: config::Settings) -> Result<(), AppError> {
    let ledger = init_ledger(&settings).await?;
    let policy = RetentionPolicy::new(settings.retention.window);

    let removed = policy.sweep(ledger.as_ref()).await?;
    println!("{removed}");
    Ok(())
}

async fn run_history(
    settings: config::Settings,
    args: config::HistoryArgs,
) -> Result<(), AppError> {
    let ledger = init_ledger(&settings).await?;

    let record = ledger
        .find_record(&args.url)
        .await?
        .ok_or_else(|| AppError::validation(format!("no ledger record for `{}`", args.url)))?;

    let rendered = serde_json::to_string_pretty(&record)
        .map_err(|err| AppError::unexpected(format!("failed to encode record: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_lookup(settings: config::Settings, args: config::LookupArgs) -> Result<(), AppError> {
    let ledger = init_ledger(&settings).await?;
    let content = FsContentStore::new(settings.blobs.root()).map_err(InfraError::from)?;

    let orchestrator = CacheOrchestrator::new(
        StoreContext::new(Arc::new(content), ledger),
        CacheConfig::from(&settings),
    );

    let ctx = RequestContext::new(args.url.clone(), Method::GET);
    let Some(cached) = orchestrator.get(&ctx, &args.url).await else {
        println!("miss");
        return Ok(());
    };

    let source = cached.source.as_str();
    let status_code = cached.status_code;
    let content_type = cached.content_type.clone();
    let content_hash = cached.content_hash.clone();
    let body = cached.into_bytes().await?;

    println!(
        "{source} status={status_code} content_type={content_type} hash={content_hash} size={}",
        body.len()
    );
    Ok(())
}

async fn init_ledger(settings: &config::Settings) -> Result<Arc<PostgresLedger>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = db::connect(
        database_url,
        settings.database.max_connections.get(),
        settings.database.acquire_timeout,
    )
    .await
    .map_err(InfraError::from)?;

    let ledger = PostgresLedger::new(
        pool,
        settings.ledger.table.clone(),
        RetentionPolicy::new(settings.retention.window),
    )?;

    Ok(Arc::new(ledger))
}

fn spawn_job_monitor(
    context: PruneHistoryContext,
    retention: &config::RetentionSettings,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let schedule = prune_history_schedule(&retention.sweep_cron)?;

    let prune_history_worker = WorkerBuilder::new("prune-history-worker")
        .data(context)
        .backend(CronStream::new(schedule))
        .build_fn(process_prune_history_job);

    let monitor = Monitor::new().register(prune_history_worker);

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    }))
}
