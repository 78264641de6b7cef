use std::{process, sync::Arc};

use cachescope::{
    cache::{CacheConfig, CacheTrigger, EntryLimitedStore, TagSource},
    config,
    infra::{
        db::{self, PostgresBackend},
        error::InfraError,
        telemetry,
    },
};
use sqlx::PgPool;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "cachescope failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "cachescope failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let pool = connect(&settings).await?;
    if matches!(cli_args.command, config::Command::Migrate) {
        db::run_migrations(&pool).await?;
        info!("Migrations applied");
        return Ok(());
    }

    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(EntryLimitedStore::new(
        Arc::new(PostgresBackend::new(pool)),
        &cache_config,
    ));

    match cli_args.command {
        config::Command::Migrate => {}
        config::Command::Stats => {
            let count = store.count().await?;
            println!("entries: {count}");
            println!("max_entries: {}", cache_config.max_entries);
        }
        config::Command::Flush => {
            store.flush().await?;
        }
        config::Command::FlushTag(args) => {
            let tags: Vec<String> = args
                .tags
                .into_iter()
                .map(|tag| TagSource::from(tag).into_tag())
                .collect();
            let removed = store.flush_by_tags(&tags).await?;
            println!("removed: {removed}");
        }
        config::Command::FlushRecord(args) => {
            let trigger = CacheTrigger::new(store);
            let removed = trigger.record_changed(&args.table, args.uid).await?;
            println!("removed: {removed}");
        }
        config::Command::Gc => {
            let removed = store.collect_garbage().await?;
            println!("removed: {removed}");
        }
    }

    Ok(())
}

async fn connect(settings: &config::Settings) -> Result<PgPool, InfraError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = db::connect(database_url, settings.database.max_connections.get()).await?;
    db::health_check(&pool).await?;
    Ok(pool)
}
