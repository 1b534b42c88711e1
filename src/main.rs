use std::{process, sync::Arc};

use courtwatch::{
    cache::{CacheConfig, QueryCache},
    config,
    error::AppError,
    infra::{error::InfraError, telemetry},
    realtime::{
        InvalidationMap, InvalidationPipeline, PhoenixConfig, PhoenixFeed, RealtimeConfig,
        SubscriptionManager,
    },
};
use serde_json::json;
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
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
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Listen(Box::<config::ListenArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Listen(_) => run_listen(settings).await,
        config::Command::CheckMap(args) => run_check_map(settings, args),
    }
}

async fn run_listen(settings: config::Settings) -> Result<(), AppError> {
    if settings.realtime.endpoint.is_none() {
        return Err(InfraError::configuration(
            "realtime.url is required to listen (set COURTWATCH__REALTIME__URL or --realtime-url)",
        )
        .into());
    }

    let realtime_config = RealtimeConfig::from(&settings);
    let map = settings.invalidation_map();
    let unmapped = map.unmapped(&realtime_config.watched_tables);
    if !unmapped.is_empty() {
        warn!(
            tables = ?unmapped,
            "Watched tables without mapped query keys; their changes invalidate nothing"
        );
    }

    let cache = Arc::new(QueryCache::new(CacheConfig::from(&settings.cache)));
    let feed = Arc::new(PhoenixFeed::new(PhoenixConfig::from_settings(
        &settings.realtime,
    )?));
    let pipeline = Arc::new(InvalidationPipeline::new(
        &realtime_config,
        map,
        cache.clone(),
    ));
    let manager = SubscriptionManager::new(realtime_config, feed, pipeline);

    let gc_handle = {
        let cache = Arc::clone(&cache);
        let gc_time = cache.config().gc_time();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc_time);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                let evicted = cache.collect_garbage();
                debug!(evicted, remaining = cache.len(), "Query cache GC pass");
            }
        })
    };

    manager.start();
    info!("courtwatch listening for database changes");

    let shutdown = tokio::signal::ctrl_c().await;
    manager.stop();
    gc_handle.abort();

    shutdown.map_err(|err| InfraError::io("waiting for shutdown signal", err))?;
    info!("courtwatch stopped");
    Ok(())
}

fn run_check_map(settings: config::Settings, args: config::CheckMapArgs) -> Result<(), AppError> {
    let map: InvalidationMap = settings.invalidation_map();
    let watched = &settings.realtime.tables;

    if args.json {
        let entries: serde_json::Map<String, serde_json::Value> = watched
            .iter()
            .map(|table| (table.clone(), json!(map.resolve(table))))
            .collect();
        let rendered = serde_json::to_string_pretty(&entries)
            .map_err(|err| AppError::unexpected(format!("failed to render map: {err}")))?;
        println!("{rendered}");
    } else {
        for table in watched {
            let keys = map.resolve(table);
            if keys.is_empty() {
                println!("{table}: <unmapped>");
                continue;
            }
            let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
            println!("{table}: {}", rendered.join(" "));
        }
    }

    map.ensure_covers(watched)?;
    Ok(())
}
