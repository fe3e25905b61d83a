//! # News Ingest
//!
//! Crawls configured news sites and turns what it fetches into a searchable,
//! deduplicated article corpus.
//!
//! ## Architecture
//!
//! Every role is a subcommand of this binary; they talk through NATS subjects,
//! Postgres and Elasticsearch:
//!
//! 1. **serve**: the task engine fetches pages for crawl tasks and publishes
//!    raw fetch events on `raw`
//! 2. **parse**: extracts an article per raw event, fingerprints it and
//!    publishes it on `parsed`
//! 3. **sink**: upserts parsed records into the canonical `news` table by
//!    fingerprint
//! 4. **sync**: replicates changed rows into the search index
//!
//! `backfill` fingerprints legacy rows, `migrate` applies the schema, and the
//! remaining subcommands are operator tools over the same stores.
//!
//! ## Usage
//!
//! ```sh
//! news_ingest migrate
//! news_ingest serve --schedule
//! ```

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod backfill;
mod broker;
mod cli;
mod engine;
mod error;
mod fetcher;
mod fingerprint;
mod models;
mod pipeline;
mod retry;
mod scrapers;
mod search;
mod store;
mod sync;
mod utils;

use backfill::Backfill;
use broker::NatsBroker;
use cli::{Cli, Command, Settings};
use engine::{EngineConfig, EngineParts, SubmitRequest, TaskEngine};
use fetcher::HttpFetcher;
use pipeline::{ParseStage, SinkStage, Stage, TapStage, run_stage};
use retry::Backoff;
use scrapers::ContentRouter;
use search::{ElasticConfig, ElasticIndex, SearchIndex, SearchQuery};
use store::postgres::PgStore;
use store::{NewSource, SourceStore, TaskFilter, TaskStore};
use sync::{SyncConfig, Synchronizer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    let settings = args.settings;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; shutting down");
            }
            shutdown.cancel();
        });
    }

    match args.command {
        Command::Serve { poll_secs, schedule } => serve(&settings, poll_secs, schedule, shutdown).await?,
        Command::Parse => {
            let broker = NatsBroker::connect(&settings.nats_url).await?;
            broker.ensure_topic(&settings.topic_parsed).await?;
            let router = Arc::new(ContentRouter::with_builtin_sources()?);
            let stage = ParseStage::new(
                router,
                Arc::new(broker.clone()),
                settings.topic_parsed.clone(),
                publish_backoff(&settings),
            );
            consume(&broker, &settings.topic_raw, &stage, &shutdown).await?;
            broker.flush().await?;
        }
        Command::Sink => {
            let broker = NatsBroker::connect(&settings.nats_url).await?;
            let store = connect_store(&settings).await?;
            let stage = SinkStage::new(store, publish_backoff(&settings));
            consume(&broker, &settings.topic_parsed, &stage, &shutdown).await?;
        }
        Command::Tap => {
            let broker = NatsBroker::connect(&settings.nats_url).await?;
            let stage = TapStage::new(Arc::new(ContentRouter::with_builtin_sources()?));
            consume(&broker, &settings.topic_raw, &stage, &shutdown).await?;
        }
        Command::Sync { batch_size, idle_secs, error_secs, max_attempts, since } => {
            let store = connect_store(&settings).await?;
            let index = elastic_index(&settings)?;
            index.ensure_index().await?;
            let config = SyncConfig {
                batch_size,
                idle_interval: Duration::from_secs(idle_secs),
                error_interval: Duration::from_secs(error_secs),
                max_attempts,
            };
            let mut synchronizer = Synchronizer::new(store, Arc::new(index), config);
            if let Some(since) = since {
                synchronizer = synchronizer.starting_at(since);
            }
            synchronizer.run(shutdown).await;
        }
        Command::Backfill { batch_size } => {
            let store = connect_store(&settings).await?;
            let report = Backfill::new(store, batch_size).run().await?;
            println!("{} rows fingerprinted in {} batches", report.updated, report.batches);
        }
        Command::Migrate => {
            let store = connect_store(&settings).await?;
            store.migrate().await?;
            info!("Schema applied");
        }
        Command::Submit { source_id, mode, since, max_pages } => {
            let store = connect_store(&settings).await?;
            let request = SubmitRequest { source_id, mode, since, max_pages };
            let task = engine::submit_task(store.as_ref(), store.as_ref(), request).await?;
            print_json(&task)?;
        }
        Command::Stop { task_id, reason } => {
            let store = connect_store(&settings).await?;
            let task = engine::stop_task(store.as_ref(), &task_id, &reason).await?;
            print_json(&task)?;
        }
        Command::Status { task_id } => {
            let store = connect_store(&settings).await?;
            let task = store
                .get_task(&task_id)
                .await?
                .ok_or(error::IngestError::NotFound(task_id))?;
            print_json(&task)?;
        }
        Command::ListTasks { source_id, status, limit } => {
            let store = connect_store(&settings).await?;
            let filter = TaskFilter { source_id, status, limit };
            print_json(&store.list_tasks(&filter).await?)?;
        }
        Command::ListSources => {
            let store = connect_store(&settings).await?;
            print_json(&store.list_sources().await?)?;
        }
        Command::AddSource {
            name,
            code,
            base_url,
            language,
            category,
            interval_minutes,
            max_concurrency,
            disabled,
        } => {
            let router = ContentRouter::with_builtin_sources()?;
            if !router.supports(&code) {
                warn!(source_code = %code, "No parser is registered for this code; its pages will be skipped");
            }
            let store = connect_store(&settings).await?;
            let source = NewSource {
                name,
                code,
                base_url,
                language,
                category,
                enabled: !disabled,
                crawl_interval_minutes: interval_minutes,
                max_concurrency,
            };
            print_json(&store.create_source(&source).await?)?;
        }
        Command::EnableSource { id } => set_enabled(&settings, id, true).await?,
        Command::DisableSource { id } => set_enabled(&settings, id, false).await?,
        Command::Search { query, source_code, from, size } => {
            let index = elastic_index(&settings)?;
            let mut query = SearchQuery::new(&query)?;
            query.source_code = source_code;
            query.from = from;
            query.size = size;
            let results = index.search(&query).await?;
            info!(total = results.total, returned = results.hits.len(), "Search complete");
            for hit in &results.hits {
                print_json(&hit.document)?;
            }
        }
    }

    Ok(())
}

/// Run the task engine until shutdown, starting pending tasks on every poll.
#[instrument(skip(settings, shutdown))]
async fn serve(
    settings: &Settings,
    poll_secs: u64,
    schedule: bool,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let store = connect_store(settings).await?;
    let broker = NatsBroker::connect(&settings.nats_url).await?;
    broker.ensure_topic(&settings.topic_raw).await?;
    let fetcher = HttpFetcher::new(Duration::from_secs(settings.fetch_timeout_secs))?;

    let parts = EngineParts {
        sources: store.clone(),
        tasks: store.clone(),
        canonical: store,
        fetcher: Arc::new(fetcher),
        publisher: Arc::new(broker.clone()),
    };
    let config = EngineConfig {
        topic_raw: settings.topic_raw.clone(),
        snippet_bytes: settings.snippet_bytes,
        default_max_pages: settings.default_max_pages,
        fetch_timeout: Duration::from_secs(settings.fetch_timeout_secs),
        fetch_backoff: publish_backoff(settings),
        global_max_fetches: settings.global_max_fetches,
    };
    let engine = TaskEngine::new(parts, config);
    match engine.fail_orphaned().await {
        Ok(0) => {}
        Ok(failed) => warn!(failed, "Failed running tasks left by an earlier engine"),
        Err(e) => warn!(error = %e, "Could not reconcile running tasks"),
    }
    info!(topic_raw = %settings.topic_raw, "Task engine started");

    let mut poll = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {}
        }
        if schedule {
            match engine.schedule_due(Utc::now()).await {
                Ok(submitted) if !submitted.is_empty() => {
                    info!(submitted = submitted.len(), "Scheduled due sources");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Scheduling failed"),
            }
        }
        match engine.resume_pending(100).await {
            Ok(0) => {}
            Ok(started) => info!(started, "Started pending tasks"),
            Err(e) => warn!(error = %e, "Could not load pending tasks"),
        }
    }

    engine.shutdown().await;
    broker.flush().await?;
    Ok(())
}

/// Drive `stage` from the durable consumer named after it.
async fn consume(
    broker: &NatsBroker,
    topic: &str,
    stage: &dyn Stage,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let mut subscription = broker.subscribe(topic, stage.name()).await?;
    run_stage(stage, &mut subscription, shutdown).await;
    Ok(())
}

async fn connect_store(settings: &Settings) -> Result<Arc<PgStore>, error::IngestError> {
    Ok(Arc::new(
        PgStore::connect(&settings.db_dsn, settings.db_max_connections).await?,
    ))
}

fn elastic_index(settings: &Settings) -> Result<ElasticIndex, error::IngestError> {
    ElasticIndex::new(ElasticConfig {
        address: settings.es_address.clone(),
        username: settings.es_username.clone(),
        password: settings.es_password.clone(),
        index: settings.es_index.clone(),
        timeout: Duration::from_secs(settings.fetch_timeout_secs),
    })
}

fn publish_backoff(settings: &Settings) -> Backoff {
    Backoff::new(settings.fetch_retries, Duration::from_millis(500))
}

async fn set_enabled(settings: &Settings, id: i64, enabled: bool) -> Result<(), Box<dyn Error>> {
    let store = connect_store(settings).await?;
    if !store.set_enabled(id, enabled).await? {
        return Err(error::IngestError::SourceNotFound(id).into());
    }
    info!(source_id = id, enabled, "Source updated");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
