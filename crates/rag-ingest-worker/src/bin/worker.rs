//! Ingest worker binary
//!
//! Run with: cargo run -p rag-ingest-worker -- --config worker.toml

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rag_ingest_worker::{
    config::WorkerConfig,
    ingestion::{EventFilter, ExternalParser},
    processing::{ConsumptionLoop, JobPipeline, PipelineSettings},
    providers::{ParserService, RedisRecordStore, WebDavFileStore},
    queue::AmqpConsumer,
    server::{self, HealthState},
    storage::JobStore,
};

/// Extra time after the drain grace period for closing the broker connection
const CLOSE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "rag-ingest-worker", version, about)]
struct Args {
    /// TOML configuration file; environment variables override its values
    #[arg(long, env = "RAG_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rag_ingest_worker=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM ({}), only Ctrl+C stops the worker", e);
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl+C");
}

fn loop_result(
    joined: Result<rag_ingest_worker::Result<()>, JoinError>,
) -> anyhow::Result<()> {
    joined
        .context("consumption loop panicked")?
        .context("consumption loop failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = WorkerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if args.check_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Queue: {} (prefetch {})", config.queue.queue, config.queue.prefetch);
    tracing::info!("  - File store: {} as {}", config.file_store.url, config.file_store.user);
    tracing::info!("  - Parser: {}", config.parser.url);
    tracing::info!(
        "  - Workers: {}, max attempts {}",
        config.worker.concurrency,
        config.worker.max_attempts
    );

    let record_store = RedisRecordStore::connect(
        &config.record_store.url,
        config.record_store.timeout(),
    )
    .await
    .context("connecting to Redis")?;
    let jobs = JobStore::from_config(Arc::new(record_store), &config.record_store);

    let files = Arc::new(WebDavFileStore::new(&config.file_store)?);
    let parser = Arc::new(ExternalParser::new(&config.parser)?);
    match parser.health_check().await {
        Ok(()) => tracing::info!("Parser service is reachable"),
        Err(e) => tracing::warn!("Parser service not reachable yet: {}", e),
    }

    let pipeline = Arc::new(JobPipeline::new(
        jobs,
        files,
        parser,
        EventFilter::with_extra_media_types(&config.filter.extra_media_types),
        PipelineSettings::from_config(&config),
    ));

    let source = Arc::new(
        AmqpConsumer::connect(&config.queue)
            .await
            .context("connecting to the message broker")?,
    );
    let consumer = Arc::new(ConsumptionLoop::new(pipeline, source, &config.worker));
    let cancel = CancellationToken::new();

    let health_task = config.health.bind.clone().map(|bind| {
        let state = HealthState::for_loop(&consumer);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, state, cancel).await {
                tracing::error!("Health server stopped: {}", e);
            }
        })
    });

    let mut loop_task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let finished_early = tokio::select! {
        joined = &mut loop_task => Some(joined),
        _ = shutdown_signal() => None,
    };

    cancel.cancel();
    let result = match finished_early {
        Some(joined) => {
            tracing::warn!("Consumption loop ended without a shutdown signal");
            loop_result(joined)
        }
        None => {
            let deadline = config.worker.shutdown_grace() + CLOSE_MARGIN;
            match tokio::time::timeout(deadline, &mut loop_task).await {
                Ok(joined) => loop_result(joined),
                Err(_) => {
                    tracing::warn!("Consumption loop did not stop within {:?}", deadline);
                    loop_task.abort();
                    Ok(())
                }
            }
        }
    };

    if let Some(task) = health_task {
        let _ = task.await;
    }

    tracing::info!("Worker stopped");
    result
}
