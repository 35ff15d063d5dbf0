//! Provisioning worker
//!
//! Drains the job queue and advances reservations through their steps.
//!
//! This binary:
//! - Loads configuration from the environment (and `.env`)
//! - Selects the queue backend: in-process, `PostgreSQL` or Redpanda
//! - Applies database migrations and sweeps abandoned tasks for the `PostgreSQL` queue
//! - Registers every job type and runs the dequeue loops until Ctrl+C
//!
//! # Usage
//!
//! ```bash
//! WORKER_QUEUE=postgres DATABASE_URL=postgres://localhost/provisioning \
//!     cargo run -p provisioning-worker
//! ```

mod config;

use anyhow::Context;
use config::{Config, DatabaseConfig, LogFormat, LoggingConfig, QueueKind};
use provisioning_core::environment::SystemClock;
use provisioning_core::{JobQueue, PubkeyStore, ReservationStore, TaskRegistry};
use provisioning_jobs::{JobEnvironment, register_jobs};
use provisioning_postgres::{
    PostgresJobQueue, PostgresPubkeyStore, PostgresQueueConfig, PostgresReservationStore,
};
use provisioning_runtime::metrics::MetricsServer;
use provisioning_runtime::{Backoff, RetryPolicy, StepTracker, Worker, retry_with_backoff};
use provisioning_testing::{
    InMemoryJobQueue, InMemoryPubkeyStore, InMemoryReservationStore, StubClouds,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Queue and stores the worker runs against.
struct Backend {
    queue: Arc<dyn JobQueue>,
    reservations: Arc<dyn ReservationStore>,
    pubkeys: Arc<dyn PubkeyStore>,
    sweep: Option<PostgresJobQueue>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config.logging);
    tracing::info!(
        queue = ?config.queue,
        concurrency = config.worker.concurrency,
        "Starting provisioning worker"
    );

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("cannot start metrics exporter")?;
    }

    let shutdown = CancellationToken::new();
    let backend = open_backend(&config).await?;
    let sweeper = backend
        .sweep
        .map(|queue| spawn_sweep(queue, config.worker.heartbeat, shutdown.clone()));

    tracing::warn!("Cloud clients are simulated, no instances are launched");
    let steps = StepTracker::new(backend.reservations);
    let environment =
        JobEnvironment::new(steps.clone(), backend.pubkeys, Arc::new(StubClouds::new()));
    let mut registry = TaskRegistry::new();
    register_jobs(&mut registry, &environment);

    let handle = Worker::new(backend.queue, registry, steps, config.worker_config())
        .start(shutdown.clone());
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;

    tracing::info!("Shutting down gracefully...");
    handle.stop().await;
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "Sweep task terminated abnormally");
        }
    }
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

async fn open_backend(config: &Config) -> anyhow::Result<Backend> {
    match config.queue {
        QueueKind::Memory => {
            tracing::warn!("Using the in-process queue, state is lost on exit");
            Ok(Backend {
                queue: Arc::new(InMemoryJobQueue::with_poll_interval(config.worker.poll_interval)),
                reservations: Arc::new(InMemoryReservationStore::new(SystemClock)),
                pubkeys: Arc::new(InMemoryPubkeyStore::new()),
                sweep: None,
            })
        }
        QueueKind::Postgres => {
            let pool = connect_database(&config.database).await?;
            let queue = PostgresJobQueue::new(
                pool.clone(),
                PostgresQueueConfig::default()
                    .with_poll_interval(config.worker.poll_interval)
                    .with_lease(config.worker.heartbeat, config.worker.max_beats),
            );
            Ok(Backend {
                queue: Arc::new(queue.clone()),
                reservations: Arc::new(PostgresReservationStore::new(pool.clone())),
                pubkeys: Arc::new(PostgresPubkeyStore::new(pool)),
                sweep: Some(queue),
            })
        }
        QueueKind::Redpanda => {
            let queue = redpanda_queue(config)?;
            let pool = connect_database(&config.database).await?;
            Ok(Backend {
                queue,
                reservations: Arc::new(PostgresReservationStore::new(pool.clone())),
                pubkeys: Arc::new(PostgresPubkeyStore::new(pool)),
                sweep: None,
            })
        }
    }
}

async fn connect_database(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let policy = RetryPolicy::builder()
        .max_attempts(5)
        .backoff(Backoff::Exponential)
        .unit(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();
    let pool = retry_with_backoff(policy, || {
        provisioning_postgres::connect(&config.url, config.max_connections)
    })
    .await
    .context("cannot connect to database")?;
    provisioning_postgres::migrate(&pool)
        .await
        .context("cannot apply database migrations")?;
    Ok(pool)
}

#[cfg(feature = "redpanda")]
fn redpanda_queue(config: &Config) -> anyhow::Result<Arc<dyn JobQueue>> {
    let queue = provisioning_redpanda::RedpandaJobQueue::builder()
        .brokers(config.redpanda.brokers.clone())
        .topic(config.redpanda.topic.clone())
        .consumer_group(config.redpanda.consumer_group.clone())
        .poll_interval(config.worker.poll_interval)
        .max_poll_interval(
            config.worker.timeout + config.worker.cancel_grace + Duration::from_secs(60),
        )
        .build()
        .context("cannot create redpanda queue")?;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redpanda"))]
fn redpanda_queue(_config: &Config) -> anyhow::Result<Arc<dyn JobQueue>> {
    anyhow::bail!("the worker was built without the redpanda feature")
}

/// Periodically fail tasks abandoned after their last allowed delivery.
fn spawn_sweep(
    queue: PostgresJobQueue,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => match queue.reclaim_abandoned().await {
                    Ok(0) => {}
                    Ok(failed) => tracing::warn!(failed, "Failed abandoned tasks"),
                    Err(e) => tracing::error!(error = %e, "Abandoned task sweep failed"),
                },
            }
        }
    })
}
