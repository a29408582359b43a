//! Outbox relay: drains the Postgres outbox to the Redis broker until Ctrl-C.

pub mod retention;

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use logistics_infra::{PostgresOutboxStore, RedisStreamsBroker, RelayConfig};
use logistics_outbox::OutboxPublisher;

pub use retention::{purge_expired, RetentionHandle};

const MAX_DB_CONNECTIONS: u32 = 5;
const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the retention sweep runs.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Wire the store and broker, run the publisher and stop it on Ctrl-C.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS)
        .acquire_timeout(DB_ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;

    let store = PostgresOutboxStore::new(pool);
    store
        .migrate()
        .await
        .context("failed to create outbox schema")?;

    let broker = RedisStreamsBroker::new(&config.redis_url, Some(config.stream_prefix.clone()))
        .context("invalid REDIS_URL")?
        .with_max_len(config.stream_max_len);

    let publisher_config = config.publisher_config();
    info!(
        service = %config.service_name,
        exchange = %config.exchange,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        visibility_timeout_secs = config.visibility_timeout.as_secs(),
        stream_max_len = ?config.stream_max_len,
        max_attempts = config.max_attempts,
        "starting outbox relay"
    );

    let publisher = OutboxPublisher::new(store.clone(), broker, publisher_config).spawn();
    let retention = config
        .retention
        .map(|retention| retention::spawn(store, retention, RETENTION_SWEEP_INTERVAL));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    if let Some(retention) = retention {
        retention.shutdown().await;
    }
    let stats = publisher.stats();
    publisher.shutdown().await;

    if stats.broker_outages > 0 || stats.store_errors > 0 {
        warn!(
            broker_outages = stats.broker_outages,
            store_errors = stats.store_errors,
            "relay saw errors during its lifetime"
        );
    }
    info!(
        cycles = stats.cycles,
        published = stats.published,
        failed = stats.failed,
        released = stats.released,
        requeued = stats.requeued,
        "outbox relay stopped"
    );
    Ok(())
}
