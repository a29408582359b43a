//! Outbox publisher: polls the store and relays rows to the broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use logistics_core::OutboxEventId;

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind, PublishOptions};
use crate::store::OutboxStore;
use crate::types::{OutboxEvent, RetryPolicy};
use crate::DEFAULT_EXCHANGE;

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    /// Name for logging
    pub name: String,
    /// Time between poll cycles
    pub poll_interval: Duration,
    /// Maximum PENDING rows handled per cycle
    pub batch_size: usize,
    /// Upper bound on a single publish
    pub publish_timeout: Duration,
    /// Age after which a PROCESSING row is considered abandoned
    pub visibility_timeout: Duration,
    /// Exchanges declared (durable, topic) on every connect
    pub exchanges: Vec<String>,
    pub retry_policy: RetryPolicy,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-publisher".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            publish_timeout: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(60),
            exchanges: vec![DEFAULT_EXCHANGE.to_string()],
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl OutboxPublisherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_exchanges<I, T>(mut self, exchanges: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.exchanges = exchanges.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// What happened to one row during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Published and marked COMPLETED
    Published,
    /// Publish failed; the row is FAILED
    Failed {
        error: String,
        attempts: u32,
        will_retry: bool,
    },
    /// Broker connection dropped during the publish; the row is PENDING again
    /// with its retry count untouched
    Released { error: String },
    /// Claimed by another publisher first, or the claim was reclaimed before
    /// the outcome could be recorded
    Skipped,
    /// A store update failed; the row keeps its previous state
    StoreError(String),
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Connecting failed, or the connection dropped mid-batch
    pub broker_unavailable: bool,
    pub reclaimed: usize,
    pub requeued: usize,
    pub published: usize,
    pub failed: usize,
    pub released: usize,
    pub skipped: usize,
    pub store_errors: usize,
    pub outcomes: Vec<(OutboxEventId, EventOutcome)>,
}

impl CycleReport {
    fn push(&mut self, id: OutboxEventId, outcome: EventOutcome) {
        match &outcome {
            EventOutcome::Published => self.published += 1,
            EventOutcome::Failed { .. } => self.failed += 1,
            EventOutcome::Released { .. } => self.released += 1,
            EventOutcome::Skipped => self.skipped += 1,
            EventOutcome::StoreError(_) => self.store_errors += 1,
        }
        self.outcomes.push((id, outcome));
    }

    pub fn outcome(&self, id: OutboxEventId) -> Option<&EventOutcome> {
        self.outcomes.iter().find(|(i, _)| *i == id).map(|(_, o)| o)
    }
}

/// Publisher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PublisherStats {
    pub cycles: u64,
    pub published: u64,
    pub failed: u64,
    pub released: u64,
    pub skipped: u64,
    pub reclaimed: u64,
    pub requeued: u64,
    pub broker_outages: u64,
    pub store_errors: u64,
}

impl PublisherStats {
    fn record(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.published += report.published as u64;
        self.failed += report.failed as u64;
        self.released += report.released as u64;
        self.skipped += report.skipped as u64;
        self.reclaimed += report.reclaimed as u64;
        self.requeued += report.requeued as u64;
        self.store_errors += report.store_errors as u64;
        if report.broker_unavailable {
            self.broker_outages += 1;
        }
    }
}

/// Handle to control a running publisher.
#[derive(Debug)]
pub struct OutboxPublisherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl OutboxPublisherHandle {
    /// Stop polling, wait for the in-flight cycle, and close the broker channel.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "outbox publisher task panicked");
        }
    }

    pub fn stats(&self) -> PublisherStats {
        lock_stats(&self.stats).clone()
    }
}

/// Background outbox publisher.
///
/// Each cycle claims PENDING rows one at a time, publishes them to the
/// row's exchange under its routing key, and records the outcome on the row.
/// A failing row never blocks the rest of the batch. A dropped connection
/// ends the batch and hands the in-flight row back as PENDING.
pub struct OutboxPublisher<S: OutboxStore, B: BrokerChannel> {
    store: S,
    broker: B,
    config: OutboxPublisherConfig,
    stats: Arc<Mutex<PublisherStats>>,
}

impl<S: OutboxStore, B: BrokerChannel> OutboxPublisher<S, B> {
    pub fn new(store: S, broker: B, config: OutboxPublisherConfig) -> Self {
        Self {
            store,
            broker,
            config,
            stats: Arc::new(Mutex::new(PublisherStats::default())),
        }
    }

    pub fn config(&self) -> &OutboxPublisherConfig {
        &self.config
    }

    pub fn stats(&self) -> PublisherStats {
        lock_stats(&self.stats).clone()
    }

    /// Run one poll cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        if let Err(e) = self.ensure_connected().await {
            error!(
                publisher = %self.config.name,
                error = %e,
                "broker unavailable, outbox rows left pending"
            );
            report.broker_unavailable = true;
            self.record(&report);
            return report;
        }

        self.reclaim_stale(&mut report).await;
        self.requeue_retryable(&mut report).await;

        let batch = match self.store.find_pending_batch(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(publisher = %self.config.name, error = %e, "failed to fetch pending outbox events");
                report.store_errors += 1;
                self.record(&report);
                return report;
            }
        };

        for event in &batch {
            let (outcome, connection_lost) = self.process_event(event).await;
            report.push(event.id, outcome);
            if connection_lost {
                warn!(
                    publisher = %self.config.name,
                    remaining = batch.len() - report.outcomes.len(),
                    "broker connection lost, stopping batch"
                );
                report.broker_unavailable = true;
                break;
            }
        }

        if batch.is_empty() {
            debug!(publisher = %self.config.name, "no pending outbox events");
        } else {
            info!(
                publisher = %self.config.name,
                published = report.published,
                failed = report.failed,
                released = report.released,
                skipped = report.skipped,
                "outbox cycle finished"
            );
        }

        self.record(&report);
        report
    }

    /// Spawn the poll loop on the tokio runtime.
    ///
    /// Cycles never overlap: a cycle that outlasts the interval delays the
    /// next tick.
    pub fn spawn(self) -> OutboxPublisherHandle
    where
        S: 'static,
        B: 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(publisher_loop(self, shutdown_rx));

        OutboxPublisherHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.broker.is_connected() {
            return Ok(());
        }

        self.broker.connect().await?;
        for exchange in &self.config.exchanges {
            if let Err(e) = self
                .broker
                .declare_exchange(exchange, ExchangeKind::Topic, true)
                .await
            {
                // Force a full reconnect (and redeclare) next tick.
                let _ = self.broker.close().await;
                return Err(e);
            }
        }

        info!(
            publisher = %self.config.name,
            exchanges = ?self.config.exchanges,
            "broker connected"
        );
        Ok(())
    }

    async fn reclaim_stale(&self, report: &mut CycleReport) {
        let cutoff = chrono::Duration::from_std(self.config.visibility_timeout)
            .ok()
            .and_then(|visibility| Utc::now().checked_sub_signed(visibility))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self.store.reclaim_stale(cutoff).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    warn!(
                        publisher = %self.config.name,
                        count = ids.len(),
                        "reclaimed stale processing outbox events"
                    );
                }
                report.reclaimed = ids.len();
            }
            Err(e) => {
                error!(publisher = %self.config.name, error = %e, "failed to reclaim stale outbox events");
                report.store_errors += 1;
            }
        }
    }

    async fn requeue_retryable(&self, report: &mut CycleReport) {
        let retryable = match self
            .store
            .find_retryable(
                Utc::now(),
                self.config.retry_policy.max_attempts,
                self.config.batch_size,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(publisher = %self.config.name, error = %e, "failed to fetch retryable outbox events");
                report.store_errors += 1;
                return;
            }
        };

        for event in retryable {
            match self.store.requeue(event.id).await {
                Ok(true) => {
                    debug!(
                        publisher = %self.config.name,
                        event_id = %event.id,
                        retry_count = event.retry_count,
                        "requeued failed outbox event"
                    );
                    report.requeued += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(publisher = %self.config.name, event_id = %event.id, error = %e, "failed to requeue outbox event");
                    report.store_errors += 1;
                }
            }
        }
    }

    /// Claim, publish and settle one row. The flag reports a lost broker
    /// connection.
    async fn process_event(&self, event: &OutboxEvent) -> (EventOutcome, bool) {
        match self.store.mark_as_processing(event.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    "outbox event claimed elsewhere, skipping"
                );
                return (EventOutcome::Skipped, false);
            }
            Err(e) => {
                error!(publisher = %self.config.name, event_id = %event.id, error = %e, "failed to claim outbox event");
                return (EventOutcome::StoreError(e.to_string()), false);
            }
        }

        match self.publish(event).await {
            Ok(()) => (self.record_success(event).await, false),
            Err(e) if e.is_connection_loss() => (self.release(event, &e).await, true),
            Err(e) => (self.record_failure(event, &e).await, false),
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(&event.event_data)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let options = PublishOptions::persistent().with_message_id(event.id.to_string());

        let publish = self
            .broker
            .publish(&event.exchange, &event.routing_key, &payload, &options);

        match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.config.publish_timeout)),
        }
    }

    async fn record_success(&self, event: &OutboxEvent) -> EventOutcome {
        match self.store.complete_claimed(event.id).await {
            Ok(true) => {
                debug!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    routing_key = %event.routing_key,
                    "published outbox event"
                );
            }
            Ok(false) => {
                // The broker has the message; the row belongs to whoever holds it now.
                warn!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    "published outbox event after its claim was reclaimed"
                );
            }
            Err(e) => {
                // Row stays PROCESSING and is reclaimed after the visibility timeout.
                error!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    error = %e,
                    "published outbox event but failed to mark it completed"
                );
                return EventOutcome::StoreError(e.to_string());
            }
        }
        EventOutcome::Published
    }

    async fn record_failure(&self, event: &OutboxEvent, failure: &BrokerError) -> EventOutcome {
        let message = failure.to_string();
        let policy = &self.config.retry_policy;

        // Scheduled from the batch snapshot; the stored count decides `will_retry`.
        let expected = event.retry_count.saturating_add(1);
        let retry_at = policy.should_retry(expected).then(|| {
            let delay = policy.delay_for_attempt(expected);
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()
        });

        let attempts = match self.store.fail_claimed(event.id, &message, retry_at).await {
            Ok(Some(attempts)) => attempts,
            Ok(None) => {
                warn!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    error = %failure,
                    "outbox publish failed after its claim was reclaimed"
                );
                return EventOutcome::Skipped;
            }
            Err(e) => {
                error!(publisher = %self.config.name, event_id = %event.id, error = %e, "failed to mark outbox event failed");
                return EventOutcome::StoreError(e.to_string());
            }
        };

        let will_retry = policy.should_retry(attempts);
        if will_retry {
            warn!(
                publisher = %self.config.name,
                event_id = %event.id,
                event_type = %event.event_type,
                attempts,
                retry_at = ?retry_at,
                error = %failure,
                "outbox publish failed, retry scheduled"
            );
        } else {
            error!(
                publisher = %self.config.name,
                event_id = %event.id,
                event_type = %event.event_type,
                attempts,
                error = %failure,
                "outbox publish failed, retries exhausted"
            );
        }

        EventOutcome::Failed {
            error: message,
            attempts,
            will_retry,
        }
    }

    async fn release(&self, event: &OutboxEvent, failure: &BrokerError) -> EventOutcome {
        match self.store.release_claimed(event.id).await {
            Ok(_) => {
                warn!(
                    publisher = %self.config.name,
                    event_id = %event.id,
                    error = %failure,
                    "broker connection lost during publish, outbox event left pending"
                );
                EventOutcome::Released {
                    error: failure.to_string(),
                }
            }
            Err(e) => {
                error!(publisher = %self.config.name, event_id = %event.id, error = %e, "failed to release outbox event");
                EventOutcome::StoreError(e.to_string())
            }
        }
    }

    fn record(&self, report: &CycleReport) {
        lock_stats(&self.stats).record(report);
    }
}

fn lock_stats(stats: &Mutex<PublisherStats>) -> std::sync::MutexGuard<'_, PublisherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn publisher_loop<S, B>(publisher: OutboxPublisher<S, B>, mut shutdown: watch::Receiver<bool>)
where
    S: OutboxStore,
    B: BrokerChannel,
{
    let name = publisher.config.name.clone();
    info!(
        publisher = %name,
        poll_interval_ms = publisher.config.poll_interval.as_millis() as u64,
        batch_size = publisher.config.batch_size,
        "outbox publisher started"
    );

    let mut interval = tokio::time::interval(publisher.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // A dropped handle stops the loop too.
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                publisher.run_cycle().await;
            }
        }
    }

    if let Err(e) = publisher.broker.close().await {
        warn!(publisher = %name, error = %e, "failed to close broker channel");
    }
    info!(publisher = %name, "outbox publisher stopped");
}
