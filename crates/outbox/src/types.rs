//! Outbox row types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use logistics_core::{DomainEvent, OutboxEventId};

use crate::store::OutboxStoreError;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Written by a command handler, waiting for the next poll cycle
    Pending,
    /// Claimed by a publisher, publish in flight
    Processing,
    /// Published to the broker
    Completed,
    /// Last publish attempt failed (see `error_message`)
    Failed,
}

impl OutboxStatus {
    pub const ALL: [OutboxStatus; 4] = [
        OutboxStatus::Pending,
        OutboxStatus::Processing,
        OutboxStatus::Completed,
        OutboxStatus::Failed,
    ];

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED is the only state nothing ever leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = OutboxStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "COMPLETED" => Ok(OutboxStatus::Completed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(OutboxStoreError::Storage(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

/// One message awaiting (or having completed) delivery to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    /// Domain event name, e.g. "ShipmentCreated"
    pub event_type: String,
    /// Serialized event payload; opaque to the store
    pub event_data: JsonValue,
    pub status: OutboxStatus,
    pub routing_key: String,
    pub exchange: String,
    /// Failed publish attempts so far (never decreases)
    pub retry_count: u32,
    /// Set when the row reaches COMPLETED
    pub processed_at: Option<DateTime<Utc>>,
    /// Reason of the most recent failure
    pub error_message: Option<String>,
    /// Earliest time a FAILED row may be requeued
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Build a fresh PENDING row for `new`.
    pub fn pending(new: NewOutboxEvent) -> Self {
        let now = Utc::now();
        Self {
            id: OutboxEventId::new(),
            event_type: new.event_type,
            event_data: new.event_data,
            status: OutboxStatus::Pending,
            routing_key: new.routing_key,
            exchange: new.exchange,
            retry_count: 0,
            processed_at: None,
            error_message: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// PENDING → PROCESSING. Returns false (and changes nothing) otherwise.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Pending {
            return false;
        }
        self.status = OutboxStatus::Processing;
        self.updated_at = now;
        true
    }

    /// Any non-terminal status → COMPLETED. Already completed rows keep their
    /// original `processed_at`.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        if self.status == OutboxStatus::Completed {
            return;
        }
        self.status = OutboxStatus::Completed;
        self.processed_at = Some(now.max(self.created_at));
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt. Completed rows are left untouched.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.status == OutboxStatus::Completed {
            return;
        }
        self.status = OutboxStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = now;
    }

    /// PROCESSING → FAILED for the current claim: records the error, counts
    /// the attempt and sets the earliest retry time, all at once. Returns the
    /// new retry count, or `None` (changing nothing) if the row is not
    /// PROCESSING anymore.
    pub fn fail_attempt(
        &mut self,
        message: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        if self.status != OutboxStatus::Processing {
            return None;
        }
        self.status = OutboxStatus::Failed;
        self.error_message = Some(message.into());
        self.retry_count = self.retry_count.saturating_add(1);
        self.next_attempt_at = retry_at;
        self.updated_at = now;
        Some(self.retry_count)
    }

    /// PROCESSING → PENDING without counting an attempt.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Processing {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.updated_at = now;
        true
    }

    /// FAILED → PENDING. Returns false (and changes nothing) otherwise.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != OutboxStatus::Failed {
            return false;
        }
        self.status = OutboxStatus::Pending;
        self.next_attempt_at = None;
        self.updated_at = now;
        true
    }

    /// Whether a FAILED row is due for another attempt under `max_attempts`.
    pub fn is_retryable(&self, max_attempts: u32, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Failed
            && self.retry_count < max_attempts
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Input of `OutboxWriter::append`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub event_data: JsonValue,
    pub routing_key: String,
    pub exchange: String,
}

impl NewOutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        event_data: JsonValue,
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            routing_key: routing_key.into(),
            exchange: exchange.into(),
        }
    }

    /// Serialize a domain event into an outbox input addressed to `exchange`.
    pub fn from_domain_event<E: DomainEvent>(
        event: &E,
        exchange: impl Into<String>,
    ) -> Result<Self, OutboxStoreError> {
        let event_data = serde_json::to_value(event).map_err(|e| {
            OutboxStoreError::Serialization(format!(
                "failed to serialize {}: {e}",
                event.event_type()
            ))
        })?;

        Ok(Self::new(
            event.event_type(),
            event_data,
            event.routing_key(),
            exchange,
        ))
    }

    /// An event needs a type and a destination exchange. An empty routing key
    /// is legal on a topic exchange.
    pub fn validate(&self) -> Result<(), OutboxStoreError> {
        if self.event_type.trim().is_empty() {
            return Err(OutboxStoreError::InvalidEvent(
                "event_type must not be empty".to_string(),
            ));
        }
        if self.exchange.trim().is_empty() {
            return Err(OutboxStoreError::InvalidEvent(format!(
                "exchange must not be empty ({})",
                self.event_type
            )));
        }
        Ok(())
    }
}

/// Backoff strategy between publish retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How often, and how far apart, FAILED rows are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which a row is abandoned (stays FAILED)
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Spread (0.0-1.0) applied around the computed delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A failed publish is never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retrying a row that has failed `attempt` times (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so rows failing together do not retry in lockstep.
        let spread = delay_ms * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = ((attempt as f64 * 37.0) % 100.0) / 100.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether a row that has failed `retry_count` times gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}
