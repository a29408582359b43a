//! Transactional outbox with retry, backoff, and broker publication.
//!
//! ## Design
//!
//! - Command handlers append one outbox row per domain event inside the same
//!   unit of work as the domain write (`OutboxWriter`)
//! - A background poller drains PENDING rows to a topic exchange
//!   (`OutboxPublisher`)
//! - Status only moves forward: PENDING → PROCESSING → COMPLETED | FAILED;
//!   FAILED rows are requeued under a bounded `RetryPolicy`
//! - Claims are conditional updates, so several pollers can share a store
//!
//! ## Components
//!
//! - `OutboxEvent`: the persisted row (status, retry count, timestamps)
//! - `OutboxStore`: persistence for rows (in-memory here, Postgres in infra)
//! - `OutboxWriter`: append side used by command handlers
//! - `BrokerChannel`: owned broker connection with a topic publish call
//! - `OutboxPublisher`: the poll loop

pub mod broker;
pub mod in_memory;
pub mod in_memory_broker;
pub mod publisher;
pub mod store;
pub mod types;
pub mod writer;

pub use broker::{topic_matches, BrokerChannel, BrokerError, ExchangeKind, PublishOptions};
pub use in_memory::InMemoryOutboxStore;
pub use in_memory_broker::{InMemoryBroker, PublishedMessage};
pub use publisher::{
    CycleReport, EventOutcome, OutboxPublisher, OutboxPublisherConfig, OutboxPublisherHandle,
    PublisherStats,
};
pub use store::{OutboxStats, OutboxStore, OutboxStoreError};
pub use types::{BackoffStrategy, NewOutboxEvent, OutboxEvent, OutboxStatus, RetryPolicy};
pub use writer::{OutboxWriter, StagedOutbox};

/// Exchange both services publish their domain events to.
pub const DEFAULT_EXCHANGE: &str = "logistics";
