//! Append side of the outbox, used by command handlers.

use async_trait::async_trait;

use logistics_core::DomainEvent;

use crate::store::OutboxStoreError;
use crate::types::{NewOutboxEvent, OutboxEvent};

/// Appends outbox rows inside the caller's unit of work.
///
/// Implementations are scoped to one transaction: rows become visible to
/// publishers only when that transaction commits, and vanish if it rolls back.
#[async_trait]
pub trait OutboxWriter: Send {
    /// Validate `event` and stage it as a new PENDING row.
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError>;

    /// Serialize a domain event and append it.
    async fn append_event<E>(&mut self, event: &E, exchange: &str) -> Result<OutboxEvent, OutboxStoreError>
    where
        E: DomainEvent,
    {
        let new = NewOutboxEvent::from_domain_event(event, exchange)?;
        self.append(new).await
    }
}

/// Rows staged by an in-memory unit of work.
///
/// Committed through [`crate::InMemoryOutboxStore::commit_staged`]; dropping
/// it discards the rows.
#[derive(Debug, Default)]
pub struct StagedOutbox {
    events: Vec<OutboxEvent>,
}

impl StagedOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a fully built row as is.
    pub fn push(&mut self, event: OutboxEvent) {
        self.events.push(event);
    }

    /// Move every row of `other` to the end of this stage.
    pub fn merge(&mut self, other: StagedOutbox) {
        self.events.extend(other.events);
    }

    pub fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn into_events(self) -> Vec<OutboxEvent> {
        self.events
    }
}

#[async_trait]
impl OutboxWriter for StagedOutbox {
    async fn append(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxStoreError> {
        event.validate()?;
        let row = OutboxEvent::pending(event);
        self.events.push(row.clone());
        Ok(row)
    }
}
