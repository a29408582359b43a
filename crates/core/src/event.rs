use serde::Serialize;

/// A fact emitted by a command handler after a successful domain write.
///
/// Events are immutable. The outbox stores the serialized form of the event
/// and later publishes it to the broker under [`DomainEvent::routing_key`].
pub trait DomainEvent: Serialize + core::fmt::Debug + Send + Sync {
    /// Stable event name (e.g. "ShipmentCreated").
    fn event_type(&self) -> &'static str;

    /// Topic routing key (e.g. "shipment.created").
    fn routing_key(&self) -> &'static str;
}
