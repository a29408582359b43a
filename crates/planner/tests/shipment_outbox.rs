use std::sync::Arc;
use std::time::Duration;

use logistics_outbox::{
    BrokerChannel, ExchangeKind, InMemoryBroker, InMemoryOutboxStore, OutboxPublisher,
    OutboxPublisherConfig, OutboxStatus, OutboxStore, RetryPolicy,
};
use logistics_planner::{
    AssignShipment, CreateShipment, InMemoryShipmentStore, ShipmentCommandHandler,
};

struct Harness {
    outbox: Arc<InMemoryOutboxStore>,
    broker: Arc<InMemoryBroker>,
    handler: ShipmentCommandHandler,
    publisher: OutboxPublisher<Arc<InMemoryOutboxStore>, Arc<InMemoryBroker>>,
}

fn harness(config: OutboxPublisherConfig) -> Harness {
    let outbox = InMemoryOutboxStore::arc();
    let broker = InMemoryBroker::arc();
    let shipments = Arc::new(InMemoryShipmentStore::new(outbox.clone()));
    Harness {
        handler: ShipmentCommandHandler::new(shipments),
        publisher: OutboxPublisher::new(outbox.clone(), broker.clone(), config),
        outbox,
        broker,
    }
}

/// Connect, declare the exchange and bind a queue the way a consumer would.
async fn bind(broker: &InMemoryBroker, queue: &str, pattern: &str) {
    broker.connect().await.unwrap();
    broker
        .declare_exchange("logistics", ExchangeKind::Topic, true)
        .await
        .unwrap();
    broker.bind_queue(queue, "logistics", pattern).unwrap();
}

#[tokio::test]
async fn created_shipment_reaches_bound_consumer() {
    let h = harness(OutboxPublisherConfig::default());
    bind(&h.broker, "driver-api.shipments", "shipment.*").await;

    let shipment = h
        .handler
        .create_shipment(CreateShipment::new("TRK-1001", "Rotterdam", "Hamburg"))
        .await
        .unwrap();

    let report = h.publisher.run_cycle().await;
    assert_eq!(report.published, 1);

    let delivered = h.broker.drain_queue("driver-api.shipments");
    assert_eq!(delivered.len(), 1);
    let message = &delivered[0];
    assert_eq!(message.routing_key, "shipment.created");
    assert!(message.options.persistent);

    let payload = message.json().unwrap();
    assert_eq!(payload["shipmentId"], shipment.id.to_string());
    assert_eq!(payload["trackingNumber"], "TRK-1001");
    assert_eq!(payload["origin"], "Rotterdam");
    assert_eq!(payload["destination"], "Hamburg");

    let stats = h.outbox.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn create_and_assign_are_published_in_order() {
    let h = harness(OutboxPublisherConfig::default());
    bind(&h.broker, "audit", "#").await;

    let shipment = h
        .handler
        .create_shipment(CreateShipment::new("TRK-2", "A", "B"))
        .await
        .unwrap();
    h.handler
        .assign_shipment(AssignShipment {
            shipment_id: shipment.id,
            driver_id: logistics_core::DriverId::new(),
        })
        .await
        .unwrap();

    h.publisher.run_cycle().await;

    let keys: Vec<String> = h
        .broker
        .drain_queue("audit")
        .into_iter()
        .map(|m| m.routing_key)
        .collect();
    assert_eq!(keys, vec!["shipment.created", "shipment.assigned"]);
}

#[tokio::test]
async fn shipment_survives_broker_outage_and_is_published_later() {
    let h = harness(
        OutboxPublisherConfig::default().with_retry_policy(RetryPolicy::fixed(5, Duration::ZERO)),
    );
    h.broker.refuse_connections(true);

    let shipment = h
        .handler
        .create_shipment(CreateShipment::new("TRK-3", "A", "B"))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(h.publisher.run_cycle().await.broker_unavailable);
    }
    assert_eq!(
        h.handler.store().get(shipment.id).unwrap().map(|s| s.tracking_number),
        Some("TRK-3".to_string())
    );
    let pending = h.outbox.find_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);

    h.broker.refuse_connections(false);
    let report = h.publisher.run_cycle().await;
    assert_eq!(report.published, 1);
    assert_eq!(h.broker.published().len(), 1);
    assert_eq!(h.publisher.stats().broker_outages, 3);
}

#[tokio::test]
async fn rejected_publish_is_retried_until_delivered() {
    let h = harness(
        OutboxPublisherConfig::default().with_retry_policy(RetryPolicy::fixed(5, Duration::ZERO)),
    );
    bind(&h.broker, "q", "shipment.created").await;
    h.broker.fail_next_publishes(2);

    h.handler
        .create_shipment(CreateShipment::new("TRK-4", "A", "B"))
        .await
        .unwrap();

    let first = h.publisher.run_cycle().await;
    assert_eq!(first.failed, 1);
    let second = h.publisher.run_cycle().await;
    assert_eq!((second.requeued, second.failed), (1, 1));
    let third = h.publisher.run_cycle().await;
    assert_eq!((third.requeued, third.published), (1, 1));

    let rows = h.outbox.find_by_status(OutboxStatus::Completed, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].retry_count, 2);
    assert_eq!(h.broker.drain_queue("q").len(), 1);
}

#[tokio::test]
async fn failed_commit_never_reaches_the_broker() {
    let h = harness(OutboxPublisherConfig::default());
    bind(&h.broker, "q", "#").await;

    h.handler
        .create_shipment(CreateShipment::new("TRK-5", "A", "B"))
        .await
        .unwrap();
    assert!(h
        .handler
        .create_shipment(CreateShipment::new("TRK-5", "X", "Y"))
        .await
        .is_err());

    h.publisher.run_cycle().await;
    assert_eq!(h.broker.drain_queue("q").len(), 1);
}
