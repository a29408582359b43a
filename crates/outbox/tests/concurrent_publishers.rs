//! Several relays polling one outbox store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use logistics_outbox::{
    CycleReport, InMemoryBroker, InMemoryOutboxStore, NewOutboxEvent, OutboxEvent, OutboxPublisher,
    OutboxPublisherConfig, OutboxStatus, OutboxStore, OutboxWriter, RetryPolicy, DEFAULT_EXCHANGE,
};
use serde_json::json;

type Relay = OutboxPublisher<Arc<InMemoryOutboxStore>, Arc<InMemoryBroker>>;

fn relay(store: &Arc<InMemoryOutboxStore>, name: &str, config: OutboxPublisherConfig) -> (Arc<InMemoryBroker>, Relay) {
    let broker = InMemoryBroker::arc();
    let publisher = OutboxPublisher::new(store.clone(), broker.clone(), config.with_name(name));
    (broker, publisher)
}

async fn append(store: &InMemoryOutboxStore, n: u32) -> OutboxEvent {
    let mut staged = store.stage();
    let row = staged
        .append(NewOutboxEvent::new(
            "ShipmentCreated",
            json!({"n": n}),
            "shipment.created",
            DEFAULT_EXCHANGE,
        ))
        .await
        .unwrap();
    store.commit_staged(staged).unwrap();
    row
}

fn message_ids(brokers: &[&InMemoryBroker]) -> Vec<String> {
    brokers
        .iter()
        .flat_map(|b| b.published())
        .filter_map(|m| m.options.message_id)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_row_is_published_by_exactly_one_relay() {
    let store = InMemoryOutboxStore::arc();
    let mut rows = HashSet::new();
    for n in 0..40 {
        rows.insert(append(&store, n).await.id.to_string());
    }
    let (broker_a, a) = relay(&store, "relay-a", OutboxPublisherConfig::default());
    let (broker_b, b) = relay(&store, "relay-b", OutboxPublisherConfig::default());
    broker_a.stall_publishes(Some(Duration::from_millis(1)));
    broker_b.stall_publishes(Some(Duration::from_millis(1)));

    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());

    assert_eq!(ra.published + rb.published, 40);
    assert_eq!(ra.failed + rb.failed, 0);

    let ids = message_ids(&[&broker_a, &broker_b]);
    assert_eq!(ids.len(), 40);
    let unique: HashSet<_> = ids.into_iter().collect();
    assert_eq!(unique, rows);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, 40);
    assert_eq!(stats.total(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_is_never_requeued_early_by_another_relay() {
    let store = InMemoryOutboxStore::arc();
    let row = append(&store, 1).await;
    let policy = RetryPolicy::fixed(5, Duration::from_secs(300));

    let (slow_broker, slow) = relay(
        &store,
        "relay-slow",
        OutboxPublisherConfig::default()
            .with_publish_timeout(Duration::from_millis(50))
            .with_retry_policy(policy.clone()),
    );
    slow_broker.stall_publishes(Some(Duration::from_secs(5)));
    let (other_broker, other) = relay(
        &store,
        "relay-other",
        OutboxPublisherConfig::default().with_retry_policy(policy),
    );

    // the other relay keeps polling while the slow one times out and records it
    let polling = async {
        let mut reports: Vec<CycleReport> = Vec::new();
        for _ in 0..60 {
            reports.push(other.run_cycle().await);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        reports
    };
    let (slow_report, reports) = tokio::join!(slow.run_cycle(), polling);

    assert_eq!(slow_report.failed, 1);
    assert!(reports.iter().all(|r| r.requeued == 0 && r.published == 0));
    assert!(other_broker.published().is_empty());

    let after = other.run_cycle().await;
    assert_eq!(after.requeued, 0);

    let failed = store.find_by_id(row.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.next_attempt_at.unwrap() > Utc::now());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_claim_is_reclaimed_and_published_once() {
    let store = InMemoryOutboxStore::arc();
    let abandoned = append(&store, 0).await;
    for n in 1..10 {
        append(&store, n).await;
    }
    // a relay claimed this row and died
    assert!(store.mark_as_processing(abandoned.id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;

    let config = OutboxPublisherConfig::default()
        .with_publish_timeout(Duration::from_millis(100))
        .with_visibility_timeout(Duration::from_millis(200));
    let (broker_a, a) = relay(&store, "relay-a", config.clone());
    let (broker_b, b) = relay(&store, "relay-b", config);
    broker_a.stall_publishes(Some(Duration::from_millis(1)));
    broker_b.stall_publishes(Some(Duration::from_millis(1)));

    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());

    assert_eq!(ra.reclaimed + rb.reclaimed, 1);
    assert_eq!(ra.published + rb.published, 10);

    let ids = message_ids(&[&broker_a, &broker_b]);
    let abandoned_id = abandoned.id.to_string();
    assert_eq!(ids.iter().filter(|id| **id == abandoned_id).count(), 1);
    assert_eq!(ids.len(), 10);
    assert_eq!(
        store.find_by_id(abandoned.id).await.unwrap().map(|e| e.status),
        Some(OutboxStatus::Completed)
    );
}
