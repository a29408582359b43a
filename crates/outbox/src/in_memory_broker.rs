//! In-memory topic broker for tests/dev, with failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind, PublishOptions};

/// A message accepted by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl PublishedMessage {
    /// Payload parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<JsonValue> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Debug, Clone)]
struct ExchangeDecl {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    exchanges: HashMap<String, ExchangeDecl>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<PublishedMessage>>,
    published: Vec<PublishedMessage>,
}

/// In-memory broker.
///
/// Exchanges, bindings and queues survive `close`, like a broker that keeps
/// running while a client reconnects.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    refuse_connections: AtomicBool,
    failing_publishes: AtomicU32,
    severed_publishes: AtomicU32,
    stall_ms: AtomicU64,
    connects: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every `connect` fail until switched off.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Reject the next `n` publishes.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Drop the connection while handling each of the next `n` publishes.
    pub fn sever_next_publishes(&self, n: u32) {
        self.severed_publishes.store(n, Ordering::SeqCst);
    }

    /// Delay every publish by `delay` (`None` disables).
    pub fn stall_publishes(&self, delay: Option<Duration>) {
        let ms = delay.map_or(0, |d| d.as_millis() as u64);
        self.stall_ms.store(ms, Ordering::SeqCst);
    }

    /// Drop the connection from the broker side.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Successful `connect` calls so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind)
    }

    pub fn is_durable(&self, name: &str) -> bool {
        self.lock().exchanges.get(name).is_some_and(|e| e.durable)
    }

    /// Bind `queue` to `exchange` with a routing pattern. Creates the queue.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
        Ok(())
    }

    /// Take every message waiting in `queue`.
    pub fn drain_queue(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Every accepted publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.failing_publishes)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        let mut state = self.lock();
        if !state.connected {
            state.connected = true;
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Rejected(format!(
                "exchange {name} already declared as {}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeDecl { kind, durable });
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        {
            let state = self.lock();
            if !state.connected {
                return Err(BrokerError::NotConnected);
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::UnknownExchange(exchange.to_string()));
            }
        }

        if take_one(&self.severed_publishes) {
            self.lock().connected = false;
            return Err(BrokerError::Connection("connection reset by peer".to_string()));
        }
        if self.take_injected_failure() {
            return Err(BrokerError::Rejected("injected failure".to_string()));
        }

        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }

        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            options: options.clone(),
        };

        let mut state = self.lock();
        let kind = state
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && kind.routes(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        for queue in targets {
            state.queues.entry(queue).or_default().push_back(message.clone());
        }
        state.published.push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.lock().connected = false;
        Ok(())
    }
}
