//! Redis Streams-backed broker channel.
//!
//! - **Exchange**: one stream per exchange, key `{prefix}:{exchange}`
//! - **Declaration**: exchange kinds are recorded in the `{prefix}:exchanges`
//!   hash, so every publisher sees the same topology
//! - **Message**: `XADD` entry with `routing_key`, `message_id`, `persistent`,
//!   `content_type` and `payload` fields
//!
//! Consumers read the stream with their own consumer group and apply topic
//! matching on `routing_key` themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, instrument, warn};

use logistics_outbox::{BrokerChannel, BrokerError, ExchangeKind, PublishOptions, DEFAULT_EXCHANGE};

/// Default key prefix
const DEFAULT_PREFIX: &str = DEFAULT_EXCHANGE;

/// Approximate cap on entries kept per stream
const DEFAULT_MAX_LEN: usize = 100_000;

pub struct RedisStreamsBroker {
    client: redis::Client,
    prefix: String,
    max_len: Option<usize>,
    conn: Mutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    declared: Mutex<HashMap<String, ExchangeKind>>,
}

impl RedisStreamsBroker {
    /// Create a broker for `redis_url`. No connection is made until `connect`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key prefix (default: "logistics")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            max_len: Some(DEFAULT_MAX_LEN),
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            declared: Mutex::new(HashMap::new()),
        })
    }

    /// Cap stream length (`None` keeps every entry).
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    /// Stream key backing `exchange`.
    pub fn stream_key(&self, exchange: &str) -> String {
        format!("{}:{}", self.prefix, exchange)
    }

    fn exchanges_key(&self) -> String {
        format!("{}:exchanges", self.prefix)
    }

    fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        lock(&self.conn).clone().ok_or(BrokerError::NotConnected)
    }

    fn drop_connection(&self) {
        *lock(&self.conn) = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Command errors caused by a broken connection force a reconnect.
    fn map_command_error(&self, command: &str, err: redis::RedisError) -> BrokerError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(command, error = %err, "redis connection lost");
            self.drop_connection();
            BrokerError::Connection(format!("{command} failed: {err}"))
        } else {
            BrokerError::Rejected(format!("{command} failed: {err}"))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerChannel for RedisStreamsBroker {
    #[instrument(skip(self), err)]
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("PING failed: {e}")))?;

        *lock(&self.conn) = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        info!(prefix = %self.prefix, "connected to redis");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), err)]
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let key = self.exchanges_key();

        let existing: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.map_command_error("HGET", e))?;

        match existing {
            Some(existing) if existing != kind.as_str() => {
                return Err(BrokerError::Rejected(format!(
                    "exchange {name} already declared as {existing}"
                )));
            }
            Some(_) => {}
            None => {
                let _: i64 = redis::cmd("HSET")
                    .arg(&key)
                    .arg(name)
                    .arg(kind.as_str())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| self.map_command_error("HSET", e))?;
            }
        }

        lock(&self.declared).insert(name.to_string(), kind);
        Ok(())
    }

    #[instrument(
        skip(self, payload, options),
        fields(stream_key = %self.stream_key(exchange)),
        err
    )]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        if !lock(&self.declared).contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(exchange));
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("routing_key")
            .arg(routing_key)
            .arg("message_id")
            .arg(options.message_id.as_deref().unwrap_or_default())
            .arg("persistent")
            .arg(if options.persistent { "1" } else { "0" })
            .arg("content_type")
            .arg(options.content_type.as_deref().unwrap_or("application/json"))
            .arg("payload")
            .arg(payload);

        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.map_command_error("XADD", e))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            info!(prefix = %self.prefix, "closing redis connection");
        }
        self.drop_connection();
        Ok(())
    }
}
