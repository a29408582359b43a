//! Relay configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use logistics_outbox::{OutboxPublisherConfig, RetryPolicy, DEFAULT_EXCHANGE};

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_SERVICE_NAME: &str = "outbox-publisher";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

/// Upper bound on a single retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Settings of the outbox relay process.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub service_name: String,
    pub exchange: String,
    /// Prefix of the Redis keys backing each exchange
    pub stream_prefix: String,
    /// Approximate cap on entries per stream; `None` keeps every entry
    pub stream_max_len: Option<usize>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub publish_timeout: Duration,
    /// Always longer than `publish_timeout`, so an in-flight publish is never
    /// reclaimed by another relay
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// Age after which COMPLETED rows are purged; `None` keeps them forever
    pub retention: Option<Duration>,
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which returns the raw value of a variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let poll_interval_ms: u64 = parse(&get, "OUTBOX_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let batch_size: usize = parse(&get, "OUTBOX_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let publish_timeout_ms: u64 = parse(&get, "OUTBOX_PUBLISH_TIMEOUT_MS", DEFAULT_PUBLISH_TIMEOUT_MS)?;
        let visibility_secs: u64 = parse(
            &get,
            "OUTBOX_VISIBILITY_TIMEOUT_SECS",
            DEFAULT_VISIBILITY_TIMEOUT_SECS,
        )?;
        let max_attempts: u32 = parse(&get, "OUTBOX_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let retry_base_ms: u64 = parse(&get, "OUTBOX_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?;
        let stream_max_len: usize = parse(&get, "OUTBOX_STREAM_MAX_LEN", DEFAULT_STREAM_MAX_LEN)?;
        let retention_days: Option<u64> = get("OUTBOX_RETENTION_DAYS")
            .map(|v| parse_value("OUTBOX_RETENTION_DAYS", &v))
            .transpose()?;

        non_zero("OUTBOX_POLL_INTERVAL_MS", poll_interval_ms)?;
        non_zero("OUTBOX_BATCH_SIZE", batch_size as u64)?;
        non_zero("OUTBOX_PUBLISH_TIMEOUT_MS", publish_timeout_ms)?;
        if let Some(days) = retention_days {
            non_zero("OUTBOX_RETENTION_DAYS", days)?;
        }

        let publish_timeout = Duration::from_millis(publish_timeout_ms);
        let visibility_timeout = Duration::from_secs(visibility_secs);
        if visibility_timeout <= publish_timeout {
            return Err(ConfigError::Invalid {
                key: "OUTBOX_VISIBILITY_TIMEOUT_SECS",
                value: visibility_secs.to_string(),
            });
        }

        Ok(Self {
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            service_name: get("OUTBOX_SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            exchange: get("OUTBOX_EXCHANGE").unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            stream_prefix: get("OUTBOX_STREAM_PREFIX").unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            stream_max_len: (stream_max_len > 0).then_some(stream_max_len),
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            publish_timeout,
            visibility_timeout,
            max_attempts,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            retention: retention_days.map(|days| Duration::from_secs(days * 24 * 60 * 60)),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            self.retry_base_delay,
            MAX_RETRY_DELAY.max(self.retry_base_delay),
        )
    }

    pub fn publisher_config(&self) -> OutboxPublisherConfig {
        OutboxPublisherConfig::default()
            .with_name(self.service_name.clone())
            .with_poll_interval(self.poll_interval)
            .with_batch_size(self.batch_size)
            .with_publish_timeout(self.publish_timeout)
            .with_visibility_timeout(self.visibility_timeout)
            .with_exchanges([self.exchange.clone()])
            .with_retry_policy(self.retry_policy())
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn non_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = RelayConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/logistics")])).unwrap();

        assert_eq!(config.database_url, "postgres://localhost/logistics");
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.exchange, "logistics");
        assert_eq!(config.stream_prefix, "logistics");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert_eq!(config.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.stream_max_len, Some(100_000));
        assert_eq!(config.retention, None);
    }

    #[test]
    fn database_url_is_required() {
        let err = RelayConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/planner"),
            ("OUTBOX_SERVICE_NAME", "planner-outbox"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_BATCH_SIZE", "10"),
            ("OUTBOX_MAX_ATTEMPTS", "3"),
            ("OUTBOX_RETRY_BASE_DELAY_MS", "60000"),
            ("OUTBOX_RETENTION_DAYS", "30"),
            ("OUTBOX_STREAM_MAX_LEN", "0"),
        ]))
        .unwrap();

        assert_eq!(config.stream_max_len, None);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retention, Some(Duration::from_secs(30 * 86_400)));

        let publisher = config.publisher_config();
        assert_eq!(publisher.name, "planner-outbox");
        assert_eq!(publisher.batch_size, 10);
        assert_eq!(publisher.exchanges, vec!["logistics".to_string()]);
        assert_eq!(publisher.retry_policy.max_attempts, 3);
        assert_eq!(publisher.retry_policy.base_delay, Duration::from_secs(60));
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("OUTBOX_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "OUTBOX_BATCH_SIZE",
                value: "lots".to_string(),
            }
        );

        let err = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("OUTBOX_POLL_INTERVAL_MS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_POLL_INTERVAL_MS", .. }));
    }

    #[test]
    fn visibility_timeout_must_outlast_a_publish() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("OUTBOX_VISIBILITY_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "OUTBOX_VISIBILITY_TIMEOUT_SECS",
                value: "0".to_string(),
            }
        );

        // equal to the publish timeout is still too short
        let err = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("OUTBOX_PUBLISH_TIMEOUT_MS", "30000"),
            ("OUTBOX_VISIBILITY_TIMEOUT_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_VISIBILITY_TIMEOUT_SECS", .. }));

        let config = RelayConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db"),
            ("OUTBOX_PUBLISH_TIMEOUT_MS", "30000"),
            ("OUTBOX_VISIBILITY_TIMEOUT_SECS", "31"),
        ]))
        .unwrap();
        assert!(config.publisher_config().visibility_timeout > config.publisher_config().publish_timeout);
    }
}
