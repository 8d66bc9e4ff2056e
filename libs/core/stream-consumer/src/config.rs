//! Consumer configuration
//!
//! `ConsumerConfig` is a plain struct with `with_*` builders; hosts usually
//! load it with [`FromEnv`].

use std::time::Duration;

use core_config::redis::RedisConfig;
use core_config::{env_optional, env_parse, env_parse_optional, env_required, ConfigError, FromEnv};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::ConsumerError;

/// Configuration for one consumer worker
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Redis connection URL
    pub endpoint: String,

    /// Source stream key
    pub stream_name: String,

    /// Consumer group name
    pub group_name: String,

    /// Consumer name inside the group (auto-generated if not provided)
    pub consumer_name: String,

    /// Handler pool size
    pub max_concurrency: usize,

    /// Deliveries allowed before a message is dead-lettered
    pub max_delivery_attempts: u32,

    /// Dead-letter stream key
    pub dead_letter_name: String,

    /// Approximate cap for the dead-letter stream (`MAXLEN ~`)
    pub dead_letter_max_len: Option<usize>,

    /// How long a read blocks waiting for new entries
    pub block_timeout: Duration,

    /// Upper bound of entries per read
    pub batch_size: usize,

    /// Idle time after which another consumer's entry may be claimed
    pub claim_min_idle: Duration,

    /// Interval between stale-claim passes
    pub claim_interval: Duration,

    /// Time `stop()` waits for in-flight handlers
    pub shutdown_grace: Duration,

    /// Time `start()` waits for connect and group setup
    pub start_timeout: Duration,

    /// ID the group starts from when it is created (`$` = only new entries)
    pub group_start_id: String,

    /// Reconnect policy
    pub backoff: BackoffPolicy,
}

impl ConsumerConfig {
    /// Create a config with defaults for everything but the stream and group
    pub fn new(stream_name: impl Into<String>, group_name: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            dead_letter_name: format!("{}:dlq", stream_name),
            stream_name,
            group_name: group_name.into(),
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            max_concurrency: 4,
            max_delivery_attempts: 5,
            dead_letter_max_len: Some(100_000),
            block_timeout: Duration::from_millis(5000),
            batch_size: 10,
            claim_min_idle: Duration::from_millis(30_000),
            claim_interval: Duration::from_millis(60_000),
            shutdown_grace: Duration::from_millis(10_000),
            start_timeout: Duration::from_millis(30_000),
            group_start_id: "$".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_max_delivery_attempts(mut self, n: u32) -> Self {
        self.max_delivery_attempts = n;
        self
    }

    pub fn with_dead_letter(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_name = name.into();
        self
    }

    pub fn with_dead_letter_max_len(mut self, max_len: Option<usize>) -> Self {
        self.dead_letter_max_len = max_len;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_group_start_id(mut self, id: impl Into<String>) -> Self {
        self.group_start_id = id.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<(), ConsumerError> {
        let invalid = |msg: &str| Err(ConsumerError::InvalidConfig(msg.to_string()));

        if self.stream_name.trim().is_empty() {
            return invalid("stream name must not be empty");
        }
        if self.group_name.trim().is_empty() {
            return invalid("group name must not be empty");
        }
        if self.consumer_name.trim().is_empty() {
            return invalid("consumer name must not be empty");
        }
        if self.dead_letter_name.trim().is_empty() {
            return invalid("dead-letter stream name must not be empty");
        }
        if self.dead_letter_name == self.stream_name {
            return invalid("dead-letter stream must differ from the source stream");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.max_delivery_attempts == 0 {
            return invalid("max_delivery_attempts must be at least 1");
        }
        if self.backoff.multiplier < 1.0 {
            return invalid("backoff multiplier must be >= 1.0");
        }

        Ok(())
    }
}

fn millis(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_parse(key, default_ms).map(Duration::from_millis)
}

impl FromEnv for ConsumerConfig {
    /// Requires a Redis URL, CONSUMER_STREAM and CONSUMER_GROUP; everything
    /// else has a default.
    fn from_env() -> Result<Self, ConfigError> {
        let redis = RedisConfig::from_env()?;
        let mut config = Self::new(env_required("CONSUMER_STREAM")?, env_required("CONSUMER_GROUP")?)
            .with_endpoint(redis.uri);

        if let Some(name) = env_optional("CONSUMER_NAME") {
            config.consumer_name = name;
        }
        if let Some(dlq) = env_optional("CONSUMER_DEAD_LETTER_STREAM") {
            config.dead_letter_name = dlq;
        }
        if let Some(start) = env_optional("CONSUMER_GROUP_START_ID") {
            config.group_start_id = start;
        }

        config.max_concurrency = env_parse("CONSUMER_MAX_CONCURRENCY", config.max_concurrency)?;
        config.max_delivery_attempts =
            env_parse("CONSUMER_MAX_DELIVERY_ATTEMPTS", config.max_delivery_attempts)?;
        config.batch_size = env_parse("CONSUMER_BATCH_SIZE", config.batch_size)?;
        config.dead_letter_max_len =
            env_parse_optional("CONSUMER_DEAD_LETTER_MAX_LEN")?.or(config.dead_letter_max_len);
        config.block_timeout = millis("CONSUMER_BLOCK_TIMEOUT_MS", 5000)?;
        config.claim_min_idle = millis("CONSUMER_CLAIM_MIN_IDLE_MS", 30_000)?;
        config.claim_interval = millis("CONSUMER_CLAIM_INTERVAL_MS", 60_000)?;
        config.shutdown_grace = millis("CONSUMER_SHUTDOWN_GRACE_MS", 10_000)?;
        config.start_timeout = millis("CONSUMER_START_TIMEOUT_MS", 30_000)?;

        let defaults = BackoffPolicy::default();
        config.backoff = BackoffPolicy {
            base_delay_ms: env_parse("BACKOFF_BASE_MS", defaults.base_delay_ms)?,
            multiplier: env_parse("BACKOFF_MULTIPLIER", defaults.multiplier)?,
            max_delay_ms: env_parse("BACKOFF_MAX_MS", defaults.max_delay_ms)?,
            jitter: env_parse("BACKOFF_JITTER", defaults.jitter)?,
            max_retries: env_parse_optional("BACKOFF_MAX_RETRIES")?,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSUMER_VARS: [&str; 18] = [
        "REDIS_URL",
        "REDIS_HOST",
        "CONSUMER_STREAM",
        "CONSUMER_GROUP",
        "CONSUMER_NAME",
        "CONSUMER_DEAD_LETTER_STREAM",
        "CONSUMER_GROUP_START_ID",
        "CONSUMER_MAX_CONCURRENCY",
        "CONSUMER_MAX_DELIVERY_ATTEMPTS",
        "CONSUMER_BATCH_SIZE",
        "CONSUMER_DEAD_LETTER_MAX_LEN",
        "CONSUMER_BLOCK_TIMEOUT_MS",
        "CONSUMER_CLAIM_MIN_IDLE_MS",
        "CONSUMER_CLAIM_INTERVAL_MS",
        "CONSUMER_SHUTDOWN_GRACE_MS",
        "CONSUMER_START_TIMEOUT_MS",
        "BACKOFF_MAX_RETRIES",
        "BACKOFF_MULTIPLIER",
    ];

    #[test]
    fn test_new_config_defaults() {
        let config = ConsumerConfig::new("orders", "billing");

        assert_eq!(config.stream_name, "orders");
        assert_eq!(config.group_name, "billing");
        assert_eq!(config.dead_letter_name, "orders:dlq");
        assert!(config.consumer_name.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert_eq!(config.claim_min_idle, Duration::from_secs(30));
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_names_are_unique() {
        let a = ConsumerConfig::new("s", "g");
        let b = ConsumerConfig::new("s", "g");
        assert_ne!(a.consumer_name, b.consumer_name);
    }

    #[test]
    fn test_builders() {
        let config = ConsumerConfig::new("orders", "billing")
            .with_consumer_name("billing-1")
            .with_max_concurrency(2)
            .with_batch_size(5)
            .with_dead_letter("orders:failed")
            .with_block_timeout(Duration::from_millis(50));

        assert_eq!(config.consumer_name, "billing-1");
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.dead_letter_name, "orders:failed");
        assert_eq!(config.block_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = ConsumerConfig::new("orders", "billing");

        assert!(base.clone().with_max_concurrency(0).validate().is_err());
        assert!(base.clone().with_batch_size(0).validate().is_err());
        assert!(base.clone().with_max_delivery_attempts(0).validate().is_err());
        assert!(base.clone().with_dead_letter("orders").validate().is_err());
        assert!(base.clone().with_consumer_name(" ").validate().is_err());
        assert!(ConsumerConfig::new("", "billing").validate().is_err());
        assert!(ConsumerConfig::new("orders", "").validate().is_err());
        assert!(base
            .with_backoff(BackoffPolicy::new().with_multiplier(0.5))
            .validate()
            .is_err());
    }

    /// Run `f` with every consumer variable unset except `set`
    fn with_env<R>(set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let vars: Vec<(&str, Option<&str>)> = CONSUMER_VARS
            .iter()
            .map(|key| {
                let value = set.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn test_from_env_requires_stream_and_group() {
        with_env(&[("REDIS_URL", "redis://localhost:6379")], || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("CONSUMER_STREAM"));
        });
    }

    #[test]
    fn test_from_env_requires_redis_url() {
        with_env(&[("CONSUMER_STREAM", "orders"), ("CONSUMER_GROUP", "billing")], || {
            let err = ConsumerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_URL"));
        });
    }

    #[test]
    fn test_from_env_with_defaults() {
        with_env(
            &[
                ("REDIS_URL", "redis://localhost:6379"),
                ("CONSUMER_STREAM", "orders"),
                ("CONSUMER_GROUP", "billing"),
            ],
            || {
                let config = ConsumerConfig::from_env().unwrap();
                assert_eq!(config.endpoint, "redis://localhost:6379");
                assert_eq!(config.dead_letter_name, "orders:dlq");
                assert_eq!(config.max_concurrency, 4);
                assert_eq!(config.backoff.max_retries, None);
                assert!(config.validate().is_ok());
            },
        );
    }

    #[test]
    fn test_from_env_overrides() {
        with_env(
            &[
                ("REDIS_HOST", "redis://cache:6379"),
                ("CONSUMER_STREAM", "orders"),
                ("CONSUMER_GROUP", "billing"),
                ("CONSUMER_NAME", "billing-7"),
                ("CONSUMER_MAX_CONCURRENCY", "16"),
                ("CONSUMER_BLOCK_TIMEOUT_MS", "250"),
                ("CONSUMER_DEAD_LETTER_STREAM", "orders:poison"),
                ("BACKOFF_MAX_RETRIES", "3"),
                ("BACKOFF_MULTIPLIER", "1.5"),
            ],
            || {
                let config = ConsumerConfig::from_env().unwrap();
                assert_eq!(config.endpoint, "redis://cache:6379");
                assert_eq!(config.consumer_name, "billing-7");
                assert_eq!(config.max_concurrency, 16);
                assert_eq!(config.block_timeout, Duration::from_millis(250));
                assert_eq!(config.dead_letter_name, "orders:poison");
                assert_eq!(config.backoff.max_retries, Some(3));
                assert_eq!(config.backoff.multiplier, 1.5);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_unparseable_number() {
        with_env(
            &[
                ("REDIS_URL", "redis://localhost:6379"),
                ("CONSUMER_STREAM", "orders"),
                ("CONSUMER_GROUP", "billing"),
                ("CONSUMER_BATCH_SIZE", "ten"),
            ],
            || {
                let err = ConsumerConfig::from_env().unwrap_err();
                assert!(
                    matches!(err, ConfigError::ParseError { ref key, .. } if key == "CONSUMER_BATCH_SIZE")
                );
            },
        );
    }
}
