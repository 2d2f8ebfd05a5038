//! Worker configuration loaded from the environment.
//!
//! Every key is optional; missing keys keep the engine defaults. Durations
//! are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use quill_messaging::{BackoffPolicy, StreamStore};

use crate::consumer::EngineConfig;
use crate::dead_letter::DeadLetterMonitorConfig;
use crate::producer::{DEFAULT_MAX_LEN, GENERATION_STREAM, Producer};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_GROUP: &str = "quill-workers";

/// Environment keys.
pub mod keys {
    pub const REDIS_URL: &str = "QUILL_REDIS_URL";
    pub const STREAM: &str = "QUILL_STREAM";
    pub const GROUP: &str = "QUILL_GROUP";
    pub const CONSUMER: &str = "QUILL_CONSUMER";
    pub const BATCH_SIZE: &str = "QUILL_BATCH_SIZE";
    pub const BLOCK_TIMEOUT_MS: &str = "QUILL_BLOCK_TIMEOUT_MS";
    pub const RETRY_LIMIT: &str = "QUILL_RETRY_LIMIT";
    pub const BACKOFF_INITIAL_MS: &str = "QUILL_BACKOFF_INITIAL_MS";
    pub const BACKOFF_MULTIPLIER: &str = "QUILL_BACKOFF_MULTIPLIER";
    pub const BACKOFF_MAX_MS: &str = "QUILL_BACKOFF_MAX_MS";
    pub const CLAIM_INTERVAL_MS: &str = "QUILL_CLAIM_INTERVAL_MS";
    pub const MIN_RECLAIM_IDLE_MS: &str = "QUILL_MIN_RECLAIM_IDLE_MS";
    pub const MAX_LEN: &str = "QUILL_MAX_LEN";
    pub const DLQ_CHECK_INTERVAL_MS: &str = "QUILL_DLQ_CHECK_INTERVAL_MS";
    pub const DLQ_ALERT_THRESHOLD: &str = "QUILL_DLQ_ALERT_THRESHOLD";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a worker process needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub engine: EngineConfig,
    /// Retention for producers; `0` in the environment disables trimming.
    pub producer_max_len: Option<usize>,
    pub dead_letter: DeadLetterMonitorConfig,
}

impl WorkerConfig {
    /// Read `QUILL_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, with an injected variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let stream = env.string(keys::STREAM).unwrap_or_else(|| GENERATION_STREAM.to_string());
        let group = env.string(keys::GROUP).unwrap_or_else(|| DEFAULT_GROUP.to_string());
        let mut engine = EngineConfig::new(stream, group);

        if let Some(consumer) = env.string(keys::CONSUMER) {
            engine = engine.with_consumer(consumer);
        }
        if let Some(batch_size) = env.parse::<usize>(keys::BATCH_SIZE)? {
            engine = engine.with_batch_size(batch_size);
        }
        if let Some(block) = env.millis(keys::BLOCK_TIMEOUT_MS)? {
            engine = engine.with_block_timeout(block);
        }
        if let Some(retry_limit) = env.parse::<u64>(keys::RETRY_LIMIT)? {
            engine = engine.with_retry_limit(retry_limit);
        }

        let defaults = BackoffPolicy::default();
        let multiplier = match env.parse::<f64>(keys::BACKOFF_MULTIPLIER)? {
            Some(m) if !m.is_finite() || m < 1.0 => {
                return Err(ConfigError::Invalid {
                    key: keys::BACKOFF_MULTIPLIER,
                    value: m.to_string(),
                    reason: "must be a finite number >= 1".into(),
                });
            }
            Some(m) => m,
            None => defaults.multiplier(),
        };
        engine = engine.with_backoff(BackoffPolicy::new(
            env.millis(keys::BACKOFF_INITIAL_MS)?.unwrap_or(defaults.initial()),
            multiplier,
            env.millis(keys::BACKOFF_MAX_MS)?.unwrap_or(defaults.max()),
        ));

        if let Some(interval) = env.millis(keys::CLAIM_INTERVAL_MS)? {
            engine = engine.with_claim_interval(interval);
        }
        if let Some(idle) = env.millis(keys::MIN_RECLAIM_IDLE_MS)? {
            engine = engine.with_min_reclaim_idle(idle);
        }

        let producer_max_len = match env.parse::<usize>(keys::MAX_LEN)? {
            Some(0) => None,
            Some(n) => Some(n),
            None => Some(DEFAULT_MAX_LEN),
        };

        let mut dead_letter = DeadLetterMonitorConfig::default();
        if let Some(interval) = env.millis(keys::DLQ_CHECK_INTERVAL_MS)? {
            dead_letter.interval = interval;
        }
        if let Some(threshold) = env.parse::<u64>(keys::DLQ_ALERT_THRESHOLD)? {
            dead_letter.alert_threshold = threshold;
        }

        Ok(Self {
            redis_url: env
                .string(keys::REDIS_URL)
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            engine,
            producer_max_len,
            dead_letter,
        })
    }

    /// Producer on `store` with the configured retention.
    pub fn producer<S: StreamStore>(&self, store: S) -> Producer<S> {
        Producer::new(store).with_max_len(self.producer_max_len)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Trimmed value; blank counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.engine.stream, GENERATION_STREAM);
        assert_eq!(config.engine.group, DEFAULT_GROUP);
        assert_eq!(config.engine.retry_limit, 5);
        assert_eq!(config.engine.backoff, BackoffPolicy::default());
        assert_eq!(config.producer_max_len, Some(DEFAULT_MAX_LEN));
        assert_eq!(config.dead_letter, DeadLetterMonitorConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            (keys::STREAM, "quill:jobs:foundation"),
            (keys::GROUP, "foundation-workers"),
            (keys::CONSUMER, "host-1"),
            (keys::BATCH_SIZE, "25"),
            (keys::RETRY_LIMIT, "3"),
            (keys::BACKOFF_INITIAL_MS, "500"),
            (keys::BACKOFF_MULTIPLIER, "3"),
            (keys::BACKOFF_MAX_MS, "10000"),
            (keys::MIN_RECLAIM_IDLE_MS, "1000"),
            (keys::MAX_LEN, "0"),
            (keys::DLQ_ALERT_THRESHOLD, " 7 "),
        ])
        .unwrap();

        assert_eq!(config.engine.stream, "quill:jobs:foundation");
        assert_eq!(config.engine.consumer, "host-1");
        assert_eq!(config.engine.batch_size, 25);
        assert_eq!(config.engine.retry_limit, 3);
        assert_eq!(
            config.engine.backoff,
            BackoffPolicy::new(Duration::from_millis(500), 3.0, Duration::from_secs(10))
        );
        assert_eq!(config.engine.reclaim_threshold(), Duration::from_secs(20));
        assert_eq!(config.producer_max_len, None);
        assert_eq!(config.dead_letter.alert_threshold, 7);
    }

    #[test]
    fn malformed_number_names_the_key() {
        let err = load(&[(keys::RETRY_LIMIT, "five")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: keys::RETRY_LIMIT, ref value, .. } if value == "five"
        ));
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        let err = load(&[(keys::BACKOFF_MULTIPLIER, "0.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: keys::BACKOFF_MULTIPLIER, .. }));
    }

    #[test]
    fn producer_uses_configured_retention() {
        let store = quill_messaging::InMemoryStreamStore::arc();

        let bounded = load(&[(keys::MAX_LEN, "2")]).unwrap().producer(store.clone());
        assert_eq!(bounded.max_len(), Some(2));
        let unbounded = load(&[(keys::MAX_LEN, "0")]).unwrap().producer(store.clone());
        assert_eq!(unbounded.max_len(), None);

        let ctx = quill_messaging::CorrelationContext::new();
        for n in 0..4 {
            let envelope = quill_messaging::MessageEnvelope::new(
                format!("job-{n}"),
                "chapter_gen",
                quill_core::TenantId::new(),
                quill_core::ProjectId::new(),
                &serde_json::json!({"chapter": n}),
            )
            .unwrap();
            bounded.publish(&ctx, GENERATION_STREAM, envelope).unwrap();
        }
        assert_eq!(store.len(GENERATION_STREAM).unwrap(), 2);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[(keys::GROUP, "   ")]).unwrap();
        assert_eq!(config.engine.group, DEFAULT_GROUP);
    }
}
