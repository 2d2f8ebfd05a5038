//! Consumer engine configuration, lifecycle state and statistics.

use std::time::Duration;

use uuid::Uuid;

use quill_messaging::{BackoffPolicy, StartPosition, StoreError};

use crate::dead_letter::{DEFAULT_DEAD_LETTER_PREFIX, dead_letter_stream_with_prefix};

/// Consumer engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stream: String,
    pub group: String,
    /// Consumer identity within the group; unique per running engine.
    pub consumer: String,
    /// Max new entries requested per read.
    pub batch_size: usize,
    /// How long a read waits for new entries.
    pub block_timeout: Duration,
    /// Delivery count at which an entry is dead-lettered instead of retried.
    pub retry_limit: u64,
    pub backoff: BackoffPolicy,
    /// How often the group-wide stale entry scan runs.
    pub claim_interval: Duration,
    /// Lower bound of the reclaim threshold.
    pub min_reclaim_idle: Duration,
    /// Rows fetched per pending table scan.
    pub pending_scan_count: usize,
    /// Sleep after a store error before the next iteration.
    pub error_backoff: Duration,
    pub start_position: StartPosition,
    pub dead_letter_prefix: String,
}

impl EngineConfig {
    /// Defaults for `stream`/`group` with a generated consumer identity.
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        let group = group.into();
        Self {
            stream: stream.into(),
            consumer: format!("{}-{}", group, Uuid::now_v7()),
            group,
            batch_size: 10,
            block_timeout: Duration::from_secs(2),
            retry_limit: 5,
            backoff: BackoffPolicy::default(),
            claim_interval: Duration::from_secs(30),
            min_reclaim_idle: Duration::from_secs(5 * 60),
            pending_scan_count: 100,
            error_backoff: Duration::from_secs(1),
            start_position: StartPosition::Beginning,
            dead_letter_prefix: DEFAULT_DEAD_LETTER_PREFIX.to_string(),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u64) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_claim_interval(mut self, claim_interval: Duration) -> Self {
        self.claim_interval = claim_interval;
        self
    }

    pub fn with_min_reclaim_idle(mut self, min_reclaim_idle: Duration) -> Self {
        self.min_reclaim_idle = min_reclaim_idle;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Idle time after which another consumer's pending entry is taken over:
    /// `max(min_reclaim_idle, 2 * backoff.max)`.
    pub fn reclaim_threshold(&self) -> Duration {
        self.backoff.reclaim_threshold(self.min_reclaim_idle)
    }

    pub fn dead_letter_stream(&self) -> String {
        dead_letter_stream_with_prefix(&self.dead_letter_prefix, &self.stream)
    }
}

/// Lifecycle of a consumer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("consumer engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Engine runtime statistics (process-local, reset on restart).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    /// Handler invocations.
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Entries acked without dispatch because they could not be decoded.
    pub dropped_malformed: u64,
    /// Entries acked without dispatch because no handler matched their type.
    pub dropped_unroutable: u64,
    /// Entries taken over from other consumers.
    pub reclaimed: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
}
