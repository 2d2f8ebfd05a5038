//! Dead-letter stream: records, inspection/replay and a depth monitor.
//!
//! Entries that exhaust their retry budget are appended to a derived stream
//! (`dlq:<stream>`) and acknowledged on the original one, so they are never
//! redelivered there. Operators consume the dead-letter stream out of band;
//! `DeadLetterQueue` covers the common listing/replay/discard chores.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use quill_messaging::{
    DATA_FIELD, EntryId, EnvelopeError, MessageEnvelope, StoreError, StreamEntry, StreamFields,
    StreamStore,
};

use crate::producer::DEFAULT_MAX_LEN;

/// Default prefix of dead-letter streams.
pub const DEFAULT_DEAD_LETTER_PREFIX: &str = "dlq:";

const ORIGINAL_STREAM_FIELD: &str = "original_stream";
const ERROR_FIELD: &str = "error";
const FAILED_AT_FIELD: &str = "failed_at";
const ORIGINAL_ENTRY_FIELD: &str = "original_entry_id";
const DELIVERY_COUNT_FIELD: &str = "delivery_count";

/// Dead-letter stream for `stream` under the default prefix.
pub fn dead_letter_stream(stream: &str) -> String {
    dead_letter_stream_with_prefix(DEFAULT_DEAD_LETTER_PREFIX, stream)
}

pub fn dead_letter_stream_with_prefix(prefix: &str, stream: &str) -> String {
    format!("{prefix}{stream}")
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed dead-letter entry {entry_id}: {reason}")]
    Malformed { entry_id: EntryId, reason: String },

    #[error("dead-letter entry not found: {0}")]
    NotFound(EntryId),
}

/// One entry of a dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Id within the dead-letter stream (set when read back).
    pub entry_id: Option<EntryId>,
    pub original_stream: String,
    /// Envelope JSON exactly as it was stored on the original stream.
    pub data: String,
    pub error: String,
    /// Unix seconds.
    pub failed_at: i64,
    pub original_entry_id: Option<EntryId>,
    pub delivery_count: Option<u64>,
}

impl DeadLetterRecord {
    pub fn new(
        original_stream: impl Into<String>,
        data: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: None,
            original_stream: original_stream.into(),
            data: data.into(),
            error: error.into(),
            failed_at: Utc::now().timestamp(),
            original_entry_id: None,
            delivery_count: None,
        }
    }

    pub fn with_origin(mut self, entry_id: EntryId, delivery_count: u64) -> Self {
        self.original_entry_id = Some(entry_id);
        self.delivery_count = Some(delivery_count);
        self
    }

    pub fn to_fields(&self) -> StreamFields {
        let mut fields = StreamFields::from([
            (ORIGINAL_STREAM_FIELD.to_string(), self.original_stream.clone()),
            (DATA_FIELD.to_string(), self.data.clone()),
            (ERROR_FIELD.to_string(), self.error.clone()),
            (FAILED_AT_FIELD.to_string(), self.failed_at.to_string()),
        ]);
        if let Some(id) = &self.original_entry_id {
            fields.insert(ORIGINAL_ENTRY_FIELD.to_string(), id.to_string());
        }
        if let Some(count) = self.delivery_count {
            fields.insert(DELIVERY_COUNT_FIELD.to_string(), count.to_string());
        }
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self, DeadLetterError> {
        let required = |name: &str| {
            entry
                .field(name)
                .map(str::to_string)
                .ok_or_else(|| DeadLetterError::Malformed {
                    entry_id: entry.id.clone(),
                    reason: format!("missing field {name}"),
                })
        };

        let failed_at = required(FAILED_AT_FIELD)?
            .parse::<i64>()
            .map_err(|e| DeadLetterError::Malformed {
                entry_id: entry.id.clone(),
                reason: format!("failed_at: {e}"),
            })?;

        Ok(Self {
            entry_id: Some(entry.id.clone()),
            original_stream: required(ORIGINAL_STREAM_FIELD)?,
            data: required(DATA_FIELD)?,
            error: required(ERROR_FIELD)?,
            failed_at,
            original_entry_id: entry.field(ORIGINAL_ENTRY_FIELD).map(EntryId::from),
            delivery_count: entry
                .field(DELIVERY_COUNT_FIELD)
                .and_then(|c| c.parse().ok()),
        })
    }

    /// Decode the dead-lettered envelope.
    pub fn envelope(&self) -> Result<MessageEnvelope, EnvelopeError> {
        MessageEnvelope::from_json(&self.data)
    }
}

/// Operator view over the dead-letter stream of one original stream.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue<S> {
    store: S,
    original_stream: String,
    dead_letter_stream: String,
}

impl<S: StreamStore> DeadLetterQueue<S> {
    pub fn new(store: S, original_stream: impl Into<String>) -> Self {
        let original_stream = original_stream.into();
        Self {
            dead_letter_stream: dead_letter_stream(&original_stream),
            original_stream,
            store,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.dead_letter_stream = dead_letter_stream_with_prefix(prefix, &self.original_stream);
        self
    }

    pub fn stream(&self) -> &str {
        &self.dead_letter_stream
    }

    pub fn depth(&self) -> Result<u64, StoreError> {
        self.store.len(&self.dead_letter_stream)
    }

    /// Oldest-first records. Malformed entries are skipped with a warning.
    pub fn list(&self, count: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let entries = self.store.range(&self.dead_letter_stream, count)?;
        Ok(entries
            .iter()
            .filter_map(|entry| match DeadLetterRecord::from_entry(entry) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(stream = %self.dead_letter_stream, error = %err, "skipping malformed dead-letter entry");
                    None
                }
            })
            .collect())
    }

    fn find(&self, entry_id: &EntryId) -> Result<DeadLetterRecord, DeadLetterError> {
        let depth = usize::try_from(self.depth()?).unwrap_or(usize::MAX);
        let entry = self
            .store
            .range(&self.dead_letter_stream, depth)?
            .into_iter()
            .find(|e| &e.id == entry_id)
            .ok_or_else(|| DeadLetterError::NotFound(entry_id.clone()))?;
        DeadLetterRecord::from_entry(&entry)
    }

    /// Re-append the original envelope to its stream and remove the
    /// dead-letter entry. The replayed entry starts with a fresh delivery count.
    pub fn replay(&self, entry_id: &EntryId) -> Result<EntryId, DeadLetterError> {
        let record = self.find(entry_id)?;
        let fields = StreamFields::from([(DATA_FIELD.to_string(), record.data.clone())]);
        let new_id = self
            .store
            .append(&record.original_stream, &fields, Some(DEFAULT_MAX_LEN))?;
        self.store
            .delete(&self.dead_letter_stream, std::slice::from_ref(entry_id))?;

        info!(
            dead_letter_id = %entry_id,
            stream = %record.original_stream,
            entry_id = %new_id,
            "dead-lettered job replayed"
        );
        Ok(new_id)
    }

    /// Drop a dead-letter entry for good.
    pub fn discard(&self, entry_id: &EntryId) -> Result<(), DeadLetterError> {
        let deleted = self
            .store
            .delete(&self.dead_letter_stream, std::slice::from_ref(entry_id))?;
        if deleted == 0 {
            return Err(DeadLetterError::NotFound(entry_id.clone()));
        }
        Ok(())
    }
}

/// Dead-letter monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterMonitorConfig {
    pub interval: Duration,
    /// Depth above which a warning is emitted.
    pub alert_threshold: u64,
}

impl Default for DeadLetterMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            alert_threshold: 100,
        }
    }
}

/// Periodically reports dead-letter depth. Diagnostic only.
#[derive(Debug, Clone)]
pub struct DeadLetterMonitor<S> {
    store: S,
    dead_letter_stream: String,
    config: DeadLetterMonitorConfig,
}

/// One depth observation of a dead-letter stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthReport {
    pub depth: u64,
    /// `depth` is strictly above the configured alert threshold.
    pub alerting: bool,
}

/// Handle to stop a spawned monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl<S: StreamStore> DeadLetterMonitor<S> {
    pub fn new(
        store: S,
        dead_letter_stream: impl Into<String>,
        config: DeadLetterMonitorConfig,
    ) -> Self {
        Self {
            store,
            dead_letter_stream: dead_letter_stream.into(),
            config,
        }
    }

    /// Read the current depth once and warn when it is above the threshold.
    pub fn check_once(&self) -> Result<DepthReport, StoreError> {
        let depth = self.store.len(&self.dead_letter_stream)?;
        let alerting = depth > self.config.alert_threshold;
        if alerting {
            warn!(
                stream = %self.dead_letter_stream,
                depth,
                threshold = self.config.alert_threshold,
                "dead-letter queue above alert threshold"
            );
        } else {
            debug!(stream = %self.dead_letter_stream, depth, "dead-letter queue depth");
        }
        Ok(DepthReport { depth, alerting })
    }

    /// Run `check_once` every `interval` on a background thread.
    pub fn spawn(self) -> std::io::Result<MonitorHandle>
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("dlq-monitor:{}", self.dead_letter_stream);

        let join = thread::Builder::new().name(name).spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(self.config.interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(err) = self.check_once() {
                            warn!(stream = %self.dead_letter_stream, error = %err, "dead-letter depth check failed");
                        }
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(MonitorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{ProjectId, TenantId};
    use quill_messaging::InMemoryStreamStore;

    const STREAM: &str = "quill:jobs:generation";

    fn envelope_json() -> String {
        MessageEnvelope::new(
            "job-9",
            "chapter_gen",
            TenantId::new(),
            ProjectId::new(),
            &serde_json::json!({"chapter": 1}),
        )
        .unwrap()
        .to_json()
        .unwrap()
    }

    fn seed(store: &InMemoryStreamStore, n: usize) -> Vec<EntryId> {
        (0..n)
            .map(|i| {
                let record = DeadLetterRecord::new(STREAM, envelope_json(), format!("boom {i}"))
                    .with_origin(EntryId::from(format!("1-{i}")), 6);
                store
                    .append(&dead_letter_stream(STREAM), &record.to_fields(), None)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn record_fields_round_trip() {
        let record = DeadLetterRecord::new(STREAM, envelope_json(), "handler exploded")
            .with_origin(EntryId::from("5-5"), 4);
        let entry = StreamEntry {
            id: EntryId::from("9-9"),
            fields: record.to_fields(),
        };

        let back = DeadLetterRecord::from_entry(&entry).unwrap();
        assert_eq!(back.entry_id, Some(EntryId::from("9-9")));
        assert_eq!(back.error, "handler exploded");
        assert_eq!(back.original_entry_id, Some(EntryId::from("5-5")));
        assert_eq!(back.delivery_count, Some(4));
        assert_eq!(back.envelope().unwrap().id(), "job-9");
    }

    #[test]
    fn record_without_error_is_malformed() {
        let mut fields = DeadLetterRecord::new(STREAM, "{}", "x").to_fields();
        fields.remove(ERROR_FIELD);
        let entry = StreamEntry {
            id: EntryId::from("1-1"),
            fields,
        };
        assert!(matches!(
            DeadLetterRecord::from_entry(&entry),
            Err(DeadLetterError::Malformed { .. })
        ));
    }

    #[test]
    fn replay_moves_entry_back_to_original_stream() {
        let store = InMemoryStreamStore::arc();
        let ids = seed(&store, 2);
        let dlq = DeadLetterQueue::new(store.clone(), STREAM);

        assert_eq!(dlq.depth().unwrap(), 2);
        dlq.replay(&ids[0]).unwrap();

        assert_eq!(dlq.depth().unwrap(), 1);
        let replayed = store.range(STREAM, 10).unwrap();
        assert_eq!(replayed.len(), 1);
        let envelope = MessageEnvelope::from_json(replayed[0].field(DATA_FIELD).unwrap()).unwrap();
        assert_eq!(envelope.id(), "job-9");
    }

    #[test]
    fn replay_of_unknown_entry_is_not_found() {
        let store = InMemoryStreamStore::arc();
        seed(&store, 1);
        let dlq = DeadLetterQueue::new(store, STREAM);
        assert!(matches!(
            dlq.replay(&EntryId::from("0-999")),
            Err(DeadLetterError::NotFound(_))
        ));
    }

    #[test]
    fn discard_and_list() {
        let store = InMemoryStreamStore::arc();
        let ids = seed(&store, 3);
        let dlq = DeadLetterQueue::new(store, STREAM);

        dlq.discard(&ids[1]).unwrap();
        let listed = dlq.list(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].error, "boom 0");
        assert_eq!(listed[1].error, "boom 2");
        assert!(dlq.discard(&ids[1]).is_err());
    }

    #[test]
    fn monitor_reports_depth_against_threshold() {
        let store = InMemoryStreamStore::arc();
        seed(&store, 3);
        let monitor = |alert_threshold| {
            DeadLetterMonitor::new(
                store.clone(),
                dead_letter_stream(STREAM),
                DeadLetterMonitorConfig {
                    interval: Duration::from_millis(10),
                    alert_threshold,
                },
            )
        };

        assert_eq!(
            monitor(2).check_once().unwrap(),
            DepthReport { depth: 3, alerting: true }
        );
        // At the threshold is not above it.
        assert_eq!(
            monitor(3).check_once().unwrap(),
            DepthReport { depth: 3, alerting: false }
        );
        assert!(!monitor(10).check_once().unwrap().alerting);

        let handle = monitor(2).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        handle.shutdown();
    }
}
