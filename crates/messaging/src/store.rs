//! Append-log store abstraction with consumer-group semantics.
//!
//! The primitives mirror what Redis Streams offers (XADD, XGROUP CREATE,
//! XREADGROUP, XACK, XCLAIM, XPENDING) but any ordered log with consumer
//! groups qualifies.
//!
//! ## Delivery counts
//!
//! The store, not the consumer, owns the delivery count of a pending entry:
//! it is `1` after the first delivery through `read_group` and goes up by one
//! on every successful `claim`. Retry accounting built on top of it survives
//! consumer restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;

/// Field carrying the JSON-serialized envelope.
pub const DATA_FIELD: &str = "data";

/// Field/value pairs of one log entry.
pub type StreamFields = BTreeMap<String, String>;

/// Store-assigned identifier of a log entry (unit of Ack and Claim).
///
/// Distinct from the envelope's logical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: StreamFields,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// One row of a group's pending entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub owner: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver everything already in the stream.
    #[default]
    Beginning,
    /// Deliver only entries appended after the group is created.
    Latest,
}

/// Filter for `StreamStore::pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    /// Inclusive lower bound (`None` = start of the table).
    pub start: Option<EntryId>,
    /// Inclusive upper bound (`None` = end of the table).
    pub end: Option<EntryId>,
    pub count: usize,
    /// Restrict to entries owned by this consumer.
    pub consumer: Option<String>,
}

impl PendingQuery {
    /// Whole table, up to `count` rows.
    pub fn all(count: usize) -> Self {
        Self {
            start: None,
            end: None,
            count,
            consumer: None,
        }
    }

    /// Entries owned by `consumer`, up to `count` rows.
    pub fn owned_by(consumer: impl Into<String>, count: usize) -> Self {
        Self {
            consumer: Some(consumer.into()),
            ..Self::all(count)
        }
    }
}

/// Durable, append-only log with consumer groups.
///
/// ## Thread Safety
///
/// Implementations must be shareable across threads: a producer and several
/// consumer engines typically hold the same store.
pub trait StreamStore: Send + Sync {
    /// Append `fields` to `stream`, trimming it to roughly `max_len` entries.
    ///
    /// Trimming is best-effort; implementations may keep more.
    fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError>;

    /// Create `group` on `stream` (creating the stream if needed).
    ///
    /// Idempotent: an already existing group is success.
    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting
    /// at most `block` for new ones. An empty result means the wait timed out.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Remove entries from the group's pending table. Returns how many were pending.
    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`,
    /// bumping their delivery count. Entries not eligible are skipped.
    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Inspect the group's pending entry table.
    fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Number of entries currently retained in `stream`.
    fn len(&self, stream: &str) -> Result<u64, StoreError>;

    /// Oldest-first read of up to `count` entries, outside any group.
    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError>;

    /// Delete entries from `stream`. Returns how many existed.
    fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, StoreError>;
}

impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError> {
        (**self).append(stream, fields, max_len)
    }

    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError> {
        (**self).create_group(stream, group, start)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).read_group(stream, group, consumer, count, block)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        (**self).ack(stream, group, ids)
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).claim(stream, group, consumer, min_idle, ids)
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        (**self).pending(stream, group, query)
    }

    fn len(&self, stream: &str) -> Result<u64, StoreError> {
        (**self).len(stream)
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).range(stream, count)
    }

    fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        (**self).delete(stream, ids)
    }
}
