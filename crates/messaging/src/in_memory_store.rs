//! In-memory stream store for tests/dev.
//!
//! Follows Redis Streams semantics where they matter to consumers:
//! - group reads only hand out never-delivered entries
//! - delivery counts start at 1 and grow on every claim
//! - claiming an entry that was trimmed or deleted drops it from the pending table
//! - `read_group` blocks (up to the timeout) until something is appended

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::StoreError;
use crate::store::{
    EntryId, PendingEntry, PendingQuery, StartPosition, StreamEntry, StreamFields, StreamStore,
};

#[derive(Debug)]
struct PendingState {
    owner: String,
    last_delivery: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<u64, StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    streams: HashMap<String, StreamState>,
}

/// In-memory append log with consumer groups.
///
/// - No IO
/// - Exact trimming (a valid form of "approximate")
/// - `Duration::ZERO` as block timeout means "do not wait"
#[derive(Debug, Default)]
pub struct InMemoryStreamStore {
    inner: Mutex<Inner>,
    appended: Condvar,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Entry ids look like Redis ids (`<millis>-<seq>`); the sequence part is
/// globally unique and orders entries.
fn seq_of(id: &EntryId) -> Option<u64> {
    id.as_str().rsplit_once('-')?.1.parse().ok()
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::command(format!(
        "NOGROUP no such key '{stream}' or consumer group '{group}'"
    ))
}

fn group_mut<'a>(
    inner: &'a mut Inner,
    stream: &str,
    group: &str,
) -> Result<&'a mut StreamState, StoreError> {
    match inner.streams.get_mut(stream) {
        Some(state) if state.groups.contains_key(group) => Ok(state),
        _ => Err(no_group(stream, group)),
    }
}

impl StreamStore for InMemoryStreamStore {
    fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError> {
        let mut inner = self.state()?;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let id = EntryId::new(format!("{}-{}", Utc::now().timestamp_millis(), seq));

        let state = inner.streams.entry(stream.to_string()).or_default();
        state.entries.insert(
            seq,
            StreamEntry {
                id: id.clone(),
                fields: fields.clone(),
            },
        );
        if let Some(max_len) = max_len {
            while state.entries.len() > max_len {
                state.entries.pop_first();
            }
        }

        drop(inner);
        self.appended.notify_all();
        Ok(id)
    }

    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError> {
        let mut inner = self.state()?;
        let current = inner.next_seq;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: match start {
                    StartPosition::Beginning => 0,
                    StartPosition::Latest => current,
                },
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        // A block too large to represent waits until an append arrives.
        let deadline = Instant::now().checked_add(block);
        let mut inner = self.state()?;

        loop {
            let state = group_mut(&mut inner, stream, group)?;
            let StreamState { entries, groups } = state;
            let Some(group_state) = groups.get_mut(group) else {
                return Err(no_group(stream, group));
            };

            let fresh: Vec<(u64, StreamEntry)> = entries
                .range(group_state.last_delivered + 1..)
                .take(count)
                .map(|(seq, entry)| (*seq, entry.clone()))
                .collect();

            if !fresh.is_empty() {
                let now = Instant::now();
                let mut delivered = Vec::with_capacity(fresh.len());
                for (seq, entry) in fresh {
                    group_state.last_delivered = seq;
                    group_state.pending.insert(
                        seq,
                        PendingState {
                            owner: consumer.to_string(),
                            last_delivery: now,
                            delivery_count: 1,
                        },
                    );
                    delivered.push(entry);
                }
                return Ok(delivered);
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    self.appended
                        .wait_timeout(inner, deadline - now)
                        .map_err(|_| StoreError::Poisoned)?
                        .0
                }
                None => self.appended.wait(inner).map_err(|_| StoreError::Poisoned)?,
            };
        }
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut inner = self.state()?;
        let state = group_mut(&mut inner, stream, group)?;
        let Some(group_state) = state.groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let acked = ids
            .iter()
            .filter_map(seq_of)
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut inner = self.state()?;
        let state = group_mut(&mut inner, stream, group)?;
        let StreamState { entries, groups } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Err(no_group(stream, group));
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for seq in ids.iter().filter_map(seq_of) {
            let Some(pending) = group_state.pending.get_mut(&seq) else {
                continue;
            };
            if now.duration_since(pending.last_delivery) < min_idle {
                continue;
            }
            match entries.get(&seq) {
                Some(entry) => {
                    pending.owner = consumer.to_string();
                    pending.last_delivery = now;
                    pending.delivery_count += 1;
                    claimed.push(entry.clone());
                }
                None => {
                    group_state.pending.remove(&seq);
                }
            }
        }
        Ok(claimed)
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut inner = self.state()?;
        let state = group_mut(&mut inner, stream, group)?;
        let Some(group_state) = state.groups.get(group) else {
            return Err(no_group(stream, group));
        };

        let start = query.start.as_ref().and_then(seq_of).unwrap_or(0);
        let end = query.end.as_ref().and_then(seq_of).unwrap_or(u64::MAX);
        if start > end {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let rows = group_state
            .pending
            .range(start..=end)
            .filter(|(_, p)| query.consumer.as_deref().is_none_or(|c| p.owner == c))
            .take(query.count)
            .map(|(seq, p)| PendingEntry {
                id: state
                    .entries
                    .get(seq)
                    .map(|e| e.id.clone())
                    .unwrap_or_else(|| EntryId::new(format!("0-{seq}"))),
                owner: p.owner.clone(),
                idle: now.duration_since(p.last_delivery),
                delivery_count: p.delivery_count,
            })
            .collect();
        Ok(rows)
    }

    fn len(&self, stream: &str) -> Result<u64, StoreError> {
        let inner = self.state()?;
        Ok(inner
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let inner = self.state()?;
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.entries.values().take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut inner = self.state()?;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let deleted = ids
            .iter()
            .filter_map(seq_of)
            .filter(|seq| state.entries.remove(seq).is_some())
            .count();
        Ok(deleted as u64)
    }
}
