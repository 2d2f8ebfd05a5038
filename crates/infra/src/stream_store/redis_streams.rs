//! Redis Streams backed `StreamStore`.
//!
//! ## Command mapping
//!
//! | Operation      | Command                                          |
//! |----------------|--------------------------------------------------|
//! | `append`       | `XADD key [MAXLEN ~ n] * field value ...`        |
//! | `create_group` | `XGROUP CREATE key group {0,$} MKSTREAM`         |
//! | `read_group`   | `XREADGROUP GROUP g c COUNT n [BLOCK ms] STREAMS key >` |
//! | `ack`          | `XACK key group id ...`                          |
//! | `claim`        | `XCLAIM key group consumer min-idle-ms id ...`   |
//! | `pending`      | `XPENDING key group - + count [consumer]`        |
//! | `len`          | `XLEN key`                                       |
//! | `range`        | `XRANGE key - + COUNT n`                         |
//! | `delete`       | `XDEL key id ...`                                |
//!
//! Each call opens its own connection, so a blocking `XREADGROUP` on one
//! engine never stalls another caller sharing the store.

use std::sync::Arc;
use std::time::Duration;

use redis::Value;
use tracing::debug;

use quill_messaging::{
    EntryId, PendingEntry, PendingQuery, StartPosition, StoreError, StreamEntry, StreamFields,
    StreamStore,
};

use crate::config::WorkerConfig;

#[derive(Debug, Clone)]
pub struct RedisStreamStore {
    client: Arc<redis::Client>,
}

impl RedisStreamStore {
    /// Validate `redis_url` and build the store. No connection is made yet.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Store at `config.redis_url` (`QUILL_REDIS_URL`).
    pub fn from_config(config: &WorkerConfig) -> Result<Self, StoreError> {
        debug!(redis_url = %config.redis_url, "opening redis stream store");
        Self::new(&config.redis_url)
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd, name: &str) -> Result<T, StoreError> {
        let mut conn = self.connection()?;
        cmd.query(&mut conn).map_err(|e| map_error(name, e))
    }
}

fn map_error(command: &str, err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StoreError::Connection(format!("{command} failed: {err}"))
    } else {
        StoreError::Command(format!("{command} failed: {err}"))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl StreamStore for RedisStreamStore {
    fn append(
        &self,
        stream: &str,
        fields: &StreamFields,
        max_len: Option<usize>,
    ) -> Result<EntryId, StoreError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = self.query(&cmd, "XADD")?;
        Ok(EntryId::from(id))
    }

    fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), StoreError> {
        let start_id = match start {
            StartPosition::Beginning => "0",
            StartPosition::Latest => "$",
        };
        let mut conn = self.connection()?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(map_error("XGROUP CREATE", e)),
        }
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        // BLOCK 0 means "forever" to Redis; a zero wait omits BLOCK instead.
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(millis(block).max(1));
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Value = self.query(&cmd, "XREADGROUP")?;
        parse_read_reply(reply)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.as_str());
        }
        self.query(&cmd, "XACK")
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle));
        for id in ids {
            cmd.arg(id.as_str());
        }
        let reply: Value = self.query(&cmd, "XCLAIM")?;
        parse_entries(reply)
    }

    fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream)
            .arg(group)
            .arg(query.start.as_ref().map_or("-", EntryId::as_str))
            .arg(query.end.as_ref().map_or("+", EntryId::as_str))
            .arg(query.count.max(1));
        if let Some(consumer) = &query.consumer {
            cmd.arg(consumer);
        }
        let reply: Value = self.query(&cmd, "XPENDING")?;
        parse_pending_reply(reply)
    }

    fn len(&self, stream: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("XLEN").arg(stream), "XLEN")
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let reply: Value = self.query(
            redis::cmd("XRANGE")
                .arg(stream)
                .arg("-")
                .arg("+")
                .arg("COUNT")
                .arg(count.max(1)),
            "XRANGE",
        )?;
        parse_entries(reply)
    }

    fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.as_str());
        }
        self.query(&cmd, "XDEL")
    }
}

fn text(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::Data(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Ok(s.clone()),
        other => Err(StoreError::malformed(format!("expected string, got {other:?}"))),
    }
}

fn integer(value: &Value) -> Result<u64, StoreError> {
    match value {
        Value::Int(n) => u64::try_from(*n)
            .map_err(|_| StoreError::malformed(format!("negative integer {n}"))),
        Value::Data(bytes) => String::from_utf8_lossy(bytes)
            .parse()
            .map_err(|_| StoreError::malformed("expected integer")),
        other => Err(StoreError::malformed(format!("expected integer, got {other:?}"))),
    }
}

/// `XREADGROUP` reply: nil on timeout, else `[[stream, [entry, ...]], ...]`.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, StoreError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        other => return Err(StoreError::malformed(format!("unexpected XREADGROUP reply {other:?}"))),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(mut pair) = stream else {
            return Err(StoreError::malformed("stream reply is not a pair"));
        };
        if pair.len() != 2 {
            return Err(StoreError::malformed("stream reply is not a pair"));
        }
        entries.extend(parse_entries(pair.remove(1))?);
    }
    Ok(entries)
}

/// List of `[id, [field, value, ...]]`. Nil slots (deleted entries in
/// `XCLAIM` replies) are skipped.
fn parse_entries(reply: Value) -> Result<Vec<StreamEntry>, StoreError> {
    let items = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(items) => items,
        other => return Err(StoreError::malformed(format!("expected entry list, got {other:?}"))),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Nil => continue,
            Value::Bulk(parts) => {
                if let Some(entry) = parse_entry(&parts)? {
                    entries.push(entry);
                }
            }
            other => return Err(StoreError::malformed(format!("expected entry, got {other:?}"))),
        }
    }
    Ok(entries)
}

fn parse_entry(parts: &[Value]) -> Result<Option<StreamEntry>, StoreError> {
    let [id, fields] = parts else {
        return Err(StoreError::malformed("entry is not [id, fields]"));
    };
    let id = EntryId::from(text(id)?);

    let values = match fields {
        // Entry trimmed or deleted while still pending.
        Value::Nil => return Ok(None),
        Value::Bulk(values) => values,
        other => return Err(StoreError::malformed(format!("expected field list, got {other:?}"))),
    };
    if values.len() % 2 != 0 {
        return Err(StoreError::malformed(format!("odd field list for entry {id}")));
    }

    let mut map = StreamFields::new();
    for pair in values.chunks_exact(2) {
        map.insert(text(&pair[0])?, text(&pair[1])?);
    }
    Ok(Some(StreamEntry { id, fields: map }))
}

/// Extended `XPENDING` reply: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_pending_reply(reply: Value) -> Result<Vec<PendingEntry>, StoreError> {
    let rows = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(rows) => rows,
        other => return Err(StoreError::malformed(format!("unexpected XPENDING reply {other:?}"))),
    };

    rows.iter()
        .map(|row| {
            let Value::Bulk(cols) = row else {
                return Err(StoreError::malformed("pending row is not a list"));
            };
            let [id, owner, idle, count] = cols.as_slice() else {
                return Err(StoreError::malformed("pending row has wrong arity"));
            };
            Ok(PendingEntry {
                id: EntryId::from(text(id)?),
                owner: text(owner)?,
                idle: Duration::from_millis(integer(idle)?),
                delivery_count: integer(count)?,
            })
        })
        .collect()
}
