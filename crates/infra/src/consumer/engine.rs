//! Consumer engine: read loop, dispatch, retries, reclaim and dead-lettering.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use quill_messaging::{
    DATA_FIELD, EntryId, HandlerContext, HandlerRegistry, HandlerResult, JobHandler, JobKind,
    MessageEnvelope, PendingEntry, PendingQuery, StoreError, StreamEntry, StreamStore,
};

use super::types::{ConsumerStats, EngineConfig, EngineError, EngineState};
use crate::dead_letter::DeadLetterRecord;

struct Lifecycle {
    state: EngineState,
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

struct EngineInner<S> {
    store: S,
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    stats: Mutex<ConsumerStats>,
}

/// Loop-local bookkeeping. Nothing here drives retry decisions; delivery
/// counts always come from the store.
#[derive(Debug, Default)]
struct LoopState {
    /// Last handler error per pending entry, used as the dead-letter reason.
    last_errors: HashMap<EntryId, String>,
    last_reclaim: Option<Instant>,
}

/// Competing consumer for one (stream, group) pair.
///
/// `start` spawns the read loop on a dedicated thread; `stop` asks it to exit
/// after the current iteration (an in-flight handler always runs to
/// completion); `wait` joins the thread.
pub struct ConsumerEngine<S> {
    inner: Arc<EngineInner<S>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S> std::fmt::Debug for ConsumerEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerEngine")
            .field("stream", &self.inner.config.stream)
            .field("group", &self.inner.config.group)
            .field("consumer", &self.inner.config.consumer)
            .field("state", &self.lifecycle().state)
            .finish()
    }
}

impl<S> ConsumerEngine<S> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: StreamStore + 'static> ConsumerEngine<S> {
    /// Engine with its own, empty handler registry.
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::with_registry(store, config, Arc::new(HandlerRegistry::new()))
    }

    pub fn with_registry(store: S, config: EngineConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                config,
                registry,
                stats: Mutex::new(ConsumerStats::default()),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Idle,
                shutdown: None,
                join: None,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Register the handler for `kind`; the last registration wins.
    pub fn register_handler<F>(
        &self,
        kind: impl Into<JobKind>,
        handler: F,
    ) -> Option<Arc<dyn JobHandler>>
    where
        F: Fn(&HandlerContext, &MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.registry.register(kind, handler)
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle().state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner.stats().clone()
    }

    /// Ensure the consumer group exists and launch the read loop.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == EngineState::Running {
            return Err(EngineError::AlreadyRunning);
        }
        // A previous run may still be finishing its last iteration.
        if let Some(previous) = lifecycle.join.take() {
            let _ = previous.join();
        }

        let config = &self.inner.config;
        self.inner
            .store
            .create_group(&config.stream, &config.group, config.start_position)?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let join = thread::Builder::new()
            .name(format!("consumer:{}", config.consumer))
            .spawn(move || inner.run(shutdown_rx))?;

        lifecycle.state = EngineState::Running;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.join = Some(join);
        Ok(())
    }

    /// Ask the loop to exit after its current iteration. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle();
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(());
            debug!(consumer = %self.inner.config.consumer, "consumer engine stop requested");
        }
        lifecycle.state = EngineState::Stopped;
    }

    /// Block until the loop thread has exited.
    pub fn wait(&self) {
        let join = self.lifecycle().join.take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!(consumer = %self.inner.config.consumer, "consumer thread panicked");
            }
        }
    }

    /// `stop` followed by `wait`.
    pub fn shutdown(&self) {
        self.stop();
        self.wait();
    }
}

impl<S> EngineInner<S> {
    fn stats(&self) -> MutexGuard<'_, ConsumerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, f: impl FnOnce(&mut ConsumerStats)) {
        f(&mut self.stats());
    }
}

impl<S: StreamStore> EngineInner<S> {
    fn run(&self, shutdown: mpsc::Receiver<()>) {
        let c = &self.config;
        let span = info_span!(
            "consumer",
            stream = %c.stream,
            group = %c.group,
            consumer = %c.consumer
        );
        let _guard = span.enter();
        info!("consumer engine started");

        let mut state = LoopState::default();
        loop {
            match shutdown.try_recv() {
                Err(mpsc::TryRecvError::Empty) => {}
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            }

            if let Err(err) = self.poll_once(&mut state) {
                self.bump(|s| s.store_errors += 1);
                error!(error = %err, "store error in consumer loop");
                // Sleep, but stay responsive to stop.
                match shutdown.recv_timeout(c.error_backoff) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        info!("consumer engine stopped");
    }

    /// One loop iteration: due retries, periodic stale reclaim, then new entries.
    fn poll_once(&self, state: &mut LoopState) -> Result<(), StoreError> {
        let c = &self.config;
        let next_due = self.sweep_due_pending(state)?;

        let reclaim_due = state
            .last_reclaim
            .is_none_or(|at| at.elapsed() >= c.claim_interval);
        if reclaim_due {
            self.reclaim_stale(state)?;
            state.last_reclaim = Some(Instant::now());
        }

        // Do not block past the moment our next retry becomes due.
        let block = next_due.map_or(c.block_timeout, |due| due.min(c.block_timeout));
        let entries =
            self.store
                .read_group(&c.stream, &c.group, &c.consumer, c.batch_size, block)?;
        for entry in entries {
            self.dispatch(state, entry, 1);
        }
        Ok(())
    }

    /// Retry our own pending entries whose backoff has elapsed; dead-letter
    /// the exhausted ones. Returns the wait until the next entry becomes due.
    fn sweep_due_pending(&self, state: &mut LoopState) -> Result<Option<Duration>, StoreError> {
        let c = &self.config;
        let pending = self.store.pending(
            &c.stream,
            &c.group,
            &PendingQuery::owned_by(c.consumer.clone(), c.pending_scan_count),
        )?;

        if pending.len() < c.pending_scan_count {
            // Full view of our pending entries: forget errors of entries we
            // no longer own.
            let live: HashSet<&EntryId> = pending.iter().map(|p| &p.id).collect();
            state.last_errors.retain(|id, _| live.contains(id));
        }

        let mut next_due: Option<Duration> = None;
        for p in pending {
            if p.delivery_count >= c.retry_limit {
                // A peer that claimed the entry meanwhile has reset its idle time.
                self.dead_letter(state, &p, p.idle)?;
                continue;
            }

            let wait = c.backoff.delay_for_delivery(p.delivery_count);
            if p.idle < wait {
                let remaining = wait - p.idle;
                next_due = Some(next_due.map_or(remaining, |d| d.min(remaining)));
                continue;
            }

            // Self-claim: bumps the delivery count before redispatch.
            let claimed = self.store.claim(
                &c.stream,
                &c.group,
                &c.consumer,
                wait,
                std::slice::from_ref(&p.id),
            )?;
            for entry in claimed {
                debug!(
                    entry_id = %entry.id,
                    delivery_count = p.delivery_count + 1,
                    "retrying pending entry"
                );
                self.dispatch(state, entry, p.delivery_count + 1);
            }
        }
        Ok(next_due)
    }

    /// Take over entries other consumers left idle past the reclaim threshold.
    fn reclaim_stale(&self, state: &mut LoopState) -> Result<(), StoreError> {
        let c = &self.config;
        let threshold = c.reclaim_threshold();
        let pending = self.store.pending(
            &c.stream,
            &c.group,
            &PendingQuery::all(c.pending_scan_count),
        )?;

        let stale = pending
            .into_iter()
            .filter(|p| p.owner != c.consumer && p.idle >= threshold);
        for p in stale {
            if p.delivery_count >= c.retry_limit {
                self.dead_letter(state, &p, threshold)?;
                continue;
            }

            let claimed = self.store.claim(
                &c.stream,
                &c.group,
                &c.consumer,
                threshold,
                std::slice::from_ref(&p.id),
            )?;
            for entry in claimed {
                self.bump(|s| s.reclaimed += 1);
                info!(
                    entry_id = %entry.id,
                    previous_owner = %p.owner,
                    idle_ms = u64::try_from(p.idle.as_millis()).unwrap_or(u64::MAX),
                    delivery_count = p.delivery_count + 1,
                    "reclaimed stale entry"
                );
                self.dispatch(state, entry, p.delivery_count + 1);
            }
        }
        Ok(())
    }

    /// Claim `p`, append it to the dead-letter stream, then ack it here.
    fn dead_letter(
        &self,
        state: &mut LoopState,
        p: &PendingEntry,
        min_idle: Duration,
    ) -> Result<(), StoreError> {
        let c = &self.config;
        let claimed = self.store.claim(
            &c.stream,
            &c.group,
            &c.consumer,
            min_idle,
            std::slice::from_ref(&p.id),
        )?;
        let Some(entry) = claimed.into_iter().next() else {
            return self.release_vanished(p);
        };

        let delivery_count = p.delivery_count + 1;
        let reason = state.last_errors.get(&entry.id).cloned().unwrap_or_else(|| {
            format!(
                "retry limit {} reached after {} deliveries",
                c.retry_limit, p.delivery_count
            )
        });
        let record = DeadLetterRecord::new(
            &c.stream,
            entry.field(DATA_FIELD).unwrap_or_default(),
            reason,
        )
        .with_origin(entry.id.clone(), delivery_count);

        let dead_letter_stream = c.dead_letter_stream();
        self.store
            .append(&dead_letter_stream, &record.to_fields(), None)?;
        self.store
            .ack(&c.stream, &c.group, std::slice::from_ref(&entry.id))?;
        state.last_errors.remove(&entry.id);
        self.bump(|s| s.dead_lettered += 1);

        warn!(
            entry_id = %entry.id,
            delivery_count,
            error = %record.error,
            dead_letter_stream = %dead_letter_stream,
            "entry dead-lettered after exhausting retries"
        );
        Ok(())
    }

    /// Follow-up to an empty claim of `p`: either another consumer got there
    /// first, or the entry was trimmed from the stream. Redis before 7.0
    /// keeps the pending row of a trimmed entry (and may hand it to us), so
    /// such a row is acked instead of being swept again forever.
    fn release_vanished(&self, p: &PendingEntry) -> Result<(), StoreError> {
        let c = &self.config;
        let query = PendingQuery {
            start: Some(p.id.clone()),
            end: Some(p.id.clone()),
            count: 1,
            consumer: None,
        };
        let rows = self.store.pending(&c.stream, &c.group, &query)?;
        let orphaned = rows.iter().any(|row| {
            row.id == p.id
                && (row.owner == c.consumer
                    || (row.owner == p.owner && row.delivery_count == p.delivery_count))
        });

        if orphaned {
            self.store
                .ack(&c.stream, &c.group, std::slice::from_ref(&p.id))?;
            warn!(
                entry_id = %p.id,
                delivery_count = p.delivery_count,
                "exhausted entry no longer in stream; acked its pending row"
            );
        } else {
            debug!(entry_id = %p.id, "exhausted entry claimed by another consumer");
        }
        Ok(())
    }

    /// Decode, route and run one entry.
    ///
    /// Malformed and unroutable entries are acked so they cannot loop
    /// forever; handler failures leave the entry pending for the next sweep.
    fn dispatch(&self, state: &mut LoopState, entry: StreamEntry, delivery_count: u64) {
        let c = &self.config;

        let decoded = entry
            .field(DATA_FIELD)
            .ok_or_else(|| format!("missing `{DATA_FIELD}` field"))
            .and_then(|raw| MessageEnvelope::from_json(raw).map_err(|e| e.to_string()));
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(reason) => {
                error!(entry_id = %entry.id, error = %reason, "dropping malformed entry");
                self.ack(&entry.id);
                self.bump(|s| s.dropped_malformed += 1);
                return;
            }
        };

        let Some(handler) = self.registry.get(envelope.kind()) else {
            warn!(
                entry_id = %entry.id,
                job_id = %envelope.id(),
                job_type = %envelope.kind(),
                "no handler registered for job type; dropping entry"
            );
            self.ack(&entry.id);
            self.bump(|s| s.dropped_unroutable += 1);
            return;
        };

        let ctx = HandlerContext {
            stream: c.stream.clone(),
            group: c.group.clone(),
            consumer: c.consumer.clone(),
            entry_id: entry.id.clone(),
            delivery_count,
        };
        self.bump(|s| s.dispatched += 1);

        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx, &envelope)))
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())))
            });

        match outcome {
            Ok(()) => {
                self.ack(&entry.id);
                state.last_errors.remove(&entry.id);
                self.bump(|s| s.succeeded += 1);
                debug!(
                    entry_id = %entry.id,
                    job_id = %envelope.id(),
                    job_type = %envelope.kind(),
                    delivery_count,
                    "job completed"
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.bump(|s| s.failed += 1);
                warn!(
                    entry_id = %entry.id,
                    job_id = %envelope.id(),
                    job_type = %envelope.kind(),
                    delivery_count,
                    error = %message,
                    "job handler failed; entry left pending for retry"
                );
                state.last_errors.insert(entry.id, message);
            }
        }
    }

    fn ack(&self, id: &EntryId) {
        let c = &self.config;
        if let Err(err) = self
            .store
            .ack(&c.stream, &c.group, std::slice::from_ref(id))
        {
            // Entry stays pending and will be redelivered.
            self.bump(|s| s.store_errors += 1);
            error!(entry_id = %id, error = %err, "failed to ack entry");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
