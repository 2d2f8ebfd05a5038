//! Job handlers and the registry that routes envelopes to them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::envelope::{JobKind, MessageEnvelope};
use crate::store::EntryId;

/// Result returned by a handler. Any error leaves the entry pending for retry.
pub type HandlerResult = anyhow::Result<()>;

/// Delivery information handed to a handler next to the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub entry_id: EntryId,
    /// Store-reported delivery count, including this delivery.
    pub delivery_count: u64,
}

impl HandlerContext {
    /// True when this entry was delivered before (a retry or a reclaim).
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Business logic for one job kind.
///
/// Delivery is at-least-once: a handler that performs its effect and then
/// crashes before the entry is acknowledged will see the envelope again.
/// Handlers must be idempotent or consult the envelope's idempotency key.
pub trait JobHandler: Send + Sync {
    fn handle(&self, ctx: &HandlerContext, envelope: &MessageEnvelope) -> HandlerResult;
}

impl<F> JobHandler for F
where
    F: Fn(&HandlerContext, &MessageEnvelope) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext, envelope: &MessageEnvelope) -> HandlerResult {
        self(ctx, envelope)
    }
}

/// Handlers keyed by job kind; at most one per kind.
///
/// Owned by a consumer engine (no process-wide registry). Lookups and
/// registrations may interleave, hence the lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    ///
    /// The last registration wins; a replaced handler is returned and the
    /// overwrite is logged.
    pub fn register<F>(&self, kind: impl Into<JobKind>, handler: F) -> Option<Arc<dyn JobHandler>>
    where
        F: Fn(&HandlerContext, &MessageEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_arc(kind, Arc::new(handler))
    }

    /// Register a shared handler (e.g. a struct implementing `JobHandler`).
    pub fn register_arc(
        &self,
        kind: impl Into<JobKind>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let kind = kind.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = handlers.insert(kind.clone(), handler);
        if previous.is_some() {
            warn!(job_type = %kind, "handler registration replaced an existing handler");
        }
        previous
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.get(kind).is_some()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
