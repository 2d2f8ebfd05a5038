//! Job transport mechanics (no runtime, no network).
//!
//! This crate holds the pieces every producer and consumer agrees on:
//! the wire envelope, the retry backoff policy, the append-log store
//! abstraction and the handler registry. Loops, threads and Redis live in
//! `quill-infra`.

pub mod backoff;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod in_memory_store;
pub mod store;

pub use backoff::BackoffPolicy;
pub use context::CorrelationContext;
pub use envelope::{JobKind, MessageEnvelope, Priority, metadata_keys};
pub use error::{EnvelopeError, StoreError};
pub use handler::{HandlerContext, HandlerRegistry, HandlerResult, JobHandler};
pub use in_memory_store::InMemoryStreamStore;
pub use store::{
    DATA_FIELD, EntryId, PendingEntry, PendingQuery, StartPosition, StreamEntry, StreamFields,
    StreamStore,
};
