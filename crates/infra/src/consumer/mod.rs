//! Consumer-group engine with retry, reclaim and dead-letter handling.
//!
//! ## Design
//!
//! - One engine = one consumer identity = one loop thread
//! - Dispatch is sequential; a slow handler throttles its own engine only
//! - Retry counting comes from the store's delivery count, so it survives restarts
//! - Entries stuck behind a crashed consumer are reclaimed after an idle threshold
//! - Exhausted entries move to the dead-letter stream and are acked
//!
//! Throughput scales by running more engines against the same group.

pub mod engine;
pub mod types;

pub use engine::ConsumerEngine;
pub use types::{ConsumerStats, EngineConfig, EngineError, EngineState};
