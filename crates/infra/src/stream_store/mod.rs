//! `StreamStore` backends.
//!
//! The in-memory store lives in `quill-messaging` next to the trait; this
//! module holds the networked ones.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamStore;
