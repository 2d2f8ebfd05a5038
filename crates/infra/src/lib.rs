//! Infrastructure layer: producer, consumer engine, dead-letter handling,
//! store backends and worker wiring.

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod producer;
pub mod stream_store;
pub mod worker;


pub use config::{ConfigError, WorkerConfig};
pub use consumer::{ConsumerEngine, ConsumerStats, EngineConfig, EngineError, EngineState};
pub use dead_letter::{
    DeadLetterError, DeadLetterMonitor, DeadLetterMonitorConfig, DeadLetterQueue,
    DeadLetterRecord, DepthReport, MonitorHandle, dead_letter_stream,
};
pub use producer::{
    ChapterGenerationJob, FOUNDATION_STREAM, FoundationGenerationJob, GENERATION_STREAM,
    JobOptions, Producer, PublishError,
};
pub use worker::{Worker, WorkerHandle};

#[cfg(feature = "redis")]
pub use stream_store::RedisStreamStore;
