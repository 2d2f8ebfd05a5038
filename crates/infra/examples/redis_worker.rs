//! Run a worker against Redis, configured from `QUILL_*` variables.
//!
//! ```text
//! QUILL_REDIS_URL=redis://localhost:6379 \
//!     cargo run -p quill-infra --features redis --example redis_worker
//! ```
//!
//! Publishes one chapter job, logs every chapter job it receives and stops
//! on Enter.

use std::sync::Arc;

use quill_core::{ProjectId, TenantId};
use quill_infra::{ChapterGenerationJob, JobOptions, RedisStreamStore, Worker, WorkerConfig};
use quill_messaging::{CorrelationContext, HandlerRegistry, JobKind};
use uuid::Uuid;

fn main() -> anyhow::Result<()> {
    quill_observability::init();

    let config = WorkerConfig::from_env()?;
    let store = Arc::new(RedisStreamStore::from_config(&config)?);

    let registry = Arc::new(HandlerRegistry::new());
    registry.register(JobKind::ChapterGeneration, |ctx, envelope| {
        let job: ChapterGenerationJob = envelope.decode_payload()?;
        tracing::info!(
            entry_id = %ctx.entry_id,
            delivery_count = ctx.delivery_count,
            chapter_number = job.chapter_number,
            "chapter job received"
        );
        Ok(())
    });

    let worker = Worker::spawn(store.clone(), &config, registry)?;

    let entry_id = config.producer(store).publish_chapter_generation(
        &CorrelationContext::new().with_request_id("redis-worker"),
        TenantId::new(),
        ProjectId::new(),
        &ChapterGenerationJob {
            chapter_id: Uuid::now_v7(),
            chapter_number: 1,
            outline: Some("the ferry leaves without her".into()),
            target_words: Some(2000),
        },
        JobOptions::default(),
    )?;
    tracing::info!(%entry_id, "published sample job; press Enter to stop");

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    worker.shutdown();
    Ok(())
}
