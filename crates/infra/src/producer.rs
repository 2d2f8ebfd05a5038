//! Job producer: appends envelopes to a stream.
//!
//! ## Canonical streams
//!
//! One stream per job family; a stream may carry several job kinds, told
//! apart by the envelope's `type` at dispatch time.
//!
//! - `quill:jobs:generation`: chapter generation
//! - `quill:jobs:foundation`: foundation generation

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use quill_core::{ProjectId, TenantId};
use quill_messaging::{
    CorrelationContext, DATA_FIELD, EntryId, EnvelopeError, JobKind, MessageEnvelope, Priority,
    StoreError, StreamFields, StreamStore, metadata_keys,
};

/// Stream carrying chapter generation jobs.
pub const GENERATION_STREAM: &str = "quill:jobs:generation";

/// Stream carrying foundation generation jobs.
pub const FOUNDATION_STREAM: &str = "quill:jobs:foundation";

/// Default approximate retention per stream.
pub const DEFAULT_MAX_LEN: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The envelope could not be serialized. Not retried.
    #[error(transparent)]
    Encoding(#[from] EnvelopeError),

    #[error("append to stream {stream} failed: {source}")]
    Store {
        stream: String,
        #[source]
        source: StoreError,
    },
}

/// Per-job publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    /// Logical job id; a fresh UUIDv7 when absent.
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

/// Payload of a `chapter_gen` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterGenerationJob {
    pub chapter_id: Uuid,
    pub chapter_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
}

/// Payload of a `foundation_gen` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundationGenerationJob {
    pub foundation_id: Uuid,
    /// Sections to (re)generate, e.g. `world`, `characters`, `outline`.
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
}

/// Build a typed job envelope with priority and idempotency metadata.
pub fn job_envelope<P: Serialize>(
    kind: JobKind,
    tenant_id: TenantId,
    project_id: ProjectId,
    payload: &P,
    options: &JobOptions,
) -> Result<MessageEnvelope, EnvelopeError> {
    let id = options
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let mut envelope = MessageEnvelope::new(id, kind, tenant_id, project_id, payload)?
        .with_metadata(metadata_keys::PRIORITY, options.priority.as_str());
    if let Some(key) = &options.idempotency_key {
        envelope.set_metadata(metadata_keys::IDEMPOTENCY_KEY, key.clone());
    }
    Ok(envelope)
}

/// Appends job envelopes to streams of a `StreamStore`.
#[derive(Debug, Clone)]
pub struct Producer<S> {
    store: S,
    max_len: Option<usize>,
}

impl<S: StreamStore> Producer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_len: Some(DEFAULT_MAX_LEN),
        }
    }

    /// Override retention (`None` disables trimming).
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Append `envelope` to `stream`.
    ///
    /// Request/trace ids from `ctx` are copied into the metadata unless the
    /// envelope already carries them. Returns the store-assigned entry id.
    #[instrument(
        skip(self, ctx, envelope),
        fields(
            stream = %stream,
            job_id = %envelope.id(),
            job_type = %envelope.kind(),
            tenant_id = %envelope.tenant_id()
        ),
        err
    )]
    pub fn publish(
        &self,
        ctx: &CorrelationContext,
        stream: &str,
        mut envelope: MessageEnvelope,
    ) -> Result<EntryId, PublishError> {
        ctx.apply_to(&mut envelope);
        let data = envelope.to_json()?;

        let fields = StreamFields::from([(DATA_FIELD.to_string(), data)]);
        let entry_id = self
            .store
            .append(stream, &fields, self.max_len)
            .map_err(|source| PublishError::Store {
                stream: stream.to_string(),
                source,
            })?;

        debug!(entry_id = %entry_id, "job published");
        Ok(entry_id)
    }

    /// Publish a `chapter_gen` job on the generation stream.
    pub fn publish_chapter_generation(
        &self,
        ctx: &CorrelationContext,
        tenant_id: TenantId,
        project_id: ProjectId,
        job: &ChapterGenerationJob,
        options: JobOptions,
    ) -> Result<EntryId, PublishError> {
        let envelope = job_envelope(
            JobKind::ChapterGeneration,
            tenant_id,
            project_id,
            job,
            &options,
        )?;
        self.publish(ctx, GENERATION_STREAM, envelope)
    }

    /// Publish a `foundation_gen` job on the foundation stream.
    pub fn publish_foundation_generation(
        &self,
        ctx: &CorrelationContext,
        tenant_id: TenantId,
        project_id: ProjectId,
        job: &FoundationGenerationJob,
        options: JobOptions,
    ) -> Result<EntryId, PublishError> {
        let envelope = job_envelope(
            JobKind::FoundationGeneration,
            tenant_id,
            project_id,
            job,
            &options,
        )?;
        self.publish(ctx, FOUNDATION_STREAM, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use quill_messaging::InMemoryStreamStore;

    fn chapter_job() -> ChapterGenerationJob {
        ChapterGenerationJob {
            chapter_id: Uuid::now_v7(),
            chapter_number: 7,
            outline: Some("storm at sea".into()),
            target_words: None,
        }
    }

    fn stored_envelope(store: &InMemoryStreamStore, stream: &str) -> MessageEnvelope {
        let entries = store.range(stream, 10).unwrap();
        assert_eq!(entries.len(), 1);
        MessageEnvelope::from_json(entries[0].field(DATA_FIELD).unwrap()).unwrap()
    }

    #[test]
    fn publish_enriches_correlation_without_overriding() {
        let store = InMemoryStreamStore::arc();
        let producer = Producer::new(store.clone());
        let envelope = MessageEnvelope::new(
            "job-1",
            "custom",
            TenantId::new(),
            ProjectId::new(),
            &serde_json::json!({"n": 1}),
        )
        .unwrap()
        .with_metadata(metadata_keys::REQUEST_ID, "from-envelope");

        let ctx = CorrelationContext::new()
            .with_request_id("from-ctx")
            .with_trace_id("trace-1");
        producer.publish(&ctx, "quill:test", envelope).unwrap();

        let stored = stored_envelope(&store, "quill:test");
        assert_eq!(stored.metadata(metadata_keys::REQUEST_ID), Some("from-envelope"));
        assert_eq!(stored.metadata(metadata_keys::TRACE_ID), Some("trace-1"));
        assert_eq!(stored.id(), "job-1");
    }

    #[test]
    fn chapter_jobs_land_on_generation_stream() {
        let store = InMemoryStreamStore::arc();
        let producer = Producer::new(store.clone());
        let job = chapter_job();

        producer
            .publish_chapter_generation(
                &CorrelationContext::new(),
                TenantId::new(),
                ProjectId::new(),
                &job,
                JobOptions::default()
                    .with_priority(Priority::High)
                    .with_idempotency_key("chapter-7-v1"),
            )
            .unwrap();

        let stored = stored_envelope(&store, GENERATION_STREAM);
        assert_eq!(stored.kind(), &JobKind::ChapterGeneration);
        assert_eq!(stored.metadata(metadata_keys::PRIORITY), Some("high"));
        assert_eq!(stored.idempotency_key(), Some("chapter-7-v1"));
        assert_eq!(stored.decode_payload::<ChapterGenerationJob>().unwrap(), job);
    }

    #[test]
    fn foundation_jobs_land_on_foundation_stream() {
        let store = InMemoryStreamStore::arc();
        let producer = Producer::new(store.clone());
        let job = FoundationGenerationJob {
            foundation_id: Uuid::now_v7(),
            sections: vec!["world".into(), "characters".into()],
            brief: None,
        };

        producer
            .publish_foundation_generation(
                &CorrelationContext::new(),
                TenantId::new(),
                ProjectId::new(),
                &job,
                JobOptions::default().with_job_id("foundation-42"),
            )
            .unwrap();

        let stored = stored_envelope(&store, FOUNDATION_STREAM);
        assert_eq!(stored.kind(), &JobKind::FoundationGeneration);
        assert_eq!(stored.id(), "foundation-42");
        assert_eq!(stored.metadata(metadata_keys::PRIORITY), Some("normal"));
        assert_eq!(stored.idempotency_key(), None);
    }

    #[test]
    fn publish_trims_to_max_len() {
        let store = InMemoryStreamStore::arc();
        let producer = Producer::new(store.clone()).with_max_len(Some(2));
        for _ in 0..4 {
            producer
                .publish_chapter_generation(
                    &CorrelationContext::new(),
                    TenantId::new(),
                    ProjectId::new(),
                    &chapter_job(),
                    JobOptions::default(),
                )
                .unwrap();
        }
        assert_eq!(store.len(GENERATION_STREAM).unwrap(), 2);
    }

    #[test]
    fn store_failures_name_the_stream() {
        struct Down;
        impl StreamStore for Down {
            fn append(&self, _: &str, _: &StreamFields, _: Option<usize>) -> Result<EntryId, StoreError> {
                Err(StoreError::Connection("refused".into()))
            }
            fn create_group(&self, _: &str, _: &str, _: quill_messaging::StartPosition) -> Result<(), StoreError> {
                unreachable!()
            }
            fn read_group(&self, _: &str, _: &str, _: &str, _: usize, _: std::time::Duration) -> Result<Vec<quill_messaging::StreamEntry>, StoreError> {
                unreachable!()
            }
            fn ack(&self, _: &str, _: &str, _: &[EntryId]) -> Result<u64, StoreError> {
                unreachable!()
            }
            fn claim(&self, _: &str, _: &str, _: &str, _: std::time::Duration, _: &[EntryId]) -> Result<Vec<quill_messaging::StreamEntry>, StoreError> {
                unreachable!()
            }
            fn pending(&self, _: &str, _: &str, _: &quill_messaging::PendingQuery) -> Result<Vec<quill_messaging::PendingEntry>, StoreError> {
                unreachable!()
            }
            fn len(&self, _: &str) -> Result<u64, StoreError> {
                unreachable!()
            }
            fn range(&self, _: &str, _: usize) -> Result<Vec<quill_messaging::StreamEntry>, StoreError> {
                unreachable!()
            }
            fn delete(&self, _: &str, _: &[EntryId]) -> Result<u64, StoreError> {
                unreachable!()
            }
        }

        let producer = Producer::new(Arc::new(Down));
        let err = producer
            .publish_chapter_generation(
                &CorrelationContext::new(),
                TenantId::new(),
                ProjectId::new(),
                &chapter_job(),
                JobOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PublishError::Store { ref stream, .. } if stream == GENERATION_STREAM));
    }
}
