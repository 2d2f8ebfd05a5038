//! Job envelope: the unit appended to a stream and handed to handlers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quill_core::{ProjectId, TenantId};

use crate::error::EnvelopeError;

/// Well-known metadata keys.
pub mod metadata_keys {
    pub const PRIORITY: &str = "priority";
    pub const IDEMPOTENCY_KEY: &str = "idempotency_key";
    pub const REQUEST_ID: &str = "request_id";
    pub const TRACE_ID: &str = "trace_id";
}

/// Job kind used to route an envelope to its handler.
///
/// The known kinds are closed; anything else round-trips through `Custom`
/// so that an unknown tag read off the wire is still routable (or droppable)
/// instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    /// Generate (or regenerate) a single chapter.
    ChapterGeneration,
    /// Generate project foundation material (world, characters, outline).
    FoundationGeneration,
    Custom(String),
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobKind::ChapterGeneration => "chapter_gen",
            JobKind::FoundationGeneration => "foundation_gen",
            JobKind::Custom(kind) => kind,
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "chapter_gen" => JobKind::ChapterGeneration,
            "foundation_gen" => JobKind::FoundationGeneration,
            _ => JobKind::Custom(value),
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        match value {
            JobKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hint carried in metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Envelope for a job, containing tenant/project scope and free-form metadata.
///
/// Notes:
/// - `id` is the logical, business-assigned job id. It is *not* the entry id
///   the store hands out on append; handlers use it (or the idempotency key)
///   to detect redeliveries.
/// - `payload` has no mutable accessor. Metadata can only be changed on an
///   owned envelope, and the producer takes ownership on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: JobKind,
    tenant_id: TenantId,
    project_id: ProjectId,
    payload: JsonValue,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Build an envelope, serializing `payload`.
    pub fn new<P>(
        id: impl Into<String>,
        kind: impl Into<JobKind>,
        tenant_id: TenantId,
        project_id: ProjectId,
        payload: &P,
    ) -> Result<Self, EnvelopeError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(EnvelopeError::Encoding)?;
        Ok(Self {
            id: id.into(),
            kind: kind.into(),
            tenant_id,
            project_id,
            payload,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Raw payload as published.
    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload into the shape the handler expects.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.payload).map_err(EnvelopeError::Decoding)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata_map(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Set a metadata value; last write wins.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_metadata(key, value);
        self
    }

    /// Set `key` only when it is not present yet. Returns whether it was set.
    pub fn set_metadata_if_absent(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        let key = key.into();
        if self.metadata.contains_key(&key) {
            return false;
        }
        self.metadata.insert(key, value.into());
        true
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata(metadata_keys::IDEMPOTENCY_KEY)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encoding)
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Decoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ChapterPayload {
        chapter: u32,
        title: String,
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(
            "job-1",
            JobKind::ChapterGeneration,
            TenantId::new(),
            ProjectId::new(),
            &ChapterPayload {
                chapter: 3,
                title: "The Crossing".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn wire_format_uses_type_tag() {
        let env = envelope();
        let value: JsonValue = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], json!("chapter_gen"));
        assert_eq!(value["id"], json!("job-1"));
        assert_eq!(value["payload"]["chapter"], json!(3));
    }

    #[test]
    fn decodes_payload_into_expected_shape() {
        let env = envelope();
        let payload: ChapterPayload = env.decode_payload().unwrap();
        assert_eq!(payload.title, "The Crossing");
    }

    #[test]
    fn decode_into_wrong_shape_is_a_decoding_error() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Other {
            foundation_id: String,
        }

        let err = envelope().decode_payload::<Other>().unwrap_err();
        assert!(matches!(err, EnvelopeError::Decoding(_)));
    }

    #[test]
    fn encoding_failure_is_reported() {
        use std::collections::HashMap;
        // Non-string map keys cannot become JSON object keys.
        let mut bad = HashMap::new();
        bad.insert((1u8, 2u8), "x");

        let err = MessageEnvelope::new(
            "job-2",
            "custom",
            TenantId::new(),
            ProjectId::new(),
            &bad,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::Encoding(_)));
    }

    #[test]
    fn metadata_last_write_wins() {
        let mut env = envelope();
        env.set_metadata(metadata_keys::PRIORITY, "low");
        env.set_metadata(metadata_keys::PRIORITY, "high");
        assert_eq!(env.metadata(metadata_keys::PRIORITY), Some("high"));
        assert_eq!(env.metadata_map().len(), 1);
    }

    #[test]
    fn set_if_absent_does_not_override() {
        let mut env = envelope().with_metadata(metadata_keys::REQUEST_ID, "req-a");
        assert!(!env.set_metadata_if_absent(metadata_keys::REQUEST_ID, "req-b"));
        assert!(env.set_metadata_if_absent(metadata_keys::TRACE_ID, "trace-1"));
        assert_eq!(env.metadata(metadata_keys::REQUEST_ID), Some("req-a"));
        assert_eq!(env.metadata(metadata_keys::TRACE_ID), Some("trace-1"));
    }

    #[test]
    fn unknown_kind_round_trips_as_custom() {
        let kind: JobKind = serde_json::from_str("\"outline_refresh\"").unwrap();
        assert_eq!(kind, JobKind::Custom("outline_refresh".into()));
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"outline_refresh\"");
        assert_eq!(JobKind::custom("foundation_gen"), JobKind::FoundationGeneration);
    }

    #[test]
    fn malformed_wire_json_is_a_decoding_error() {
        let err = MessageEnvelope::from_json("{\"id\": 1}").unwrap_err();
        assert!(matches!(err, EnvelopeError::Decoding(_)));
    }
}
