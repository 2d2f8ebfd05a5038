//! Correlation identifiers carried from the calling context into metadata.

use crate::envelope::{MessageEnvelope, metadata_keys};

/// Request/trace identifiers of the operation that publishes a job.
///
/// Passed explicitly to the producer; there is no ambient global context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationContext {
    request_id: Option<String>,
    trace_id: Option<String>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Rebuild the context from an envelope's metadata (consumer side), so a
    /// handler that publishes follow-up jobs keeps the same correlation ids.
    pub fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            request_id: envelope.metadata(metadata_keys::REQUEST_ID).map(str::to_string),
            trace_id: envelope.metadata(metadata_keys::TRACE_ID).map(str::to_string),
        }
    }

    /// Copy the identifiers into `envelope` without overriding existing values.
    pub fn apply_to(&self, envelope: &mut MessageEnvelope) {
        if let Some(request_id) = &self.request_id {
            envelope.set_metadata_if_absent(metadata_keys::REQUEST_ID, request_id.clone());
        }
        if let Some(trace_id) = &self.trace_id {
            envelope.set_metadata_if_absent(metadata_keys::TRACE_ID, trace_id.clone());
        }
    }
}
