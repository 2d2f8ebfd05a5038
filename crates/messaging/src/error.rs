//! Error taxonomy shared by producers, consumers and store implementations.

use thiserror::Error;

/// Envelope (de)serialization failures.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The payload or envelope could not be serialized (publish time).
    #[error("encoding error: {0}")]
    Encoding(#[source] serde_json::Error),

    /// Stored bytes could not be decoded into the expected shape.
    #[error("decoding error: {0}")]
    Decoding(#[source] serde_json::Error),
}

/// Failures reported by a `StreamStore`.
///
/// All variants are treated as transient by the consumer loop.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    /// The store returned a reply we could not interpret.
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// Internal lock poisoning (in-memory store).
    #[error("store state poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
