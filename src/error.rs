//! Error taxonomy for extraction, storage and publishing.
//!
//! Scope matters more than type here: `ExtractError::scope()` tells the
//! engine whether a failure is isolated to one archive member or aborts the
//! whole source object.

use std::io;

use crate::report::FailureScope;

/// Object store failures (network, permission, not-found).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    #[error("store I/O error on {uri}: {source}")]
    Io { uri: String, source: io::Error },
}

impl StoreError {
    pub fn io(uri: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            uri: uri.into(),
            source,
        }
    }
}

/// Failures raised while extracting a single source object.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed archive {uri}: {reason}")]
    MalformedArchive { uri: String, reason: String },

    #[error("failed to spool {uri} for central directory access: {source}")]
    Spool { uri: String, source: io::Error },

    #[error("unsafe entry name '{entry}': {reason}")]
    UnsafeEntryName { entry: String, reason: &'static str },

    #[error("failed to write entry '{entry}' to {key}: {source}")]
    EntryWrite {
        entry: String,
        key: String,
        source: io::Error,
    },

    #[error("failed to derive artifact from '{entry}': {reason}")]
    DerivedArtifact { entry: String, reason: String },

    #[error("extraction cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExtractError {
    /// Whether this failure aborts the source object or only one entry.
    pub fn scope(&self) -> FailureScope {
        match self {
            ExtractError::UnsafeEntryName { .. }
            | ExtractError::EntryWrite { .. }
            | ExtractError::DerivedArtifact { .. } => FailureScope::Entry,
            ExtractError::UnsupportedFormat(_)
            | ExtractError::MalformedArchive { .. }
            | ExtractError::Spool { .. }
            | ExtractError::Cancelled
            | ExtractError::Store(_) => FailureScope::Object,
        }
    }
}

/// Messaging failures. Logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher is shut down")]
    Closed,

    #[error("failed to deliver message to topic '{topic}': {source}")]
    Delivery { topic: String, source: io::Error },

    #[error("failed to encode message for topic '{topic}': {source}")]
    Encode {
        topic: String,
        source: serde_json::Error,
    },
}
