//! Error reporter: scoped failure records for one source object.
//!
//! Entry-level records accumulate while iteration continues. An object-level
//! record means the source was abandoned at that point. Records are
//! published on the error topic as their plain message string.

use serde::Serialize;
use tracing::{error, warn};

use crate::error::ExtractError;
use crate::store::ObjectUri;

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureScope {
    /// One archive member; processing continues.
    Entry,
    /// The whole source object; processing stops.
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub source: String,
    pub scope: FailureScope,
    pub entry: Option<String>,
    pub message: String,
}

impl FailureRecord {
    /// Error channel payload: the message, no structured wrapper
    pub fn payload(&self) -> &str {
        &self.message
    }
}

/// Per-entry result of the primary write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Written { entry: String, key: ObjectUri },
    Failed { entry: String, message: String },
}

impl ExtractionOutcome {
    pub fn entry(&self) -> &str {
        match self {
            ExtractionOutcome::Written { entry, .. } | ExtractionOutcome::Failed { entry, .. } => {
                entry
            }
        }
    }

    pub fn written_key(&self) -> Option<&ObjectUri> {
        match self {
            ExtractionOutcome::Written { key, .. } => Some(key),
            ExtractionOutcome::Failed { .. } => None,
        }
    }
}

/// Collects failures for a single source object.
#[derive(Debug)]
pub struct ErrorReporter {
    source: String,
    records: Vec<FailureRecord>,
}

impl ErrorReporter {
    pub fn new(source: &ObjectUri) -> Self {
        Self {
            source: source.to_string(),
            records: Vec::new(),
        }
    }

    pub fn report(&mut self, scope: FailureScope, entry: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        match scope {
            FailureScope::Entry => {
                warn!(source = %self.source, entry = entry.unwrap_or(""), "{}", message)
            }
            FailureScope::Object => error!(source = %self.source, "{}", message),
        }
        self.records.push(FailureRecord {
            source: self.source.clone(),
            scope,
            entry: entry.map(str::to_string),
            message,
        });
    }

    /// Record an extraction error using its own scope.
    pub fn report_error(&mut self, entry: Option<&str>, err: &ExtractError) {
        self.report(err.scope(), entry, err.to_string());
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn has_object_failure(&self) -> bool {
        self.records.iter().any(|r| r.scope == FailureScope::Object)
    }

    pub fn into_records(self) -> Vec<FailureRecord> {
        self.records
    }
}
