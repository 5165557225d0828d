//! Extraction engine
//!
//! One engine, parameterized by configuration:
//! - error isolation: keep going past a failed entry, or abort the source
//! - manifest shape: simple, bucketed or images-only
//! - optional derived-artifact step (image transcoding)
//!
//! `Engine::extract` is a pure function of its inputs: it takes a source
//! object, writes its entries below a fresh destination prefix and returns
//! everything that happened in an `ExtractionReport`. Nothing accumulates on
//! the engine between calls except idle copy buffers, so one engine is
//! shared by every worker thread.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveKind, EntryReader};
use crate::cancel::CancelToken;
use crate::destination::DestinationPrefix;
use crate::error::ExtractError;
use crate::manifest::{Manifest, ManifestBuilder, ManifestMode};
use crate::paths;
use crate::report::{ErrorReporter, ExtractionOutcome, FailureRecord, FailureScope};
use crate::store::{ObjectStore, ObjectUri};
use crate::writer::{BufferPool, EntryWriter, ImageConversion, WrittenEntry, DEFAULT_BUFFER_SIZE};

/// What a failed entry does to the rest of its source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorIsolation {
    /// Record the failure and move on to the next entry
    #[default]
    Continue,
    /// Stop at the first failed entry and treat the source as aborted
    Abort,
}

impl std::str::FromStr for ErrorIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(ErrorIsolation::Continue),
            "abort" => Ok(ErrorIsolation::Abort),
            other => Err(format!(
                "unknown error isolation '{}' (expected continue or abort)",
                other
            )),
        }
    }
}

/// Engine parameters. Built from `ExtractConfig` by the CLI.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub output_dir: ObjectUri,
    pub manifest_mode: ManifestMode,
    pub isolation: ErrorIsolation,
    pub conversion: Option<ImageConversion>,
    pub buffer_size: usize,
    pub public_base_url: String,
    /// Record unrecognized sources as failures instead of skipping silently
    pub report_unsupported: bool,
    /// List keys written before an object-level abort in the manifest
    pub keep_partial_on_abort: bool,
    /// Only extract entries with these extensions (empty = all)
    pub only_extensions: Vec<String>,
}

impl EngineConfig {
    pub fn new(output_dir: ObjectUri) -> Self {
        Self {
            output_dir,
            manifest_mode: ManifestMode::default(),
            isolation: ErrorIsolation::default(),
            conversion: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            public_base_url: crate::config::DEFAULT_PUBLIC_BASE_URL.to_string(),
            report_unsupported: false,
            keep_partial_on_abort: false,
            only_extensions: Vec::new(),
        }
    }
}

/// Everything one `extract` call produced for one source object.
#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub source: ObjectUri,
    pub kind: ArchiveKind,
    /// Destination prefix; `None` when the source was never opened
    pub prefix: Option<ObjectUri>,
    pub outcomes: Vec<ExtractionOutcome>,
    pub derived: Vec<ObjectUri>,
    pub failures: Vec<FailureRecord>,
    pub manifest: Manifest,
    pub aborted: bool,
    /// File entries encountered, including ones filtered out
    pub entries_seen: usize,
}

impl ExtractionReport {
    pub fn written_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ExtractionOutcome::Written { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.written_count()
    }

    pub fn is_unsupported(&self) -> bool {
        !self.kind.is_supported()
    }

    /// Entry-level failure records, derived-artifact failures included
    pub fn entry_failures(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.scope == FailureScope::Entry)
            .count()
    }
}

/// Why the entry walk stopped early.
enum Stop {
    Cancelled,
    EntryFailed { entry: String, message: String },
}

pub struct Engine {
    config: EngineConfig,
    pool: BufferPool,
    manifests: ManifestBuilder,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size);
        let manifests = ManifestBuilder::new(config.manifest_mode, &config.public_base_url);
        Self {
            config,
            pool,
            manifests,
        }
    }

    fn wants(&self, entry_name: &str) -> bool {
        if self.config.only_extensions.is_empty() {
            return true;
        }
        let exts: Vec<&str> = self.config.only_extensions.iter().map(String::as_str).collect();
        paths::has_any_extension(entry_name, &exts)
    }

    /// Extract one source object.
    ///
    /// Never fails as a whole: object-level problems show up as
    /// `aborted` plus an object-scoped failure record, and a manifest is
    /// produced either way.
    pub fn extract(
        &self,
        store: &dyn ObjectStore,
        source: &ObjectUri,
        cancel: &CancelToken,
    ) -> ExtractionReport {
        let kind = ArchiveKind::from_name(source.key());
        let mut reporter = ErrorReporter::new(source);

        if !kind.is_supported() {
            if self.config.report_unsupported {
                reporter.report_error(None, &ExtractError::UnsupportedFormat(source.to_string()));
            } else {
                debug!(source = %source, "skipping unsupported object");
            }
            return self.finish(source, kind, None, reporter, Walk::default());
        }

        if cancel.is_cancelled() {
            reporter.report_error(None, &ExtractError::Cancelled);
            return self.finish(source, kind, None, reporter, Walk::aborted());
        }

        let stream = match store.open(source) {
            Ok(stream) => stream,
            Err(e) => {
                reporter.report_error(None, &ExtractError::Store(e));
                return self.finish(source, kind, None, reporter, Walk::aborted());
            }
        };

        let prefix = DestinationPrefix::build(&self.config.output_dir, kind);
        info!(
            source = %source,
            kind = %kind,
            token = prefix.token(),
            prefix = %prefix.uri(),
            "extracting archive"
        );

        let walk = match EntryReader::new(kind, stream, source.to_string()) {
            Ok(reader) => self.walk(store, reader, &prefix, &mut reporter, cancel),
            Err(e) => {
                reporter.report_error(None, &e);
                Walk::aborted()
            }
        };

        self.finish(source, kind, Some(prefix.uri().clone()), reporter, walk)
    }

    fn walk(
        &self,
        store: &dyn ObjectStore,
        reader: EntryReader,
        prefix: &DestinationPrefix,
        reporter: &mut ErrorReporter,
        cancel: &CancelToken,
    ) -> Walk {
        let writer = EntryWriter::new(store, &self.pool, self.config.conversion.as_ref(), cancel);
        let mut walk = Walk::default();
        let mut stop = None;

        let result = reader.for_each_entry(|mut entry| {
            if cancel.is_cancelled() {
                stop = Some(Stop::Cancelled);
                return ControlFlow::Break(());
            }
            walk.entries_seen += 1;

            let name = entry.name().to_string();
            if !self.wants(&name) {
                debug!(entry = %name, "entry filtered out");
                return ControlFlow::Continue(());
            }

            let written = match prefix.entry_key(&name) {
                Ok(key) => match writer.write(&name, &mut entry, &key, &walk.keys, reporter) {
                    Ok(written) => written,
                    Err(_) => {
                        stop = Some(Stop::Cancelled);
                        return ControlFlow::Break(());
                    }
                },
                Err(e) => {
                    reporter.report_error(Some(&name), &e);
                    WrittenEntry {
                        outcome: ExtractionOutcome::Failed {
                            entry: name.clone(),
                            message: e.to_string(),
                        },
                        derived: None,
                    }
                }
            };

            if let Some(key) = written.outcome.written_key() {
                walk.commit_primary(&name, key, reporter);
            }
            if let Some(derived) = written.derived {
                walk.commit_derived(&name, derived);
            }

            let failure = match &written.outcome {
                ExtractionOutcome::Failed { message, .. } => Some(message.clone()),
                ExtractionOutcome::Written { .. } => None,
            };
            walk.outcomes.push(written.outcome);

            match failure {
                Some(message) if self.config.isolation == ErrorIsolation::Abort => {
                    stop = Some(Stop::EntryFailed {
                        entry: name,
                        message,
                    });
                    ControlFlow::Break(())
                }
                _ => ControlFlow::Continue(()),
            }
        });

        if let Err(e) = result {
            reporter.report_error(None, &e);
            walk.aborted = true;
        }
        match stop {
            Some(Stop::Cancelled) => {
                reporter.report_error(None, &ExtractError::Cancelled);
                walk.aborted = true;
            }
            Some(Stop::EntryFailed { entry, message }) => {
                reporter.report(
                    FailureScope::Object,
                    Some(&entry),
                    format!("aborted after entry '{}' failed: {}", entry, message),
                );
                walk.aborted = true;
            }
            None => {}
        }
        walk
    }

    fn finish(
        &self,
        source: &ObjectUri,
        kind: ArchiveKind,
        prefix: Option<ObjectUri>,
        reporter: ErrorReporter,
        walk: Walk,
    ) -> ExtractionReport {
        let extraction_path = prefix.as_ref().map(ObjectUri::to_string).unwrap_or_default();
        let listed: &[ObjectUri] = if walk.aborted && !self.config.keep_partial_on_abort {
            &[]
        } else {
            &walk.committed
        };
        let manifest = self.manifests.build(source, &extraction_path, listed);

        let report = ExtractionReport {
            source: source.clone(),
            kind,
            prefix,
            outcomes: walk.outcomes,
            derived: walk.derived,
            failures: reporter.into_records(),
            manifest,
            aborted: walk.aborted,
            entries_seen: walk.entries_seen,
        };
        if kind.is_supported() {
            info!(
                source = %source,
                written = report.written_count(),
                failed = report.failed_count(),
                derived = report.derived.len(),
                aborted = report.aborted,
                "extraction finished"
            );
        }
        report
    }
}

/// Accumulated state of one entry walk.
#[derive(Default)]
struct Walk {
    outcomes: Vec<ExtractionOutcome>,
    derived: Vec<ObjectUri>,
    /// Primary and derived keys in first-write order, each listed once
    committed: Vec<ObjectUri>,
    keys: HashSet<ObjectUri>,
    /// Derived key -> entry it was transcoded from
    derived_from: HashMap<ObjectUri, String>,
    aborted: bool,
    entries_seen: usize,
}

impl Walk {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Self::default()
        }
    }

    /// Archive content wins over a derived artifact at the same key; the
    /// replaced artifact is reported against the entry it came from.
    fn commit_primary(&mut self, entry: &str, key: &ObjectUri, reporter: &mut ErrorReporter) {
        if self.keys.insert(key.clone()) {
            self.committed.push(key.clone());
            return;
        }
        match self.derived_from.remove(key) {
            Some(origin) => {
                self.derived.retain(|d| d != key);
                let replaced = ExtractError::DerivedArtifact {
                    entry: origin.clone(),
                    reason: format!("{} was replaced by archive entry '{}'", key, entry),
                };
                reporter.report_error(Some(&origin), &replaced);
            }
            None => warn!(entry, key = %key, "entry written over an earlier entry of the same name"),
        }
    }

    fn commit_derived(&mut self, entry: &str, key: ObjectUri) {
        self.keys.insert(key.clone());
        self.committed.push(key.clone());
        self.derived_from.insert(key.clone(), entry.to_string());
        self.derived.push(key);
    }
}
