//! Batch runner
//!
//! Matches source objects against the input glob and runs one extraction
//! unit per source on a rayon pool. Units share nothing but the engine's
//! buffer pool and the publisher. Each finished unit publishes its manifest
//! on the output topic and every failure message on the error topic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::ExtractConfig;
use crate::engine::{Engine, ExtractionReport};
use crate::publish::Publisher;
use crate::store::{match_objects, ObjectStore, ObjectUri};

/// Called once per finished source, from worker threads
pub type ProgressCallback = Arc<dyn Fn(&ExtractionReport) + Send + Sync>;

/// Topic names for manifests and failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub output: String,
    pub errors: String,
}

/// Totals for one batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub matched: usize,
    pub processed: usize,
    pub unsupported: usize,
    pub aborted: usize,
    /// Not started because the run was cancelled
    pub skipped: usize,
    pub entries_written: usize,
    pub entry_failures: usize,
    pub derived_artifacts: usize,
    /// Messages that could not be enqueued
    pub publish_failures: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicUsize,
    unsupported: AtomicUsize,
    aborted: AtomicUsize,
    skipped: AtomicUsize,
    entries_written: AtomicUsize,
    entry_failures: AtomicUsize,
    derived_artifacts: AtomicUsize,
    publish_failures: AtomicUsize,
}

pub struct BatchRunner {
    engine: Engine,
    topics: Topics,
    threads: usize,
    progress: Option<ProgressCallback>,
}

impl BatchRunner {
    pub fn new(engine: Engine, topics: Topics) -> Self {
        Self {
            engine,
            topics,
            threads: 0,
            progress: None,
        }
    }

    pub fn from_config(config: &ExtractConfig) -> Result<Self> {
        let engine_config = config.engine_config().context("Invalid engine configuration")?;
        Ok(Self::new(Engine::new(engine_config), config.topics()).with_threads(config.threads))
    }

    /// 0 uses one thread per core.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Resolve the input glob to source objects in scheduling order.
    pub fn plan(&self, store: &dyn ObjectStore, pattern: &str) -> Result<Vec<ObjectUri>> {
        let sources = match_objects(store, pattern)
            .with_context(|| format!("Failed to match objects for '{}'", pattern))?;
        info!(pattern, matched = sources.len(), "matched source objects");
        Ok(sources)
    }

    /// Extract every source. A failing source never stops the others.
    pub fn run(
        &self,
        store: &dyn ObjectStore,
        sources: &[ObjectUri],
        publisher: &Publisher,
        cancel: &CancelToken,
    ) -> Result<RunStats> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("extract-{}", i))
            .build()
            .context("Failed to build worker pool")?;

        let counters = Counters::default();
        pool.install(|| {
            sources.par_iter().for_each(|source| {
                if cancel.is_cancelled() {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let report = self.engine.extract(store, source, cancel);
                self.publish(&report, publisher, &counters);
                self.tally(&report, &counters);
                if let Some(ref cb) = self.progress {
                    cb(&report);
                }
            });
        });

        let stats = RunStats {
            matched: sources.len(),
            processed: counters.processed.into_inner(),
            unsupported: counters.unsupported.into_inner(),
            aborted: counters.aborted.into_inner(),
            skipped: counters.skipped.into_inner(),
            entries_written: counters.entries_written.into_inner(),
            entry_failures: counters.entry_failures.into_inner(),
            derived_artifacts: counters.derived_artifacts.into_inner(),
            publish_failures: counters.publish_failures.into_inner(),
        };
        if stats.skipped > 0 {
            warn!(skipped = stats.skipped, "run cancelled before all sources started");
        }
        info!(
            processed = stats.processed,
            written = stats.entries_written,
            failures = stats.entry_failures,
            aborted = stats.aborted,
            "batch finished"
        );
        Ok(stats)
    }

    fn publish(&self, report: &ExtractionReport, publisher: &Publisher, counters: &Counters) {
        let failed = |what: &str, e: &dyn std::fmt::Display| {
            error!(source = %report.source, "failed to publish {}: {}", what, e);
            counters.publish_failures.fetch_add(1, Ordering::Relaxed);
        };

        match report.manifest.to_json() {
            Ok(json) => {
                if let Err(e) = publisher.publish(&self.topics.output, json) {
                    failed("manifest", &e);
                }
            }
            Err(e) => failed("manifest", &e),
        }

        for failure in &report.failures {
            if let Err(e) = publisher.publish(&self.topics.errors, failure.payload()) {
                failed("error record", &e);
            }
        }
    }

    fn tally(&self, report: &ExtractionReport, counters: &Counters) {
        counters.processed.fetch_add(1, Ordering::Relaxed);
        if report.is_unsupported() {
            counters.unsupported.fetch_add(1, Ordering::Relaxed);
        }
        if report.aborted {
            counters.aborted.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .entries_written
            .fetch_add(report.written_count(), Ordering::Relaxed);
        counters
            .entry_failures
            .fetch_add(report.entry_failures(), Ordering::Relaxed);
        counters
            .derived_artifacts
            .fetch_add(report.derived.len(), Ordering::Relaxed);
    }
}

/// Plan and run a whole batch from configuration.
pub fn run_batch(
    config: &ExtractConfig,
    store: &dyn ObjectStore,
    publisher: &Publisher,
    cancel: &CancelToken,
    progress: Option<ProgressCallback>,
) -> Result<RunStats> {
    config.validate().context("Invalid configuration")?;
    let mut runner = BatchRunner::from_config(config)?;
    if let Some(cb) = progress {
        runner = runner.with_progress(cb);
    }
    let sources = runner.plan(store, &config.input_pattern)?;
    runner.run(store, &sources, publisher, cancel)
}
