//! objunpack - archive extraction over object stores
//!
//! Opens zip/tar objects, writes every entry below a per-run destination
//! prefix, and publishes one manifest per source plus plain-text error
//! records.

pub mod archive;
pub mod cancel;
pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod publish;
pub mod report;
pub mod store;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use cancel::CancelToken;
pub use config::ExtractConfig;
pub use engine::{Engine, EngineConfig, ExtractionReport};
pub use pipeline::{run_batch, BatchRunner, RunStats};
