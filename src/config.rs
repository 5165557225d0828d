//! Run configuration
//!
//! Loaded from an optional JSON file, then overridden by CLI flags.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, ErrorIsolation};
use crate::error::StoreError;
use crate::manifest::ManifestMode;
use crate::paths;
use crate::pipeline::Topics;
use crate::store::ObjectUri;
use crate::writer::{ImageConversion, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};

pub const DEFAULT_PUBLIC_BASE_URL: &str = "https://storage.googleapis.com";
pub const DEFAULT_OUTPUT_TOPIC: &str = "extraction-results";
pub const DEFAULT_ERROR_TOPIC: &str = "extraction-errors";

/// Configuration for an extraction run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Glob over source objects (`gs://bucket/in/**/*.zip`)
    pub input_pattern: String,

    /// Directory below which run prefixes are created
    pub output_dir: String,

    pub output_topic: String,
    pub error_topic: String,

    pub manifest_mode: ManifestMode,
    pub isolation: ErrorIsolation,

    /// Derived image step, off when absent
    pub image_conversion: Option<ImageConversion>,

    /// Copy buffer size in bytes
    pub buffer_size: usize,

    /// Replaces `scheme://` for keys in the images bucket
    pub public_base_url: String,

    /// Bound on the publisher drain at shutdown
    pub drain_timeout_secs: u64,

    pub report_unsupported: bool,
    pub keep_partial_on_abort: bool,

    /// Only extract entries with these extensions (empty = all)
    pub only_extensions: Vec<String>,

    /// Worker threads (0 = one per core)
    pub threads: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            input_pattern: String::new(),
            output_dir: String::new(),
            output_topic: DEFAULT_OUTPUT_TOPIC.to_string(),
            error_topic: DEFAULT_ERROR_TOPIC.to_string(),
            manifest_mode: ManifestMode::default(),
            isolation: ErrorIsolation::default(),
            image_conversion: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            drain_timeout_secs: 60,
            report_unsupported: false,
            keep_partial_on_abort: false,
            only_extensions: Vec::new(),
            threads: 0,
        }
    }
}

impl ExtractConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_pattern.trim().is_empty() {
            return Err(ConfigError::MissingInputPattern);
        }
        ObjectUri::parse(&self.input_pattern).map_err(ConfigError::InvalidUri)?;

        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::MissingOutputDir);
        }
        ObjectUri::parse(&self.output_dir).map_err(ConfigError::InvalidUri)?;

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::BufferSize {
                size: self.buffer_size,
                min: MIN_BUFFER_SIZE,
                max: MAX_BUFFER_SIZE,
            });
        }

        if self.output_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("output"));
        }
        if self.error_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic("error"));
        }

        if !self.public_base_url.starts_with("http://") && !self.public_base_url.starts_with("https://") {
            return Err(ConfigError::PublicBaseUrl(self.public_base_url.clone()));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let output_dir = ObjectUri::parse(&self.output_dir).map_err(ConfigError::InvalidUri)?;
        Ok(EngineConfig {
            output_dir,
            manifest_mode: self.manifest_mode,
            isolation: self.isolation,
            conversion: self.image_conversion.clone(),
            buffer_size: self.buffer_size,
            public_base_url: self.public_base_url.clone(),
            report_unsupported: self.report_unsupported,
            keep_partial_on_abort: self.keep_partial_on_abort,
            only_extensions: self
                .only_extensions
                .iter()
                .map(|ext| paths::dotted_extension(ext))
                .collect(),
        })
    }

    pub fn topics(&self) -> Topics {
        Topics {
            output: self.output_topic.clone(),
            errors: self.error_topic.clone(),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Input pattern is required")]
    MissingInputPattern,

    #[error("Output directory is required")]
    MissingOutputDir,

    #[error(transparent)]
    InvalidUri(StoreError),

    #[error("Buffer size {size} outside {min}..={max} bytes")]
    BufferSize { size: usize, min: usize, max: usize },

    #[error("The {0} topic must not be empty")]
    EmptyTopic(&'static str),

    #[error("Public base URL must be http(s): {0}")]
    PublicBaseUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::ImageTarget;
    use std::io::Write;

    fn valid() -> ExtractConfig {
        ExtractConfig {
            input_pattern: "gs://bucket/in/*.zip".to_string(),
            output_dir: "gs://bucket/out".to_string(),
            ..ExtractConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ExtractConfig::default();
        assert_eq!(config.buffer_size, 256 * 1024);
        assert_eq!(config.drain_timeout(), Duration::from_secs(60));
        assert_eq!(config.public_base_url, "https://storage.googleapis.com");
        assert_eq!(config.manifest_mode, ManifestMode::Bucketed);
        assert!(!config.report_unsupported);
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(matches!(
            ExtractConfig::default().validate(),
            Err(ConfigError::MissingInputPattern)
        ));

        let mut config = valid();
        config.output_dir.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingOutputDir)));

        let mut config = valid();
        config.buffer_size = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::BufferSize { .. })));

        let mut config = valid();
        config.error_topic = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTopic("error"))));

        let mut config = valid();
        config.output_dir = "not-a-uri".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUri(_))));
    }

    #[test]
    fn test_load_partial_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "input_pattern": "gs://b/in/**/*.tar",
                "output_dir": "gs://b/out",
                "manifest_mode": "images",
                "isolation": "abort",
                "image_conversion": {{"target": "png"}},
                "only_extensions": ["TIF"]
            }}"#
        )?;

        let config = ExtractConfig::load(file.path())?;
        config.validate()?;
        assert_eq!(config.manifest_mode, ManifestMode::Images);
        assert_eq!(config.isolation, ErrorIsolation::Abort);
        assert_eq!(config.output_topic, DEFAULT_OUTPUT_TOPIC);

        let engine = config.engine_config()?;
        assert_eq!(engine.conversion, Some(ImageConversion::new(ImageTarget::Png)));
        assert_eq!(engine.only_extensions, vec![".tif".to_string()]);
        assert_eq!(engine.output_dir.to_string(), "gs://b/out");
        Ok(())
    }

    #[test]
    fn test_load_rejects_bad_json() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{{ not json")?;
        let err = ExtractConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
        Ok(())
    }
}
