//! Result aggregation: classify written keys and serialize the manifest.
//!
//! Three output shapes, selected by `ManifestMode`:
//!
//! ```json
//! {"parent-name": "batch", "extraction-path": "gs://b/out/kQxbTMaeoP-unzip"}
//! {"images": ["https://..."], "xmls": ["gs://..."], "others": ["gs://..."]}
//! {"images": ["https://..."]}
//! ```
//!
//! Field names are an external contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::store::ObjectUri;

/// Keys routed to the "images" bucket
pub const IMAGE_EXTENSIONS: &[&str] = &[".tif", ".tiff", ".png", ".jpg", ".jpeg"];

/// Keys routed to the "xmls" bucket
pub const METADATA_EXTENSIONS: &[&str] = &[".xml"];

/// Which manifest shape to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestMode {
    /// `{parent-name, extraction-path}`
    Simple,
    /// `{images, xmls, others}`
    #[default]
    Bucketed,
    /// `{images}`
    Images,
}

impl FromStr for ManifestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(ManifestMode::Simple),
            "bucketed" => Ok(ManifestMode::Bucketed),
            "images" => Ok(ManifestMode::Images),
            other => Err(format!(
                "unknown manifest mode '{}' (expected simple, bucketed or images)",
                other
            )),
        }
    }
}

impl fmt::Display for ManifestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ManifestMode::Simple => "simple",
            ManifestMode::Bucketed => "bucketed",
            ManifestMode::Images => "images",
        })
    }
}

/// Classification bucket for a written key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Images,
    Xmls,
    Others,
}

/// First matching rule wins.
pub fn classify(key: &str) -> Bucket {
    const RULES: &[(&[&str], Bucket)] = &[
        (IMAGE_EXTENSIONS, Bucket::Images),
        (METADATA_EXTENSIONS, Bucket::Xmls),
    ];
    RULES
        .iter()
        .find(|(exts, _)| paths::has_any_extension(key, exts))
        .map(|(_, bucket)| *bucket)
        .unwrap_or(Bucket::Others)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleManifest {
    #[serde(rename = "parent-name")]
    pub parent_name: String,
    #[serde(rename = "extraction-path")]
    pub extraction_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketedManifest {
    pub images: Vec<String>,
    pub xmls: Vec<String>,
    pub others: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesManifest {
    pub images: Vec<String>,
}

/// One manifest per source object. Built once, emitted once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    Simple(SimpleManifest),
    Bucketed(BucketedManifest),
    Images(ImagesManifest),
}

impl Manifest {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Number of keys listed (the simple shape lists none)
    pub fn key_count(&self) -> usize {
        match self {
            Manifest::Simple(_) => 0,
            Manifest::Bucketed(m) => m.images.len() + m.xmls.len() + m.others.len(),
            Manifest::Images(m) => m.images.len(),
        }
    }
}

/// Builds manifests in one configured shape.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    mode: ManifestMode,
    public_base_url: String,
}

impl ManifestBuilder {
    pub fn new(mode: ManifestMode, public_base_url: &str) -> Self {
        Self {
            mode,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `store://bucket/x.tif` -> `{public_base_url}/bucket/x.tif`
    pub fn public_uri(&self, uri: &ObjectUri) -> String {
        format!("{}/{}", self.public_base_url, uri.path())
    }

    /// `written` is every committed key for the source, in write order.
    /// `extraction_path` is empty when the source could not be opened.
    pub fn build(&self, source: &ObjectUri, extraction_path: &str, written: &[ObjectUri]) -> Manifest {
        match self.mode {
            ManifestMode::Simple => Manifest::Simple(SimpleManifest {
                parent_name: source.base_name().to_lowercase(),
                extraction_path: extraction_path.to_string(),
            }),
            ManifestMode::Bucketed => {
                let mut manifest = BucketedManifest::default();
                for key in written {
                    match classify(key.key()) {
                        Bucket::Images => manifest.images.push(self.public_uri(key)),
                        Bucket::Xmls => manifest.xmls.push(key.to_string()),
                        Bucket::Others => manifest.others.push(key.to_string()),
                    }
                }
                Manifest::Bucketed(manifest)
            }
            ManifestMode::Images => Manifest::Images(ImagesManifest {
                images: written
                    .iter()
                    .filter(|key| classify(key.key()) == Bucket::Images)
                    .map(|key| self.public_uri(key))
                    .collect(),
            }),
        }
    }
}
