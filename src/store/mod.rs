//! Object store interface.
//!
//! The extraction engine only ever sees an `ObjectStore`: open a readable
//! stream, create a writable one, list keys. Two backends ship with the
//! crate:
//! - `LocalStore` maps `scheme://bucket/key` onto a directory tree
//! - `MemoryStore` keeps everything in a map (tests, dry runs)

mod local;
mod matcher;
mod memory;

pub use local::LocalStore;
pub use matcher::{glob_to_regex, match_objects};
pub use memory::MemoryStore;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::StoreError;

/// A fully qualified object location: `scheme://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUri {
    pub fn new(scheme: &str, bucket: &str, key: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self, StoreError> {
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing scheme separator '://'",
        })?;
        if scheme.is_empty() {
            return Err(StoreError::InvalidUri {
                uri: uri.to_string(),
                reason: "empty scheme",
            });
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StoreError::InvalidUri {
                uri: uri.to_string(),
                reason: "empty bucket",
            });
        }
        Ok(Self::new(scheme, bucket, key))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment of the key (`a/b/c.zip` -> `c.zip`)
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    /// File name without its last extension (`c.tar` -> `c`)
    pub fn base_name(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(idx) if idx > 0 => &name[..idx],
            _ => name,
        }
    }

    /// Append a relative path below this key.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        let key = match self.key.trim_end_matches('/') {
            "" => relative.to_string(),
            base => format!("{}/{}", base, relative),
        };
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Same location with the last extension replaced (`x.tif` -> `x.png`).
    pub fn with_extension(&self, extension: &str) -> Self {
        let name_start = self.key.rfind('/').map(|i| i + 1).unwrap_or(0);
        let stem_end = match self.key[name_start..].rfind('.') {
            Some(idx) if idx > 0 => name_start + idx,
            _ => self.key.len(),
        };
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: format!("{}.{}", &self.key[..stem_end], extension),
        }
    }

    /// Everything after `scheme://`
    pub fn path(&self) -> String {
        if self.key.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}/{}", self.bucket, self.key)
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path())
    }
}

impl FromStr for ObjectUri {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Writable object stream. Nothing is visible in the store until `finish`
/// succeeds; dropping an unfinished writer discards the object.
pub trait ObjectWriter: Write + Send {
    fn finish(self: Box<Self>) -> Result<(), StoreError>;
}

/// Readable/writable byte channels over an object store.
pub trait ObjectStore: Send + Sync {
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn Read + Send>, StoreError>;

    fn create(
        &self,
        uri: &ObjectUri,
        content_type: &str,
    ) -> Result<Box<dyn ObjectWriter>, StoreError>;

    /// All objects whose key starts with `prefix.key()` in `prefix.bucket()`.
    fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let uri = ObjectUri::parse("gs://bucket/dir/archive.zip").unwrap();
        assert_eq!(uri.scheme(), "gs");
        assert_eq!(uri.bucket(), "bucket");
        assert_eq!(uri.key(), "dir/archive.zip");
        assert_eq!(uri.to_string(), "gs://bucket/dir/archive.zip");
    }

    #[test]
    fn test_parse_bucket_only() {
        let uri = ObjectUri::parse("gs://bucket").unwrap();
        assert_eq!(uri.key(), "");
        assert_eq!(uri.to_string(), "gs://bucket");
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(ObjectUri::parse("bucket/key").is_err());
        assert!(ObjectUri::parse("://bucket/key").is_err());
        assert!(ObjectUri::parse("gs:///key").is_err());
    }

    #[test]
    fn test_file_and_base_name() {
        let uri = ObjectUri::parse("gs://b/in/Patents.Batch.ZIP").unwrap();
        assert_eq!(uri.file_name(), "Patents.Batch.ZIP");
        assert_eq!(uri.base_name(), "Patents.Batch");

        let uri = ObjectUri::parse("gs://b/in/noext").unwrap();
        assert_eq!(uri.base_name(), "noext");
    }

    #[test]
    fn test_join() {
        let uri = ObjectUri::parse("gs://b/out/").unwrap();
        assert_eq!(uri.join("abc-unzip/x.txt").to_string(), "gs://b/out/abc-unzip/x.txt");

        let root = ObjectUri::parse("gs://b").unwrap();
        assert_eq!(root.join("x.txt").to_string(), "gs://b/x.txt");
    }

    #[test]
    fn test_with_extension() {
        let uri = ObjectUri::parse("gs://b/out/scan.v1/page.tif").unwrap();
        assert_eq!(uri.with_extension("png").to_string(), "gs://b/out/scan.v1/page.png");

        let uri = ObjectUri::parse("gs://b/out.d/page").unwrap();
        assert_eq!(uri.with_extension("png").to_string(), "gs://b/out.d/page.png");
    }
}
