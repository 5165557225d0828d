//! Local filesystem object store
//!
//! `scheme://bucket/key` maps to `<root>/<bucket>/<key>`. The scheme is kept
//! on listed URIs so manifests look the same as they would against the real
//! store.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::StoreError;

use super::{ObjectStore, ObjectUri, ObjectWriter};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a URI to a path under the root, refusing anything that would
    /// climb out of the bucket directory.
    pub fn path_for(&self, uri: &ObjectUri) -> Result<PathBuf, StoreError> {
        let mut path = self.root.join(uri.bucket());
        for component in Path::new(uri.key()).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(StoreError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "key escapes the bucket directory",
                    })
                }
            }
        }
        Ok(path)
    }
}

impl ObjectStore for LocalStore {
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn Read + Send>, StoreError> {
        let path = self.path_for(uri)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(uri.to_string()),
            _ => StoreError::io(uri.to_string(), e),
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn create(
        &self,
        uri: &ObjectUri,
        content_type: &str,
    ) -> Result<Box<dyn ObjectWriter>, StoreError> {
        let path = self.path_for(uri)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(|e| StoreError::io(uri.to_string(), e))?;

        let temp = NamedTempFile::new_in(&parent).map_err(|e| StoreError::io(uri.to_string(), e))?;
        debug!(uri = %uri, content_type, "creating object");

        Ok(Box::new(LocalWriter {
            uri: uri.to_string(),
            path,
            temp,
        }))
    }

    fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>, StoreError> {
        let bucket_dir = self.root.join(prefix.bucket());
        if !bucket_dir.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&bucket_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                StoreError::io(
                    prefix.to_string(),
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // In-flight writes from `create`
            if entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&bucket_dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix.key()) {
                found.push(ObjectUri::new(prefix.scheme(), prefix.bucket(), &key));
            }
        }
        found.sort();
        Ok(found)
    }
}

struct LocalWriter {
    uri: String,
    path: PathBuf,
    temp: NamedTempFile,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

impl ObjectWriter for LocalWriter {
    fn finish(self: Box<Self>) -> Result<(), StoreError> {
        let LocalWriter { uri, path, mut temp } = *self;
        temp.flush().map_err(|e| StoreError::io(uri.clone(), e))?;
        temp.persist(&path)
            .map_err(|e| StoreError::io(uri, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::new(dir.path());
        let uri = ObjectUri::parse("gs://bucket/out/run-unzip/docs/a.txt")?;

        let mut writer = store.create(&uri, "text/plain")?;
        writer.write_all(b"payload")?;
        writer.finish()?;

        let on_disk = dir.path().join("bucket/out/run-unzip/docs/a.txt");
        assert_eq!(fs::read(&on_disk)?, b"payload");

        let mut read_back = Vec::new();
        store.open(&uri)?.read_to_end(&mut read_back)?;
        assert_eq!(read_back, b"payload");
        Ok(())
    }

    #[test]
    fn test_unfinished_write_leaves_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::new(dir.path());
        let uri = ObjectUri::parse("gs://bucket/a.txt")?;
        {
            let mut writer = store.create(&uri, "text/plain")?;
            writer.write_all(b"partial")?;
        }
        assert!(!dir.path().join("bucket/a.txt").exists());
        assert!(store.list(&ObjectUri::parse("gs://bucket")?)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_keeps_scheme_and_filters_prefix() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("bucket/in/nested"))?;
        fs::write(dir.path().join("bucket/in/a.zip"), b"")?;
        fs::write(dir.path().join("bucket/in/nested/b.tar"), b"")?;
        fs::write(dir.path().join("bucket/top.zip"), b"")?;

        let store = LocalStore::new(dir.path());
        let listed = store.list(&ObjectUri::parse("gs://bucket/in/")?)?;
        let listed: Vec<String> = listed.iter().map(|u| u.to_string()).collect();
        assert_eq!(listed, vec!["gs://bucket/in/a.zip", "gs://bucket/in/nested/b.tar"]);
        Ok(())
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let uri = ObjectUri::parse("gs://bucket/missing.zip").unwrap();
        assert!(matches!(store.open(&uri), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_path_for_rejects_parent_components() {
        let store = LocalStore::new("/srv/store");
        let uri = ObjectUri::parse("gs://bucket/../../etc/passwd").unwrap();
        assert!(store.path_for(&uri).is_err());
    }
}
