//! In-memory object store.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;

use super::{ObjectStore, ObjectUri, ObjectWriter};

/// A stored object and the content type it was created with.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub data: Vec<u8>,
}

type Objects = BTreeMap<String, StoredObject>;

/// Mutex-guarded map of objects keyed by their full URI.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<Objects>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object directly, bypassing the writer protocol.
    pub fn insert(&self, uri: &ObjectUri, content_type: &str, data: impl Into<Vec<u8>>) {
        self.lock().insert(
            uri.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                data: data.into(),
            },
        );
    }

    pub fn get(&self, uri: &ObjectUri) -> Option<StoredObject> {
        self.lock().get(&uri.to_string()).cloned()
    }

    pub fn contains(&self, uri: &ObjectUri) -> bool {
        self.lock().contains_key(&uri.to_string())
    }

    /// All stored URIs, sorted.
    pub fn uris(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn open(&self, uri: &ObjectUri) -> Result<Box<dyn Read + Send>, StoreError> {
        let object = self
            .get(uri)
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
        Ok(Box::new(Cursor::new(object.data)))
    }

    fn create(
        &self,
        uri: &ObjectUri,
        content_type: &str,
    ) -> Result<Box<dyn ObjectWriter>, StoreError> {
        Ok(Box::new(MemoryWriter {
            objects: Arc::clone(&self.objects),
            uri: uri.to_string(),
            content_type: content_type.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn list(&self, prefix: &ObjectUri) -> Result<Vec<ObjectUri>, StoreError> {
        let wanted = if prefix.key().is_empty() {
            format!("{}/", prefix)
        } else {
            prefix.to_string()
        };
        self.lock()
            .keys()
            .filter(|uri| uri.starts_with(&wanted))
            .map(|uri| ObjectUri::parse(uri))
            .collect()
    }
}

struct MemoryWriter {
    objects: Arc<Mutex<Objects>>,
    uri: String,
    content_type: String,
    buffer: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectWriter for MemoryWriter {
    fn finish(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                this.uri,
                StoredObject {
                    content_type: this.content_type,
                    data: this.buffer,
                },
            );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_visible_only_after_finish() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let uri = ObjectUri::parse("mem://b/out/a.txt")?;

        let mut writer = store.create(&uri, "text/plain")?;
        writer.write_all(b"hello")?;
        assert!(!store.contains(&uri));

        writer.finish()?;
        let object = store.get(&uri).unwrap();
        assert_eq!(object.data, b"hello");
        assert_eq!(object.content_type, "text/plain");
        Ok(())
    }

    #[test]
    fn test_dropped_writer_discards_object() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let uri = ObjectUri::parse("mem://b/out/a.txt")?;
        {
            let mut writer = store.create(&uri, "text/plain")?;
            writer.write_all(b"partial")?;
        }
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn test_open_missing_object() {
        let store = MemoryStore::new();
        let uri = ObjectUri::parse("mem://b/missing.zip").unwrap();
        assert!(matches!(store.open(&uri), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_by_prefix() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert(&ObjectUri::parse("mem://b/in/a.zip")?, "x", vec![]);
        store.insert(&ObjectUri::parse("mem://b/in/b.tar")?, "x", vec![]);
        store.insert(&ObjectUri::parse("mem://b/other/c.zip")?, "x", vec![]);

        let listed = store.list(&ObjectUri::parse("mem://b/in/")?)?;
        assert_eq!(listed.len(), 2);
        Ok(())
    }
}
