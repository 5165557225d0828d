//! Entry writer
//!
//! Streams one archive member into a newly created destination object
//! through a pooled, fixed-size copy buffer, then optionally derives a
//! transcoded image next to it.
//!
//! Buffers come from a `BufferPool` shared by every worker, so memory stays
//! bounded by `buffer_size * concurrent entries` no matter how large the
//! entries are.

use std::collections::HashSet;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::ExtractError;
use crate::paths;
use crate::report::{ErrorReporter, ExtractionOutcome};
use crate::store::{ObjectStore, ObjectUri};

pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Content type for a destination object, by name suffix.
pub fn content_type_for(name: &str) -> &'static str {
    const TYPES: &[(&[&str], &str)] = &[
        (&[".zip"], "application/x-zip-compressed"),
        (&[".tar"], "application/x-tar"),
        (&[".tif", ".tiff"], "image/tiff"),
        (&[".png"], "image/png"),
        (&[".jpg", ".jpeg"], "image/jpeg"),
    ];
    TYPES
        .iter()
        .find(|(exts, _)| paths::has_any_extension(name, exts))
        .map(|(_, ct)| *ct)
        .unwrap_or("text/plain")
}

// ============================================================================
// Buffer pool
// ============================================================================

/// Reusable copy buffers of one fixed size.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Take an idle buffer or allocate one. It returns to the pool on drop.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer { buf, pool: self }
    }

    /// Buffers currently waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }
}

// ============================================================================
// Image conversion
// ============================================================================

/// Encoding of a derived image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageTarget {
    Png,
    Jpeg,
}

impl ImageTarget {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageTarget::Png => "png",
            ImageTarget::Jpeg => "jpg",
        }
    }

    pub fn format(&self) -> ImageFormat {
        match self {
            ImageTarget::Png => ImageFormat::Png,
            ImageTarget::Jpeg => ImageFormat::Jpeg,
        }
    }
}

impl FromStr for ImageTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "png" => Ok(ImageTarget::Png),
            "jpeg" | "jpg" => Ok(ImageTarget::Jpeg),
            other => Err(format!("unknown image target '{}' (expected png or jpeg)", other)),
        }
    }
}

/// Derived-artifact step: entries whose names end in one of
/// `source_extensions` get a transcoded sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConversion {
    pub target: ImageTarget,
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
}

fn default_source_extensions() -> Vec<String> {
    vec![".tif".to_string(), ".tiff".to_string()]
}

impl ImageConversion {
    pub fn new(target: ImageTarget) -> Self {
        Self {
            target,
            source_extensions: default_source_extensions(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let exts: Vec<&str> = self.source_extensions.iter().map(String::as_str).collect();
        paths::has_any_extension(name, &exts)
    }

    /// Decode `data` (encoding taken from `name`) and re-encode as the target.
    pub fn transcode(&self, name: &str, data: &[u8]) -> Result<Vec<u8>, String> {
        let source_format = Path::new(paths::file_name(name))
            .extension()
            .and_then(ImageFormat::from_extension)
            .ok_or_else(|| format!("no image decoder for '{}'", name))?;
        let img = image::load_from_memory_with_format(data, source_format)
            .map_err(|e| format!("decode failed: {}", e))?;

        // JPEG has no alpha channel
        let img = match self.target {
            ImageTarget::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
            ImageTarget::Png => img,
        };

        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, self.target.format())
            .map_err(|e| format!("encode failed: {}", e))?;
        Ok(out.into_inner())
    }
}

// ============================================================================
// Entry writer
// ============================================================================

/// Result of writing one entry: the primary outcome plus the derived
/// artifact's key when one was produced.
#[derive(Debug, Clone)]
pub struct WrittenEntry {
    pub outcome: ExtractionOutcome,
    pub derived: Option<ObjectUri>,
}

pub struct EntryWriter<'a> {
    store: &'a dyn ObjectStore,
    pool: &'a BufferPool,
    conversion: Option<&'a ImageConversion>,
    cancel: &'a CancelToken,
}

impl<'a> EntryWriter<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        pool: &'a BufferPool,
        conversion: Option<&'a ImageConversion>,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            store,
            pool,
            conversion,
            cancel,
        }
    }

    /// Copy `entry` to `key`.
    ///
    /// Primary and derived failures are recorded on `reporter` and reflected
    /// in the returned value. Only cancellation comes back as `Err`. A derived
    /// artifact is never written over a key in `taken`.
    pub fn write(
        &self,
        name: &str,
        entry: &mut dyn Read,
        key: &ObjectUri,
        taken: &HashSet<ObjectUri>,
        reporter: &mut ErrorReporter,
    ) -> Result<WrittenEntry, ExtractError> {
        info!(entry = name, key = %key, "extracting");

        match self.copy(name, entry, key) {
            Ok(bytes) => {
                info!(entry = name, key = %key, bytes, "extraction success");
            }
            Err(ExtractError::Cancelled) => return Err(ExtractError::Cancelled),
            Err(e) => {
                reporter.report_error(Some(name), &e);
                return Ok(WrittenEntry {
                    outcome: ExtractionOutcome::Failed {
                        entry: name.to_string(),
                        message: e.to_string(),
                    },
                    derived: None,
                });
            }
        }

        let derived = match self.conversion {
            Some(conversion) if conversion.matches(name) => {
                match self.derive(conversion, name, key, taken) {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        reporter.report_error(Some(name), &e);
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(WrittenEntry {
            outcome: ExtractionOutcome::Written {
                entry: name.to_string(),
                key: key.clone(),
            },
            derived,
        })
    }

    fn copy(&self, name: &str, entry: &mut dyn Read, key: &ObjectUri) -> Result<u64, ExtractError> {
        let write_err = |source: io::Error| ExtractError::EntryWrite {
            entry: name.to_string(),
            key: key.to_string(),
            source,
        };

        let mut writer = self
            .store
            .create(key, content_type_for(name))
            .map_err(|e| write_err(io::Error::other(e)))?;

        let mut buf = self.pool.acquire();
        let mut total = 0u64;
        loop {
            // Unfinished writer is discarded on return
            if self.cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            let n = match entry.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(write_err(e)),
            };
            writer.write_all(&buf[..n]).map_err(write_err)?;
            total += n as u64;
        }
        writer.flush().map_err(write_err)?;
        writer.finish().map_err(|e| write_err(io::Error::other(e)))?;
        Ok(total)
    }

    fn derive(
        &self,
        conversion: &ImageConversion,
        name: &str,
        key: &ObjectUri,
        taken: &HashSet<ObjectUri>,
    ) -> Result<ObjectUri, ExtractError> {
        let derived_err = |reason: String| ExtractError::DerivedArtifact {
            entry: name.to_string(),
            reason,
        };

        let sibling = key.with_extension(conversion.target.extension());
        if taken.contains(&sibling) || &sibling == key {
            return Err(derived_err(format!(
                "{} is already written from this archive",
                sibling
            )));
        }

        // Re-read what was committed rather than buffering the entry twice
        let mut data = Vec::new();
        self.store
            .open(key)
            .map_err(|e| derived_err(e.to_string()))?
            .read_to_end(&mut data)
            .map_err(|e| derived_err(format!("re-read failed: {}", e)))?;

        let encoded = conversion.transcode(name, &data).map_err(derived_err)?;

        let mut writer = self
            .store
            .create(&sibling, content_type_for(sibling.key()))
            .map_err(|e| derived_err(e.to_string()))?;
        writer
            .write_all(&encoded)
            .map_err(|e| derived_err(format!("write to {} failed: {}", sibling, e)))?;
        writer.finish().map_err(|e| derived_err(e.to_string()))?;

        debug!(entry = name, derived = %sibling, "derived artifact written");
        Ok(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::tiff_bytes;

    fn key(s: &str) -> ObjectUri {
        ObjectUri::parse(s).unwrap()
    }

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(content_type_for("a/b.ZIP"), "application/x-zip-compressed");
        assert_eq!(content_type_for("b.tar"), "application/x-tar");
        assert_eq!(content_type_for("scan.TIF"), "image/tiff");
        assert_eq!(content_type_for("scan.tiff"), "image/tiff");
        assert_eq!(content_type_for("scan.png"), "image/png");
        assert_eq!(content_type_for("scan.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("notes.xml"), "text/plain");
        assert_eq!(content_type_for("README"), "text/plain");
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let pool = BufferPool::new(MIN_BUFFER_SIZE);
        {
            let a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(a.len(), MIN_BUFFER_SIZE);
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 2);
        let _c = pool.acquire();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_pool_clamps_size() {
        assert_eq!(BufferPool::new(1).buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(BufferPool::new(usize::MAX).buffer_size(), MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_image_target_parse() {
        assert_eq!("PNG".parse::<ImageTarget>().unwrap(), ImageTarget::Png);
        assert_eq!("jpg".parse::<ImageTarget>().unwrap(), ImageTarget::Jpeg);
        assert!("webp".parse::<ImageTarget>().is_err());
    }

    #[test]
    fn test_copy_spans_many_chunks() {
        let store = MemoryStore::new();
        let pool = BufferPool::new(MIN_BUFFER_SIZE);
        let cancel = CancelToken::new();
        let writer = EntryWriter::new(&store, &pool, None, &cancel);
        let dest = key("mem://b/out/big.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut reporter = ErrorReporter::new(&key("mem://b/in.zip"));

        let written = writer
            .write("big.bin", &mut data.as_slice(), &dest, &HashSet::new(), &mut reporter)
            .unwrap();

        assert_eq!(written.outcome.written_key(), Some(&dest));
        assert_eq!(store.get(&dest).unwrap().data, data);
        assert_eq!(store.get(&dest).unwrap().content_type, "text/plain");
        assert!(reporter.records().is_empty());
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_cancelled_copy_leaves_nothing() {
        let store = MemoryStore::new();
        let pool = BufferPool::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let writer = EntryWriter::new(&store, &pool, None, &cancel);
        let dest = key("mem://b/out/a.txt");
        let mut reporter = ErrorReporter::new(&key("mem://b/in.zip"));

        let result = writer.write("a.txt", &mut &b"hello"[..], &dest, &HashSet::new(), &mut reporter);
        assert!(matches!(result, Err(ExtractError::Cancelled)));
        assert!(!store.contains(&dest));
    }

    #[test]
    fn test_tif_gets_png_sibling() {
        let store = MemoryStore::new();
        let pool = BufferPool::default();
        let cancel = CancelToken::new();
        let conversion = ImageConversion::new(ImageTarget::Png);
        let writer = EntryWriter::new(&store, &pool, Some(&conversion), &cancel);
        let dest = key("mem://b/out/scan.TIF");
        let tiff = tiff_bytes();
        let mut reporter = ErrorReporter::new(&key("mem://b/in.zip"));

        let written = writer
            .write("scan.TIF", &mut tiff.as_slice(), &dest, &HashSet::new(), &mut reporter)
            .unwrap();

        let sibling = key("mem://b/out/scan.png");
        assert_eq!(written.derived.as_ref(), Some(&sibling));
        let png = store.get(&sibling).unwrap();
        assert_eq!(png.content_type, "image/png");
        let decoded = image::load_from_memory_with_format(&png.data, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_derived_never_overwrites_taken_key() {
        let store = MemoryStore::new();
        let pool = BufferPool::default();
        let cancel = CancelToken::new();
        let conversion = ImageConversion::new(ImageTarget::Png);
        let writer = EntryWriter::new(&store, &pool, Some(&conversion), &cancel);
        let sibling = key("mem://b/out/scan.png");
        store.insert(&sibling, "image/png", b"ORIGINAL".to_vec());
        let taken = HashSet::from([sibling.clone()]);
        let tiff = tiff_bytes();
        let mut reporter = ErrorReporter::new(&key("mem://b/in.zip"));

        let written = writer
            .write("scan.tif", &mut tiff.as_slice(), &key("mem://b/out/scan.tif"), &taken, &mut reporter)
            .unwrap();

        assert!(written.outcome.written_key().is_some());
        assert!(written.derived.is_none());
        assert_eq!(store.get(&sibling).unwrap().data, b"ORIGINAL");
        assert_eq!(reporter.records().len(), 1);
        assert!(reporter.records()[0].message.contains("already written"));
    }

    #[test]
    fn test_jpeg_target() {
        let conversion = ImageConversion::new(ImageTarget::Jpeg);
        let out = conversion.transcode("scan.tif", &tiff_bytes()).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_bad_image_keeps_primary_write() {
        let store = MemoryStore::new();
        let pool = BufferPool::default();
        let cancel = CancelToken::new();
        let conversion = ImageConversion::new(ImageTarget::Png);
        let writer = EntryWriter::new(&store, &pool, Some(&conversion), &cancel);
        let dest = key("mem://b/out/broken.tif");
        let mut reporter = ErrorReporter::new(&key("mem://b/in.zip"));

        let written = writer
            .write("broken.tif", &mut &b"not a tiff"[..], &dest, &HashSet::new(), &mut reporter)
            .unwrap();

        assert_eq!(written.outcome.written_key(), Some(&dest));
        assert!(written.derived.is_none());
        assert_eq!(store.get(&dest).unwrap().data, b"not a tiff");
        assert!(!store.contains(&key("mem://b/out/broken.png")));
        assert_eq!(reporter.records().len(), 1);
        assert!(reporter.records()[0].message.contains("broken.tif"));
    }

    #[test]
    fn test_non_matching_entry_not_converted() {
        let conversion = ImageConversion::new(ImageTarget::Png);
        assert!(conversion.matches("a/B.TIFF"));
        assert!(!conversion.matches("a/b.png"));
    }
}
