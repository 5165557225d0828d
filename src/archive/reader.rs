//! Sequential entry iteration over zip and tar streams.
//!
//! Container cursors are single-threaded and non-reentrant: an entry borrows
//! the underlying stream, so the next entry cannot be fetched until the
//! previous one is dropped. Whatever the visitor leaves unread is skipped by
//! the container crate before it advances.
//!
//! Zip members are read from their local headers while the stream allows it.
//! Members whose sizes only appear in a trailing data descriptor, encrypted
//! members and unknown compression methods need the central directory, so the
//! walk then spools the rest of the source to a temporary file and continues
//! from the central directory at the same member.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;

use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::ExtractError;

use super::ArchiveKind;

/// One archive member: its name and an exclusive, non-seekable byte source.
pub struct ArchiveEntry<'a> {
    name: String,
    reader: Box<dyn Read + 'a>,
}

impl<'a> ArchiveEntry<'a> {
    pub fn new(name: impl Into<String>, reader: Box<dyn Read + 'a>) -> Self {
        Self {
            name: name.into(),
            reader,
        }
    }

    /// A member whose data cannot be decoded. Every read fails with `reason`.
    pub fn unreadable(name: impl Into<String>, reason: &'static str) -> Self {
        Self::new(name, Box::new(Unreadable(reason)))
    }

    /// Name as stored in the archive (relative path, unsanitized)
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Read for ArchiveEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

struct Unreadable(&'static str);

impl Read for Unreadable {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, self.0))
    }
}

/// Drives a container's entry cursor over an opened source stream.
pub struct EntryReader {
    kind: ArchiveKind,
    source: Box<dyn Read + Send>,
    uri: String,
}

impl EntryReader {
    /// `uri` is only used in error messages.
    pub fn new(
        kind: ArchiveKind,
        source: Box<dyn Read + Send>,
        uri: impl Into<String>,
    ) -> Result<Self, ExtractError> {
        let uri = uri.into();
        if !kind.is_supported() {
            return Err(ExtractError::UnsupportedFormat(uri));
        }
        Ok(Self { kind, source, uri })
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Visit every file entry in archive order. Directory entries are skipped.
    ///
    /// Returns the number of entries handed to `visit`. Corrupt container
    /// framing ends the walk with `MalformedArchive`; the visitor can stop it
    /// early by returning `ControlFlow::Break`. A member that cannot be
    /// decoded (encryption, unknown compression) is still visited, and
    /// reading it fails.
    pub fn for_each_entry<F>(self, visit: F) -> Result<usize, ExtractError>
    where
        F: FnMut(ArchiveEntry<'_>) -> ControlFlow<()>,
    {
        let EntryReader { kind, source, uri } = self;
        match kind {
            ArchiveKind::Zip => walk_zip(source, &uri, visit),
            ArchiveKind::Tar => walk_tar(source, &uri, visit),
            ArchiveKind::Unsupported => Err(ExtractError::UnsupportedFormat(uri)),
        }
    }
}

fn malformed(uri: &str, reason: impl ToString) -> ExtractError {
    ExtractError::MalformedArchive {
        uri: uri.to_string(),
        reason: reason.to_string(),
    }
}

/// Fixed local header plus the longest possible name and extra field.
const MAX_LOCAL_HEADER: usize = 30 + 2 * u16::MAX as usize;

/// Counts the bytes pulled from a zip stream and keeps the ones read since
/// the last `mark`, so a local header the stream reader gave up on can be
/// put back in place.
struct HeaderTap<R> {
    inner: R,
    offset: u64,
    mark: u64,
    since_mark: Vec<u8>,
}

impl<R: Read> HeaderTap<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            mark: 0,
            since_mark: Vec::new(),
        }
    }

    fn mark(&mut self) {
        self.mark = self.offset;
        self.since_mark.clear();
    }

    /// Copy the rest of the source into an anonymous temp file, at the same
    /// offsets it has in the archive. Bytes before the mark are never read
    /// back and stay a hole.
    fn spool(mut self) -> io::Result<File> {
        let mut spool = tempfile::tempfile()?;
        spool.seek(SeekFrom::Start(self.mark))?;
        spool.write_all(&self.since_mark)?;
        io::copy(&mut self.inner, &mut spool)?;
        spool.flush()?;
        Ok(spool)
    }
}

impl<R: Read> Read for HeaderTap<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let room = MAX_LOCAL_HEADER.saturating_sub(self.since_mark.len());
        self.since_mark.extend_from_slice(&buf[..n.min(room)]);
        self.offset += n as u64;
        Ok(n)
    }
}

fn walk_zip<F>(source: Box<dyn Read + Send>, uri: &str, mut visit: F) -> Result<usize, ExtractError>
where
    F: FnMut(ArchiveEntry<'_>) -> ControlFlow<()>,
{
    let mut tap = HeaderTap::new(source);
    let mut visited = 0;
    // Local headers consumed, directories included
    let mut members = 0;

    // Local headers only; the central directory marks the end.
    loop {
        tap.mark();
        let file = match zip::read::read_zipfile_from_stream(&mut tap) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(visited),
            Err(ZipError::UnsupportedArchive(reason)) => {
                debug!(uri, member = members, reason, "falling back to the central directory");
                break;
            }
            Err(e) => return Err(malformed(uri, e)),
        };
        members += 1;
        if file.is_dir() {
            debug!(uri, entry = file.name(), "skipping directory entry");
            continue;
        }
        let name = file.name().to_string();
        visited += 1;
        if visit(ArchiveEntry::new(name, Box::new(file))).is_break() {
            return Ok(visited);
        }
    }

    let spool = tap.spool().map_err(|e| ExtractError::Spool {
        uri: uri.to_string(),
        source: e,
    })?;
    let archive = ZipArchive::new(spool).map_err(|e| malformed(uri, e))?;
    walk_zip_archive(archive, members, uri, visited, visit)
}

/// Continue a zip walk from member `first`, in central directory order.
fn walk_zip_archive<F>(
    mut archive: ZipArchive<File>,
    first: usize,
    uri: &str,
    mut visited: usize,
    mut visit: F,
) -> Result<usize, ExtractError>
where
    F: FnMut(ArchiveEntry<'_>) -> ControlFlow<()>,
{
    for index in first..archive.len() {
        let name = archive
            .name_for_index(index)
            .map(str::to_string)
            .ok_or_else(|| malformed(uri, format!("missing member {}", index)))?;
        let entry = match archive.by_index(index) {
            Ok(file) if file.is_dir() => None,
            Ok(file) => Some(ArchiveEntry::new(name, Box::new(file))),
            Err(ZipError::UnsupportedArchive(_)) if name.ends_with('/') => None,
            Err(ZipError::UnsupportedArchive(reason)) => Some(ArchiveEntry::unreadable(name, reason)),
            Err(e) => return Err(malformed(uri, e)),
        };
        let Some(entry) = entry else {
            debug!(uri, index, "skipping directory entry");
            continue;
        };
        visited += 1;
        if visit(entry).is_break() {
            break;
        }
    }
    Ok(visited)
}

fn walk_tar<F>(source: Box<dyn Read + Send>, uri: &str, mut visit: F) -> Result<usize, ExtractError>
where
    F: FnMut(ArchiveEntry<'_>) -> ControlFlow<()>,
{
    let mut archive = tar::Archive::new(source);
    let entries = archive.entries().map_err(|e| malformed(uri, e))?;

    let mut visited = 0;
    for entry in entries {
        let entry = entry.map_err(|e| malformed(uri, e))?;
        if !entry.header().entry_type().is_file() {
            debug!(
                uri,
                entry = %String::from_utf8_lossy(&entry.path_bytes()),
                "skipping non-file entry"
            );
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        visited += 1;
        if visit(ArchiveEntry::new(name, Box::new(entry))).is_break() {
            break;
        }
    }
    Ok(visited)
}
