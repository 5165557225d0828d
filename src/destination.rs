//! Destination key construction.
//!
//! Every extraction run writes below its own prefix:
//!
//! ```text
//! <output-dir>/<run-token><suffix>/<sanitized entry name>
//! gs://bucket/out/kQxbTMaeoP-unzip/scans/page1.tif
//! ```
//!
//! The token is drawn fresh for every run, so two runs over the same source
//! never overwrite each other, and repeating a run never reuses its old
//! prefix.

use uuid::Uuid;

use crate::archive::ArchiveKind;
use crate::error::ExtractError;
use crate::paths;
use crate::store::ObjectUri;

/// Characters a run token is drawn from.
pub const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRST";

/// Length of a run token.
pub const TOKEN_LEN: usize = 10;

// UUID v4 bytes 6 and 8 carry version/variant bits.
const RANDOM_BYTES: [usize; TOKEN_LEN] = [0, 1, 2, 3, 4, 5, 7, 9, 10, 11];

/// Generate a fresh run token.
pub fn run_token() -> String {
    let uuid = Uuid::new_v4();
    let bytes = uuid.as_bytes();
    RANDOM_BYTES
        .iter()
        .map(|&i| TOKEN_ALPHABET[bytes[i] as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Destination prefix for one run over one source object.
#[derive(Debug, Clone)]
pub struct DestinationPrefix {
    uri: ObjectUri,
    token: String,
}

impl DestinationPrefix {
    /// Build a prefix with a freshly generated run token.
    pub fn build(output_dir: &ObjectUri, kind: ArchiveKind) -> Self {
        Self::with_token(output_dir, kind, run_token())
    }

    pub fn with_token(output_dir: &ObjectUri, kind: ArchiveKind, token: String) -> Self {
        let uri = output_dir.join(&format!("{}{}", token, kind.destination_suffix()));
        Self { uri, token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn uri(&self) -> &ObjectUri {
        &self.uri
    }

    /// Compose the destination key for an archive entry.
    ///
    /// Rejects names that are absolute or climb out of the prefix.
    pub fn entry_key(&self, entry_name: &str) -> Result<ObjectUri, ExtractError> {
        let relative = sanitize_entry_name(entry_name)?;
        Ok(self.uri.join(&relative))
    }
}

/// Normalize an archive entry name to a relative `/`-separated path.
///
/// `.` and empty segments are dropped. Absolute paths, drive prefixes, `..`
/// segments and NUL bytes are rejected outright rather than rewritten.
pub fn sanitize_entry_name(name: &str) -> Result<String, ExtractError> {
    let unsafe_name = |reason| ExtractError::UnsafeEntryName {
        entry: name.to_string(),
        reason,
    };

    if name.contains('\0') {
        return Err(unsafe_name("contains NUL byte"));
    }

    let name_slashed = paths::to_forward_slashes(name);
    if name_slashed.starts_with('/') {
        return Err(unsafe_name("absolute path"));
    }
    let bytes = name_slashed.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(unsafe_name("drive-qualified path"));
    }

    let mut parts = Vec::new();
    for segment in name_slashed.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(unsafe_name("parent directory component")),
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(unsafe_name("empty path"));
    }
    Ok(parts.join("/"))
}
