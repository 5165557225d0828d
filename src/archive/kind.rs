use std::fmt;

use crate::paths;

/// Container format resolved from a source object's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// `.zip` suffix
    Zip,
    /// `.tar` suffix
    Tar,
    /// Anything else. Not an error: the source is skipped.
    Unsupported,
}

impl ArchiveKind {
    /// Resolve by case-insensitive suffix match. No magic-byte sniffing.
    pub fn from_name(name: &str) -> Self {
        if paths::has_any_extension(name, &[".zip"]) {
            ArchiveKind::Zip
        } else if paths::has_any_extension(name, &[".tar"]) {
            ArchiveKind::Tar
        } else {
            ArchiveKind::Unsupported
        }
    }

    /// Suffix appended to the run token in destination prefixes.
    pub fn destination_suffix(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "-unzip",
            ArchiveKind::Tar => "-untar",
            ArchiveKind::Unsupported => "",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ArchiveKind::Unsupported)
    }

    /// Get format name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
