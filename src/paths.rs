//! Object key and entry name helpers
//!
//! Archive entry names and object keys are both `/`-separated strings, but
//! archives built on Windows often carry `\` separators and extensions in
//! any case. Everything here is string based; nothing touches the local
//! filesystem.

/// Convert Windows path separators to `/`
/// `scans\page1.TIF` -> `scans/page1.TIF`
pub fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Case-insensitive suffix match against a list of dotted extensions
/// (`&[".tif", ".tiff"]`).
pub fn has_any_extension(path: &str, extensions: &[&str]) -> bool {
    let lower = path.to_lowercase();
    extensions.iter().any(|ext| lower.ends_with(&ext.to_lowercase()))
}

/// Normalize a user supplied extension to dotted lowercase (`TIF` -> `.tif`)
pub fn dotted_extension(ext: &str) -> String {
    let trimmed = ext.trim().trim_start_matches('.');
    format!(".{}", trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_forward_slashes() {
        assert_eq!(to_forward_slashes("scans\\batch\\page.tif"), "scans/batch/page.tif");
        assert_eq!(to_forward_slashes("already/fine.xml"), "already/fine.xml");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("scans\\page.tif"), "page.tif");
        assert_eq!(file_name("page.tif"), "page.tif");
        assert_eq!(file_name("a/b/page.tif"), "page.tif");
    }

    #[test]
    fn test_has_any_extension() {
        assert!(has_any_extension("a/B.TIF", &[".tif", ".tiff"]));
        assert!(has_any_extension("a/b.tiff", &[".tif", ".tiff"]));
        assert!(!has_any_extension("a/b.tif.txt", &[".tif"]));
    }

    #[test]
    fn test_dotted_extension() {
        assert_eq!(dotted_extension("TIF"), ".tif");
        assert_eq!(dotted_extension(".xml"), ".xml");
    }
}
