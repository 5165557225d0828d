//! Glob matching over object keys.
//!
//! - `*` matches within one path segment
//! - `**` matches across segments
//! - `?` matches one non-separator character

use regex::Regex;

use crate::error::StoreError;

use super::{ObjectStore, ObjectUri};

const GLOB_CHARS: &[char] = &['*', '?'];

/// Translate a key glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() * 2 + 2);
    pattern.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                pattern.push_str(".*");
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }

    pattern.push('$');
    Regex::new(&pattern)
}

/// List every object matching `pattern` (`scheme://bucket/key-glob`), sorted.
pub fn match_objects(store: &dyn ObjectStore, pattern: &str) -> Result<Vec<ObjectUri>, StoreError> {
    let parsed = ObjectUri::parse(pattern)?;
    let key_glob = parsed.key();

    let literal_end = key_glob.find(GLOB_CHARS).unwrap_or(key_glob.len());
    let prefix = ObjectUri::new(parsed.scheme(), parsed.bucket(), &key_glob[..literal_end]);

    let regex = glob_to_regex(key_glob).map_err(|_| StoreError::InvalidUri {
        uri: pattern.to_string(),
        reason: "invalid glob pattern",
    })?;

    let mut matched: Vec<ObjectUri> = store
        .list(&prefix)?
        .into_iter()
        .filter(|uri| regex.is_match(uri.key()))
        .collect();
    matched.sort();
    matched.dedup();
    Ok(matched)
}
