//! Archive handling.
//!
//! Two pieces:
//! - `kind` resolves a source object name to a container format
//! - `reader` walks the container's entries strictly in order
//!
//! Decompression itself is left to the `zip` and `tar` crates. Both are driven
//! in streaming mode so a source never has to be seekable or fully buffered.

mod kind;
mod reader;

pub use kind::ArchiveKind;
pub use reader::{ArchiveEntry, EntryReader};
