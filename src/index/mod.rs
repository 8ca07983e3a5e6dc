//! On-disk trigram index: writing, reading, merging, validation.
//!
//! - [`write`] - streaming index construction with bounded memory
//! - [`read`] - memory-mapped read-only access and query evaluation
//! - [`merge`] - combine two indices, newer roots shadowing older files
//! - [`check`] - structural validation walk
//! - [`path`] - index path ordering and the prefix-compressed path codec
//! - [`delta`] - varint / Elias-γ delta coding of posting lists
//!
//! The byte-level file format is documented at the top of [`read`].

pub mod buffer;
pub mod check;
#[cfg(test)]
pub(crate) mod testutil;
pub mod delta;
pub mod merge;
pub mod path;
pub mod read;
pub mod types;
pub mod write;

pub use merge::merge;
pub use path::{Path, PathReader};
pub use read::Index;
pub use types::{bytes_to_trigram, trigram_to_bytes, FileId, Trigram};
pub use write::IndexWriter;

use std::path::PathBuf;

pub(crate) const MAGIC_V1: &str = "csearch index 1\n";
pub(crate) const MAGIC_V2: &str = "csearch index 2\n";
pub(crate) const TRAILER_MAGIC_V1: &str = "\ncsearch trailr\n";
pub(crate) const TRAILER_MAGIC_V2: &str = "\ncsearch trlr 2\n";

/// Posting index entries are packed into 256-byte blocks (v2).
pub(crate) const POST_BLOCK_SIZE: usize = 256;

/// Names are prefix-compressed in groups of 16 (v2).
pub(crate) const NAME_GROUP_SIZE: usize = 16;

/// Fixed v1 posting index entry: trigram[3] + count[4] + offset[4].
pub(crate) const POST_INDEX_ENTRY_SIZE_V1: usize = 3 + 4 + 4;

/// On-disk format version, selected explicitly at write time.
/// Readers accept either; new indices should be written as [`Version::V2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Legacy 32-bit format: NUL-terminated name lists, uvarint deltas,
    /// 4-byte trailer offsets.
    V1,
    /// Current format: prefix-compressed paths, Elias-γ deltas,
    /// block-packed posting index, 8-byte trailer values.
    V2,
}

/// The index file to use: `$CSEARCHINDEX` if set, otherwise
/// `$HOME/.csearchindex` (`%USERPROFILE%` on Windows).
pub fn default_index_file() -> PathBuf {
    if let Some(f) = std::env::var_os("CSEARCHINDEX") {
        if !f.is_empty() {
            return PathBuf::from(f);
        }
    }
    let mut home = std::env::var_os("HOME").unwrap_or_default();
    if cfg!(windows) && home.is_empty() {
        home = std::env::var_os("USERPROFILE").unwrap_or_default();
    }
    let mut p = PathBuf::from(home);
    p.push(".csearchindex");
    p
}
