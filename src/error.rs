use std::io;

use thiserror::Error;

/// Errors surfaced by the index and matcher layers.
///
/// Corruption is never converted into a silent result: readers either
/// return [`Error::Corrupt`] or, when opened in panic-on-corrupt mode,
/// panic at the point of detection. Per-file skip conditions in the
/// writer (binary content, long lines, too many trigrams) are not
/// errors; they are logged and the file is omitted.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural inconsistency in an index file: bad trailer magic,
    /// offset out of range, undecodable delta stream, missing posting
    /// terminator, name order violation. The file should be removed
    /// and rebuilt.
    #[error("corrupt index {file}: {detail}")]
    Corrupt { file: String, detail: String },

    /// A name passed to the writer is empty or contains framing bytes
    /// (controls below 0x20, or a misplaced archive separator).
    #[error("malformed name {0:?}")]
    MalformedName(String),

    /// Names must be added in strictly ascending path order.
    #[error("names not sorted: {name:?} <= {last:?}")]
    NamesOutOfOrder { name: String, last: String },

    /// Regex parse or compile error, surfaced intact.
    #[error("parsing regexp: {0}")]
    Regex(String),

    /// I/O failure on a temp file, the output file, or the memory
    /// map. Fatal for the current operation.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
