//! Shared helpers for the index test suites.

use std::path::Path as FsPath;

use crate::index::path::Path;
use crate::index::types::Trigram;
use crate::index::write::IndexWriter;
use crate::index::Version;

pub(crate) fn tri(s: &str) -> Trigram {
    let b = s.as_bytes();
    (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
}

/// Build an index over in-memory files, optionally forcing a spill
/// mid-way to exercise the external-sort path.
pub(crate) fn build_flush_index(
    out: &FsPath,
    version: Version,
    roots: &[&str],
    do_flush: bool,
    file_data: &[(&str, &str)],
) {
    let mut ix = IndexWriter::create(out, version).unwrap();
    ix.add_roots(roots.iter().map(|&r| Path::from(r)));
    let mut files: Vec<(&str, &str)> = file_data.to_vec();
    files.sort_by(|(a, _), (b, _)| Path::from(*a).compare(&Path::from(*b)));
    let half = files.len() / 2;
    for (i, (name, data)) in files.iter().enumerate() {
        ix.add(name, data.as_bytes()).unwrap();
        if do_flush && i == half {
            ix.flush_post().unwrap();
        }
    }
    if do_flush {
        ix.flush_post().unwrap();
    }
    ix.flush().unwrap();
}

pub(crate) fn build_index(
    out: &FsPath,
    version: Version,
    roots: &[&str],
    file_data: &[(&str, &str)],
) {
    build_flush_index(out, version, roots, false, file_data);
}

/// The corpus behind the golden index images.
pub(crate) const TRIVIAL_FILES: &[(&str, &str)] = &[
    ("f0", "\n\n"),
    ("file1", "\na\n"),
    ("the/file", "\nab\n"),
    ("file3", "\nabc\n"),
    ("afile4", "\ndabc\n"),
    ("file5", "\nxyzw\n"),
];
