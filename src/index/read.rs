//! Read-only access to an index file.
//!
//! # Index format
//!
//! An index stored on disk has the format:
//!
//! ```text
//! "csearch index 2\n"
//! list of roots
//! list of names
//! list of posting lists
//! name index
//! posting list index
//! trailer
//! ```
//!
//! The root and name lists are sorted (by [`Path::compare`]) sequences
//! of prefix-compressed paths. Each path is encoded as a varint number
//! of prefix bytes to copy from the previous path, a varint number of
//! suffix bytes that follow, and the suffix bytes. The two-path
//! sequence {"abcdef", "abcx"} encodes as `[0 6 abcdef 3 1 x]`.
//!
//! In the name list, every 16th name has a forced prefix length of 0,
//! so random access is possible by starting at one of these group
//! heads. The name index lists the 8-byte big-endian offset of every
//! 16th name.
//!
//! Each posting list has the form:
//!
//! ```text
//! trigram [3]
//! deltas [γ]...
//! ```
//!
//! The delta list is a sequence of γ-coded deltas between file IDs,
//! ending with a zero delta: [2,5,1,1,0] encodes the file ID list
//! 1, 6, 7, 8. Empty posting lists are not recorded. The list of
//! posting lists ends with an entry with trigram 0xFFFFFF and a single
//! zero delta. In the γ-coding, which cannot represent 0, 0 encodes as
//! γ(16) and all values >= 16 encode as value+1.
//!
//! The posting list index is a sequence of entries
//!
//! ```text
//! trigram [3]
//! file count [varint]
//! offset delta [varint]
//! ```
//!
//! packed into 256-byte blocks: an entry that would cross a block
//! boundary is preceded by zero padding up to the boundary, and the
//! whole index is zero-padded to a block multiple. Offsets within a
//! block are delta-coded from a base that resets to 0 at the block
//! start. Lookup is a binary search over blocks by leading trigram,
//! then a linear walk within one block.
//!
//! The trailer holds eight 8-byte big-endian values - offset of root
//! list, number of roots, offset of name list, number of names, offset
//! of posting lists, number of posting lists, offset of name index,
//! offset of posting index - followed by the 16-byte trailer magic
//! `"\ncsearch trlr 2\n"`. Version detection uses the trailer magic,
//! not the header.
//!
//! # Old 32-bit version
//!
//! The v1 format differs as follows: header `"csearch index 1\n"`,
//! trailer `"\ncsearch trailr\n"` preceded by five 4-byte offsets (no
//! counts); root and name lists are NUL-terminated strings with a final
//! empty entry; the name index has a 4-byte entry for every name; the
//! posting deltas are uvarint-coded; posting index entries are fixed
//! 11-byte records with 4-byte count and absolute offset.

use std::path::Path as FsPath;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::index::delta::DeltaReader;
use crate::index::path::{Path, PathReader};
use crate::index::types::{FileId, Trigram};
use crate::index::{
    Version, NAME_GROUP_SIZE, POST_BLOCK_SIZE, POST_INDEX_ENTRY_SIZE_V1, TRAILER_MAGIC_V1,
    TRAILER_MAGIC_V2,
};
use crate::query::{Query, QueryOp};
use crate::utils::encoding::read_uvarint;

/// Read-only access to a sealed trigram index via a private memory map.
///
/// Every lookup borrows from the map, so derived readers live no longer
/// than the `Index`. An `Index` only reads immutable pages and may be
/// shared freely across threads.
#[derive(Debug)]
pub struct Index {
    pub(crate) name: String,
    data: Mmap,
    panic_on_corrupt: bool,
    pub(crate) version: Version,
    pub(crate) path_data: usize,
    pub(crate) num_path: i64, // -1 in v1: the list is self-terminating
    pub(crate) name_data: usize,
    pub(crate) post_data: usize,
    pub(crate) name_index: usize,
    pub(crate) num_name: usize,
    pub(crate) post_index: usize,
    pub(crate) num_post: usize,
    pub(crate) num_post_block: usize,
}

impl Index {
    /// Open an index file, reporting corruption as [`Error::Corrupt`].
    pub fn open(file: impl AsRef<FsPath>) -> Result<Index> {
        Index::open_with(file, false)
    }

    /// Open an index file. With `panic_on_corrupt` set, structural
    /// inconsistencies panic at the point of detection instead of
    /// returning an error; tests use this to pinpoint corruption.
    pub fn open_with(file: impl AsRef<FsPath>, panic_on_corrupt: bool) -> Result<Index> {
        let file = file.as_ref();
        let f = std::fs::File::open(file)?;
        let data = unsafe { Mmap::map(&f)? };
        let mut ix = Index {
            name: file.display().to_string(),
            data,
            panic_on_corrupt,
            version: Version::V2,
            path_data: 0,
            num_path: -1,
            name_data: 0,
            post_data: 0,
            name_index: 0,
            num_name: 0,
            post_index: 0,
            num_post: 0,
            num_post_block: 0,
        };

        if ix.data.len() < TRAILER_MAGIC_V1.len() {
            return Err(ix.corrupt("missing trailer"));
        }
        let magic = &ix.data[ix.data.len() - TRAILER_MAGIC_V1.len()..];
        if magic == TRAILER_MAGIC_V1.as_bytes() {
            ix.version = Version::V1;
            let n = ix.data.len() as i64 - TRAILER_MAGIC_V1.len() as i64 - 5 * 4;
            if n < 0 {
                return Err(ix.corrupt("truncated trailer"));
            }
            let n = n as usize;
            ix.path_data = ix.uint32(n)?;
            ix.name_data = ix.uint32(n + 4)?;
            ix.post_data = ix.uint32(n + 8)?;
            ix.name_index = ix.uint32(n + 12)?;
            ix.post_index = ix.uint32(n + 16)?;
            if ix.post_index < ix.name_index || n < ix.post_index {
                return Err(ix.corrupt("trailer offsets out of order"));
            }
            ix.num_name = ((ix.post_index - ix.name_index) / 4).saturating_sub(1);
            ix.num_post = (n - ix.post_index) / POST_INDEX_ENTRY_SIZE_V1;
        } else if magic == TRAILER_MAGIC_V2.as_bytes() {
            ix.version = Version::V2;
            let n = ix.data.len() as i64 - TRAILER_MAGIC_V2.len() as i64 - 8 * 8;
            if n < 0 {
                return Err(ix.corrupt("truncated trailer"));
            }
            let n = n as usize;
            ix.path_data = ix.uint64(n)?;
            ix.num_path = ix.uint64(n + 8)? as i64;
            ix.name_data = ix.uint64(n + 2 * 8)?;
            ix.num_name = ix.uint64(n + 3 * 8)?;
            ix.post_data = ix.uint64(n + 4 * 8)?;
            ix.num_post = ix.uint64(n + 5 * 8)?;
            ix.name_index = ix.uint64(n + 6 * 8)?;
            ix.post_index = ix.uint64(n + 7 * 8)?;
            if ix.post_index > n {
                return Err(ix.corrupt("trailer offsets out of order"));
            }
            ix.num_post_block = (n - ix.post_index) / POST_BLOCK_SIZE;
        } else {
            return Err(ix.corrupt("bad trailer magic"));
        }
        Ok(ix)
    }

    /// Build the corruption error (or panic, in panic-on-corrupt mode).
    pub(crate) fn corrupt(&self, detail: &str) -> Error {
        if self.panic_on_corrupt {
            panic!("corrupt index {}: {}", self.name, detail);
        }
        Error::Corrupt {
            file: self.name.clone(),
            detail: detail.to_string(),
        }
    }

    /// Number of indexed files.
    pub fn num_name(&self) -> usize {
        self.num_name
    }

    /// The slice of index data at `[off, off+n)`; `n < 0` means
    /// through the end of the file.
    pub(crate) fn slice(&self, off: usize, n: i64) -> Result<&[u8]> {
        if n < 0 {
            if off > self.data.len() {
                return Err(self.corrupt("offset out of range"));
            }
            return Ok(&self.data[off..]);
        }
        let end = off.checked_add(n as usize);
        match end {
            Some(end) if end <= self.data.len() => Ok(&self.data[off..end]),
            _ => Err(self.corrupt("offset out of range")),
        }
    }

    fn uint32(&self, off: usize) -> Result<usize> {
        let d = self.slice(off, 4)?;
        Ok(u32::from_be_bytes(d.try_into().unwrap()) as usize)
    }

    fn uint64(&self, off: usize) -> Result<usize> {
        let d = self.slice(off, 8)?;
        let v = u64::from_be_bytes(d.try_into().unwrap());
        if v > usize::MAX as u64 {
            return Err(self.corrupt("offset out of range"));
        }
        Ok(v as usize)
    }

    /// The list of indexed roots.
    pub fn roots(&self) -> Result<PathReader<'_>> {
        let d = self.slice(self.path_data, (self.name_data - self.path_data) as i64)?;
        Ok(PathReader::new(self.version, d, self.num_path))
    }

    /// The name corresponding to `fileid`.
    pub fn name(&self, fileid: FileId) -> Result<Path> {
        let r = self.names_at(fileid as usize, fileid as usize + 1)?;
        if !r.valid() {
            return Err(self.corrupt("file id out of range"));
        }
        Ok(r.path())
    }

    /// A cursor over the names for file IDs in `[min, max)`.
    pub fn names_at(&self, min: usize, max: usize) -> Result<PathReader<'_>> {
        if min >= self.num_name {
            return Ok(PathReader::new(Version::V1, &[], 0));
        }
        let mut limit = (max - min) as i64;
        let off;
        match self.version {
            Version::V1 => {
                off = self.uint32(self.name_index + min * 4)?;
            }
            Version::V2 => {
                off = self.uint64(self.name_index + min / NAME_GROUP_SIZE * 8)?;
                limit += (min % NAME_GROUP_SIZE) as i64;
            }
        }
        let start = self.name_data + off;
        if start > self.post_data {
            return Err(self.corrupt("name offset out of range"));
        }
        let d = self.slice(start, (self.post_data - start) as i64)?;
        let mut names = PathReader::new(self.version, d, limit);
        if self.version == Version::V2 {
            for _ in 0..min % NAME_GROUP_SIZE {
                names.next();
            }
        }
        Ok(names)
    }

    /// Iterate the names for file IDs in `[lo, hi)`.
    pub fn names(&self, lo: usize, hi: usize) -> Result<PathReader<'_>> {
        let mut r = self.names_at(lo, hi)?;
        if r.valid() {
            r.limit_remaining((hi - lo) as i64 - 1);
        }
        Ok(r)
    }

    /// Find the posting list for `trigram`: `(file count, byte offset
    /// into the posting data)`. Count 0 means the trigram is absent.
    fn find_list(&self, trigram: Trigram) -> Result<(usize, usize)> {
        if self.version == Version::V2 {
            return self.find_list_v2(trigram);
        }
        let d = self.slice(
            self.post_index,
            (self.num_post * POST_INDEX_ENTRY_SIZE_V1) as i64,
        )?;
        let tri_at = |i: usize| -> Trigram {
            let e = &d[i * POST_INDEX_ENTRY_SIZE_V1..];
            (e[0] as u32) << 16 | (e[1] as u32) << 8 | e[2] as u32
        };
        // binary search for the first entry >= trigram
        let (mut lo, mut hi) = (0usize, self.num_post);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if tri_at(mid) >= trigram {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo >= self.num_post || tri_at(lo) != trigram {
            return Ok((0, 0));
        }
        let e = &d[lo * POST_INDEX_ENTRY_SIZE_V1..(lo + 1) * POST_INDEX_ENTRY_SIZE_V1];
        let count = u32::from_be_bytes(e[3..7].try_into().unwrap()) as usize;
        let offset = u32::from_be_bytes(e[7..11].try_into().unwrap()) as usize;
        Ok((count, offset))
    }

    fn find_list_v2(&self, trigram: Trigram) -> Result<(usize, usize)> {
        let b = self.slice(
            self.post_index,
            (self.num_post_block * POST_BLOCK_SIZE) as i64,
        )?;
        let tri_at = |i: usize| -> Trigram {
            let e = &b[i * POST_BLOCK_SIZE..];
            (e[0] as u32) << 16 | (e[1] as u32) << 8 | e[2] as u32
        };
        // first block whose leading trigram is past the target
        let (mut lo, mut hi) = (0usize, self.num_post_block);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if tri_at(mid) > trigram {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo == 0 {
            return Ok((0, 0));
        }

        // walk the preceding block
        let mut b = &b[(lo - 1) * POST_BLOCK_SIZE..lo * POST_BLOCK_SIZE];
        let mut offset = 0usize;
        while b.len() >= 3 {
            let t = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
            if t == 0 {
                break;
            }
            let Some((count, n1)) = read_uvarint(&b[3..]) else {
                return Err(self.corrupt("posting index block malformed"));
            };
            let Some((o, n2)) = read_uvarint(&b[3 + n1..]) else {
                return Err(self.corrupt("posting index block malformed"));
            };
            offset += o as usize;
            if t == trigram {
                return Ok((count as usize, offset));
            }
            b = &b[3 + n1 + n2..];
        }
        Ok((0, 0))
    }

    /// The list of file IDs whose content contains `trigram`, in
    /// ascending order. Empty if the trigram does not occur.
    pub fn posting_list(&self, trigram: Trigram) -> Result<Vec<FileId>> {
        self.posting_list_restrict(trigram, None)
    }

    fn posting_list_restrict(
        &self,
        trigram: Trigram,
        restrict: Option<&[FileId]>,
    ) -> Result<Vec<FileId>> {
        let mut r = PostReader::new(self, trigram, restrict)?;
        let mut x = Vec::with_capacity(r.max());
        while r.next()? {
            x.push(r.fileid as FileId);
        }
        Ok(x)
    }

    /// Intersect `list` with the posting list for `trigram` in one pass.
    pub fn posting_and(&self, list: &[FileId], trigram: Trigram) -> Result<Vec<FileId>> {
        self.posting_and_restrict(list, trigram, None)
    }

    fn posting_and_restrict(
        &self,
        list: &[FileId],
        trigram: Trigram,
        restrict: Option<&[FileId]>,
    ) -> Result<Vec<FileId>> {
        let mut r = PostReader::new(self, trigram, restrict)?;
        let mut x = Vec::with_capacity(list.len());
        let mut i = 0;
        while r.next()? {
            let fileid = r.fileid as FileId;
            while i < list.len() && list[i] < fileid {
                i += 1;
            }
            if i < list.len() && list[i] == fileid {
                x.push(fileid);
                i += 1;
            }
        }
        Ok(x)
    }

    /// Union `list` with the posting list for `trigram` in one pass.
    pub fn posting_or(&self, list: &[FileId], trigram: Trigram) -> Result<Vec<FileId>> {
        self.posting_or_restrict(list, trigram, None)
    }

    fn posting_or_restrict(
        &self,
        list: &[FileId],
        trigram: Trigram,
        restrict: Option<&[FileId]>,
    ) -> Result<Vec<FileId>> {
        let mut r = PostReader::new(self, trigram, restrict)?;
        let mut x = Vec::with_capacity(list.len() + r.max());
        let mut i = 0;
        while r.next()? {
            let fileid = r.fileid as FileId;
            while i < list.len() && list[i] < fileid {
                x.push(list[i]);
                i += 1;
            }
            x.push(fileid);
            if i < list.len() && list[i] == fileid {
                i += 1;
            }
        }
        x.extend_from_slice(&list[i..]);
        Ok(x)
    }

    /// Evaluate a trigram query, returning the candidate file IDs in
    /// ascending order.
    pub fn posting_query(&self, q: &Query) -> Result<Vec<FileId>> {
        self.posting_query_restrict(q, None)
    }

    fn posting_query_restrict(&self, q: &Query, restrict: Option<&[FileId]>) -> Result<Vec<FileId>> {
        match q.op {
            QueryOp::None => Ok(Vec::new()),
            QueryOp::All => match restrict {
                Some(r) => Ok(r.to_vec()),
                None => Ok((0..self.num_name as FileId).collect()),
            },
            QueryOp::And => {
                let mut list: Option<Vec<FileId>> = None;
                for t in q.trigram_values() {
                    let next = match &list {
                        None => self.posting_list_restrict(t, restrict)?,
                        Some(l) => self.posting_and_restrict(l, t, restrict)?,
                    };
                    if next.is_empty() {
                        return Ok(Vec::new());
                    }
                    list = Some(next);
                }
                for sub in &q.sub {
                    let next = match &list {
                        None => self.posting_query_restrict(sub, restrict)?,
                        Some(l) => self.posting_query_restrict(sub, Some(l.as_slice()))?,
                    };
                    if next.is_empty() {
                        return Ok(Vec::new());
                    }
                    list = Some(next);
                }
                Ok(list.unwrap_or_default())
            }
            QueryOp::Or => {
                let mut list: Option<Vec<FileId>> = None;
                for t in q.trigram_values() {
                    let next = match &list {
                        None => self.posting_list_restrict(t, restrict)?,
                        Some(l) => self.posting_or_restrict(l, t, restrict)?,
                    };
                    list = Some(next);
                }
                for sub in &q.sub {
                    let list1 = self.posting_query_restrict(sub, restrict)?;
                    list = Some(merge_or(list.as_deref().unwrap_or(&[]), &list1));
                }
                Ok(list.unwrap_or_default())
            }
        }
    }

    /// Per-region sizes, for diagnostics.
    pub fn stats(&self) -> String {
        format!(
            "{} root list ({} roots)\n{} name list ({} names)\n{} posting lists ({} trigrams)\n{} name index\n{} posting index\n",
            self.name_data - self.path_data,
            self.num_path,
            self.post_data - self.name_data,
            self.num_name,
            self.name_index - self.post_data,
            self.num_post,
            self.post_index - self.name_index,
            self.num_post_block * POST_BLOCK_SIZE,
        )
    }
}

fn merge_or(l1: &[FileId], l2: &[FileId]) -> Vec<FileId> {
    let mut l = Vec::with_capacity(l1.len() + l2.len());
    let (mut i, mut j) = (0, 0);
    while i < l1.len() || j < l2.len() {
        if j == l2.len() || (i < l1.len() && l1[i] < l2[j]) {
            l.push(l1[i]);
            i += 1;
        } else if i == l1.len() || l1[i] > l2[j] {
            l.push(l2[j]);
            j += 1;
        } else {
            l.push(l1[i]);
            i += 1;
            j += 1;
        }
    }
    l
}

/// Cursor over one trigram's delta-coded posting list, optionally
/// filtered by an ascending restrict list.
pub(crate) struct PostReader<'a> {
    ix: Option<&'a Index>,
    count: usize,
    pub(crate) fileid: i64,
    delta: DeltaReader<'a>,
    restrict: Option<&'a [FileId]>,
}

impl<'a> PostReader<'a> {
    pub(crate) fn new(
        ix: &'a Index,
        trigram: Trigram,
        restrict: Option<&'a [FileId]>,
    ) -> Result<PostReader<'a>> {
        let (count, offset) = ix.find_list(trigram)?;
        if count == 0 {
            return Ok(PostReader {
                ix: None,
                count: 0,
                fileid: -1,
                delta: DeltaReader::new(ix.version, &[]),
                restrict: None,
            });
        }
        let d = ix.slice(ix.post_data + offset + 3, -1)?;
        Ok(PostReader {
            ix: Some(ix),
            count,
            fileid: -1,
            delta: DeltaReader::new(ix.version, d),
            restrict,
        })
    }

    pub(crate) fn max(&self) -> usize {
        self.count
    }

    pub(crate) fn next(&mut self) -> Result<bool> {
        let Some(ix) = self.ix else {
            return Ok(false);
        };
        while self.count > 0 {
            self.count -= 1;
            let delta = self.delta.next().map_err(|e| ix.corrupt(e))?;
            if delta == 0 {
                return Err(ix.corrupt("posting list delta is zero"));
            }
            self.fileid += delta as i64;
            if let Some(r) = &mut self.restrict {
                let mut i = 0;
                while i < r.len() && (r[i] as i64) < self.fileid {
                    i += 1;
                }
                *r = &r[i..];
                if r.is_empty() || r[0] as i64 != self.fileid {
                    continue;
                }
            }
            return Ok(true);
        }
        // the list must end with a 0 delta
        if self.delta.next().map_err(|e| ix.corrupt(e))? != 0 {
            return Err(ix.corrupt("posting list not terminated"));
        }
        self.delta.clear_bits();
        self.fileid = -1;
        Ok(false)
    }
}

/// Reader over a raw stream of posting runs (a writer spill file):
/// repeated `trigram [3] || deltas || 0`, with no index and no
/// sentinel. Yields packed post entries.
pub(crate) struct AllPostReader<'a> {
    trigram: Trigram,
    fileid: u64,
    started: bool,
    delta: DeltaReader<'a>,
}

impl<'a> AllPostReader<'a> {
    pub(crate) fn new(version: Version, data: &'a [u8]) -> AllPostReader<'a> {
        AllPostReader {
            trigram: 0,
            fileid: 0,
            started: false,
            delta: DeltaReader::new(version, data),
        }
    }

    pub(crate) fn next(&mut self) -> Result<Option<u64>> {
        loop {
            if !self.started {
                let d = self.delta.rest();
                if d.is_empty() {
                    return Ok(None);
                }
                if d.len() < 3 {
                    return Err(Error::Corrupt {
                        file: "<temp>".to_string(),
                        detail: "invalid temporary spill file".to_string(),
                    });
                }
                self.trigram = (d[0] as u32) << 16 | (d[1] as u32) << 8 | d[2] as u32;
                self.delta.set_rest(&d[3..]);
                self.fileid = u64::MAX; // so that fileid + delta starts at delta - 1
                self.started = true;
            }
            let delta = self.delta.next().map_err(|e| Error::Corrupt {
                file: "<temp>".to_string(),
                detail: e.to_string(),
            })?;
            if delta == 0 {
                self.delta.clear_bits();
                self.started = false;
                continue;
            }
            self.fileid = self.fileid.wrapping_add(delta);
            return Ok(Some(crate::index::types::make_post_entry(
                self.trigram,
                self.fileid,
            )));
        }
    }
}
