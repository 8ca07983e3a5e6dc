//! Merging indexes.
//!
//! To merge two indexes A (older) and B (newer) into a combined index:
//!
//! Walk B's root list and determine, for each root, the range of A's
//! file IDs it shadows: everything in `[root, root+0x02)` under path
//! ordering, which covers the root itself, its subtree (separators
//! order as 0), and any archive members (`\x01`). Names of A outside
//! every shadow and all names of B survive, and the walk assigns each
//! surviving run a contiguous range of new file IDs, summarized as
//! idrange tables (at most one entry per root).
//!
//! Then stream both name lists through the idrange tables into the
//! merged prefix-compressed name list, merge the two posting streams
//! while remapping file IDs (dropping shadowed ones), write a fresh
//! posting index, and finish with the merged root list and trailer.
//! The caller replaces the old index atomically by rename.

use std::path::Path as FsPath;

use crate::error::Result;
use crate::index::buffer::{copy_file, Buffer};
use crate::index::delta::DeltaReader;
use crate::index::path::{Path, PathReader, PathWriter};
use crate::index::read::Index;
use crate::index::types::{Trigram, INVALID_TRIGRAM};
use crate::index::write::PostDataWriter;
use crate::index::{
    Version, MAGIC_V1, MAGIC_V2, NAME_GROUP_SIZE, TRAILER_MAGIC_V1, TRAILER_MAGIC_V2,
};

/// Records that source file IDs `[lo, hi)` map to `[new, new+hi-lo)`.
#[derive(Debug, Clone, Copy)]
struct IdRange {
    lo: usize,
    hi: usize,
    new: usize,
}

/// Merge `src1` (older) and `src2` (newer) into a new index at `dst`.
/// Where both sources claim a path, `src2` wins.
pub fn merge(
    dst: impl AsRef<FsPath>,
    src1: impl AsRef<FsPath>,
    src2: impl AsRef<FsPath>,
    version: Version,
) -> Result<()> {
    let ix1 = Index::open(src1)?;
    let ix2 = Index::open(src2)?;
    let roots1 = ix1.roots()?.collect_paths();
    let roots2 = ix2.roots()?.collect_paths();

    // Build the file ID maps.
    let mut map1: Vec<IdRange> = Vec::new();
    let mut map2: Vec<IdRange> = Vec::new();
    {
        let mut c1 = ix1.names_at(0, ix1.num_name)?;
        let mut c2 = ix2.names_at(0, ix2.num_name)?;
        let (mut i1, mut i2, mut new) = (0usize, 0usize, 0usize);
        for root in &roots2 {
            // A's names before this root survive.
            let old = i1;
            while c1.valid() && c1.path().compare(root) == std::cmp::Ordering::Less {
                c1.next();
                i1 += 1;
            }
            if old < i1 {
                map1.push(IdRange {
                    lo: old,
                    hi: i1,
                    new,
                });
                new += i1 - old;
            }
            // A's names inside the shadow are dropped.
            let limit = root.shadow_limit();
            while c1.valid() && c1.path().compare(&limit) == std::cmp::Ordering::Less {
                c1.next();
                i1 += 1;
            }
            // B's names cannot have gaps between roots.
            if c2.valid() && c2.path().compare(root) == std::cmp::Ordering::Less {
                return Err(ix2.corrupt("name outside its root during merge"));
            }
            let lo = i2;
            while c2.valid() && c2.path().compare(&limit) == std::cmp::Ordering::Less {
                c2.next();
                i2 += 1;
            }
            if lo < i2 {
                map2.push(IdRange {
                    lo,
                    hi: i2,
                    new,
                });
                new += i2 - lo;
            }
        }
        // Whatever remains of A survives unshadowed.
        if c1.valid() {
            let old = i1;
            while c1.valid() {
                c1.next();
                i1 += 1;
            }
            map1.push(IdRange {
                lo: old,
                hi: i1,
                new,
            });
            new += i1 - old;
        }
        if c2.valid() {
            return Err(ix2.corrupt("name outside every root during merge"));
        }
    }
    let num_name: usize = map1.iter().chain(map2.iter()).map(|r| r.hi - r.lo).sum();

    let mut out = Buffer::create(dst.as_ref(), version)?;
    out.write_str(match version {
        Version::V1 => MAGIC_V1,
        Version::V2 => MAGIC_V2,
    })?;

    // Merged root list, dropping roots covered by a previous one.
    let path_data = out.offset();
    let mut root_writer = PathWriter::new(version, 0, path_data);
    {
        let (mut m1, mut m2) = (0usize, 0usize);
        let mut last: Option<Path> = None;
        while m1 < roots1.len() || m2 < roots2.len() {
            let take1 = m2 >= roots2.len()
                || (m1 < roots1.len()
                    && roots1[m1].compare(&roots2[m2]) != std::cmp::Ordering::Greater);
            let p = if take1 {
                let p = roots1[m1].clone();
                m1 += 1;
                p
            } else {
                let p = roots2[m2].clone();
                m2 += 1;
                p
            };
            if let Some(prev) = &last {
                if p.has_path_prefix(prev) {
                    continue;
                }
            }
            root_writer.write(&mut out, None, &p)?;
            last = Some(p);
        }
        if version == Version::V1 {
            root_writer.write(&mut out, None, &Path::default())?;
        }
    }
    let num_path = match version {
        Version::V1 => root_writer.count() - 1,
        Version::V2 => root_writer.count(),
    };
    out.align(16)?;

    // Merged name list, in new file ID order.
    let name_data = out.offset();
    let mut name_index = Buffer::temp(version)?;
    {
        let mut names = PathWriter::new(version, NAME_GROUP_SIZE, name_data);
        let mut c1 = NameCursor::new(&ix1)?;
        let mut c2 = NameCursor::new(&ix2)?;
        let (mut m1, mut m2) = (0usize, 0usize);
        let mut new = 0usize;
        while new < num_name {
            if m1 < map1.len() && map1[m1].new == new {
                c1.copy_range(&map1[m1], &mut names, &mut out, &mut name_index)?;
                new += map1[m1].hi - map1[m1].lo;
                m1 += 1;
            } else if m2 < map2.len() && map2[m2].new == new {
                c2.copy_range(&map2[m2], &mut names, &mut out, &mut name_index)?;
                new += map2[m2].hi - map2[m2].lo;
                m2 += 1;
            } else {
                return Err(ix1.corrupt("inconsistent id ranges during merge"));
            }
        }
        if version == Version::V1 {
            names.write(&mut out, Some(&mut name_index), &Path::default())?;
        }
    }
    out.align(16)?;

    // Merged posting lists, remapped into the new file ID space.
    let post_data = out.offset();
    let mut w = PostDataWriter::new(post_data, version, true)?;
    {
        let mut r1 = PostMapReader::new(&ix1, &map1)?;
        let mut r2 = PostMapReader::new(&ix2, &map2)?;
        loop {
            if r1.trigram < r2.trigram {
                w.trigram(&out, r1.trigram);
                while r1.next_id()? {
                    w.fileid(&mut out, r1.fileid as u64)?;
                }
                r1.next_trigram()?;
                w.end_trigram(&mut out)?;
            } else if r2.trigram < r1.trigram {
                w.trigram(&out, r2.trigram);
                while r2.next_id()? {
                    w.fileid(&mut out, r2.fileid as u64)?;
                }
                r2.next_trigram()?;
                w.end_trigram(&mut out)?;
            } else {
                if r1.trigram == u32::MAX {
                    break;
                }
                w.trigram(&out, r1.trigram);
                r1.next_id()?;
                r2.next_id()?;
                while r1.fileid != -1 || r2.fileid != -1 {
                    if (r1.fileid as u64) < (r2.fileid as u64) {
                        w.fileid(&mut out, r1.fileid as u64)?;
                        r1.next_id()?;
                    } else if (r2.fileid as u64) < (r1.fileid as u64) {
                        w.fileid(&mut out, r2.fileid as u64)?;
                        r2.next_id()?;
                    } else {
                        return Err(ix1.corrupt("duplicate file id during posting merge"));
                    }
                }
                r1.next_trigram()?;
                r2.next_trigram()?;
                w.end_trigram(&mut out)?;
            }
        }
        w.finish(&mut out)?;
    }
    let num_post = w.num_trigram();
    out.align(16)?;

    // Name index.
    let name_index_off = out.offset();
    copy_file(&mut out, &mut name_index)?;
    out.align(16)?;

    // Posting index.
    let post_index_off = out.offset();
    let mut post_index = w.into_index().expect("posting index buffer");
    copy_file(&mut out, &mut post_index)?;

    match version {
        Version::V1 => {
            out.write_uint(path_data)?;
            out.write_uint(name_data)?;
            out.write_uint(post_data)?;
            out.write_uint(name_index_off)?;
            out.write_uint(post_index_off)?;
            out.write_str(TRAILER_MAGIC_V1)?;
        }
        Version::V2 => {
            out.write_uint(path_data)?;
            out.write_uint(num_path as u64)?;
            out.write_uint(name_data)?;
            out.write_uint(num_name as u64)?;
            out.write_uint(post_data)?;
            out.write_uint(num_post as u64)?;
            out.write_uint(name_index_off)?;
            out.write_uint(post_index_off)?;
            out.write_str(TRAILER_MAGIC_V2)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Sequential cursor over a source index's name list, able to skip to
/// a range's start and copy it into the merged name writer.
struct NameCursor<'a> {
    reader: PathReader<'a>,
    pos: usize,
}

impl<'a> NameCursor<'a> {
    fn new(ix: &'a Index) -> Result<NameCursor<'a>> {
        Ok(NameCursor {
            reader: ix.names_at(0, ix.num_name)?,
            pos: 0,
        })
    }

    fn copy_range(
        &mut self,
        r: &IdRange,
        names: &mut PathWriter,
        data: &mut Buffer,
        index: &mut Buffer,
    ) -> Result<()> {
        while self.pos < r.lo {
            self.reader.next();
            self.pos += 1;
        }
        for _ in r.lo..r.hi {
            names.write(data, Some(index), &self.reader.path())?;
            self.reader.next();
            self.pos += 1;
        }
        Ok(())
    }
}

/// Sequential reader over a source index's posting-list stream,
/// translating file IDs through an idrange table. IDs outside the
/// table (shadowed files) are dropped.
struct PostMapReader<'a> {
    ix: &'a Index,
    idmap: &'a [IdRange],
    trigram: u32, // u32::MAX once the stream is exhausted
    oldid: i64,
    fileid: i64, // -1 when the current list is exhausted
    i: usize,
    exhausted: bool,
    delta: DeltaReader<'a>,
}

impl<'a> PostMapReader<'a> {
    fn new(ix: &'a Index, idmap: &'a [IdRange]) -> Result<PostMapReader<'a>> {
        let data = ix.slice(ix.post_data, (ix.name_index - ix.post_data) as i64)?;
        let mut r = PostMapReader {
            ix,
            idmap,
            trigram: u32::MAX,
            oldid: -1,
            fileid: -1,
            i: 0,
            exhausted: false,
            delta: DeltaReader::new(ix.version, data),
        };
        r.load()?;
        Ok(r)
    }

    fn next_trigram(&mut self) -> Result<()> {
        self.load()
    }

    /// Position at the next posting list's header.
    fn load(&mut self) -> Result<()> {
        if self.trigram == u32::MAX && self.oldid != -1 {
            // already done
            return Ok(());
        }
        let d = self.delta.rest();
        if d.len() < 3 {
            return Err(self.ix.corrupt("posting stream not terminated"));
        }
        let t: Trigram = (d[0] as u32) << 16 | (d[1] as u32) << 8 | d[2] as u32;
        self.delta.set_rest(&d[3..]);
        if t == INVALID_TRIGRAM {
            // consume the sentinel's zero delta, then stay at the end
            if self.delta.next().map_err(|e| self.ix.corrupt(e))? != 0 {
                return Err(self.ix.corrupt("posting sentinel not terminated"));
            }
            self.trigram = u32::MAX;
            self.oldid = 0; // marks "done" so load() becomes a no-op
            self.fileid = -1;
            return Ok(());
        }
        self.trigram = t;
        self.oldid = -1;
        self.fileid = -1;
        self.i = 0;
        self.exhausted = false;
        Ok(())
    }

    /// Advance to the next surviving, remapped file ID in the current
    /// list. Always consumes the list through its 0 terminator.
    fn next_id(&mut self) -> Result<bool> {
        if self.exhausted || self.trigram == u32::MAX {
            self.fileid = -1;
            return Ok(false);
        }
        loop {
            let delta = self.delta.next().map_err(|e| self.ix.corrupt(e))?;
            if delta == 0 {
                self.delta.clear_bits();
                self.exhausted = true;
                self.fileid = -1;
                return Ok(false);
            }
            self.oldid += delta as i64;
            while self.i < self.idmap.len() && (self.idmap[self.i].hi as i64) <= self.oldid {
                self.i += 1;
            }
            if self.i >= self.idmap.len() {
                continue; // shadowed; keep draining the list
            }
            let r = &self.idmap[self.i];
            if self.oldid < r.lo as i64 {
                continue;
            }
            self.fileid = r.new as i64 + self.oldid - r.lo as i64;
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::testutil::{build_index, tri};
    use crate::index::types::FileId;

    const MERGE_ROOTS_1: &[&str] = &["/a", "/b", "/c"];
    const MERGE_ROOTS_2: &[&str] = &["/b", "/cc"];

    const MERGE_FILES_1: &[(&str, &str)] = &[
        ("/a/x", "hello world"),
        ("/a/y", "goodbye world"),
        ("/b/xx", "now is the time"),
        ("/b/xy", "for all good men"),
        ("/c/ab", "give me all the potatoes"),
        ("/c/de", "or give me death now"),
    ];

    const MERGE_FILES_2: &[(&str, &str)] = &[
        ("/b/www", "world wide indeed"),
        ("/b/xx", "no, not now"),
        ("/b/yy", "first potatoes, now liberty?"),
        ("/cc", "come to the aid of his potatoes"),
    ];

    fn check_files(ix: &Index, want: &[&str]) {
        assert_eq!(ix.num_name(), want.len());
        for (i, name) in want.iter().enumerate() {
            assert_eq!(ix.name(i as FileId).unwrap().to_string(), *name);
        }
    }

    fn check_posting(ix: &Index, trig: &str, want: &[FileId]) {
        assert_eq!(
            ix.posting_list(tri(trig)).unwrap(),
            want,
            "posting_list({:?})",
            trig
        );
    }

    fn run_merge(v1: Version, v2: Version, out_version: Version) {
        let dir = tempfile::tempdir().unwrap();
        let out1 = dir.path().join("idx1");
        let out2 = dir.path().join("idx2");
        let out3 = dir.path().join("idx3");

        build_index(&out1, v1, MERGE_ROOTS_1, MERGE_FILES_1);
        build_index(&out2, v2, MERGE_ROOTS_2, MERGE_FILES_2);
        merge(&out3, &out1, &out2, out_version).unwrap();

        let ix1 = Index::open_with(&out1, true).unwrap();
        let ix2 = Index::open_with(&out2, true).unwrap();
        let ix3 = Index::open_with(&out3, true).unwrap();

        check_files(&ix1, &["/a/x", "/a/y", "/b/xx", "/b/xy", "/c/ab", "/c/de"]);
        check_files(&ix2, &["/b/www", "/b/xx", "/b/yy", "/cc"]);
        check_files(
            &ix3,
            &["/a/x", "/a/y", "/b/www", "/b/xx", "/b/yy", "/c/ab", "/c/de", "/cc"],
        );

        check_posting(&ix1, "wor", &[0, 1]);
        check_posting(&ix1, "now", &[2, 5]);
        check_posting(&ix1, "all", &[3, 4]);

        check_posting(&ix2, "now", &[1, 2]);

        check_posting(&ix3, "all", &[5]);
        check_posting(&ix3, "wor", &[0, 1, 2]);
        check_posting(&ix3, "now", &[3, 4, 6]);
        check_posting(&ix3, "pot", &[4, 5, 7]);

        ix3.check().unwrap();

        // merged root list: /b/xy and /c files survive under /a../c
        let roots: Vec<String> = ix3.roots().unwrap().map(|p| p.to_string()).collect();
        assert_eq!(roots, vec!["/a", "/b", "/c", "/cc"]);
    }

    #[test]
    fn merge_v2_sources() {
        run_merge(Version::V2, Version::V2, Version::V2);
    }

    #[test]
    fn merge_mixed_versions() {
        // readers must accept v1 inputs during merge
        run_merge(Version::V2, Version::V1, Version::V2);
        run_merge(Version::V1, Version::V2, Version::V2);
    }

    #[test]
    fn merge_to_v1_output() {
        run_merge(Version::V2, Version::V2, Version::V1);
    }

    #[test]
    fn merge_with_self_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let out1 = dir.path().join("idx1");
        let out3 = dir.path().join("idx3");
        build_index(&out1, Version::V2, MERGE_ROOTS_1, MERGE_FILES_1);
        merge(&out3, &out1, &out1, Version::V2).unwrap();

        let ix1 = Index::open_with(&out1, true).unwrap();
        let ix3 = Index::open_with(&out3, true).unwrap();
        assert_eq!(ix1.num_name(), ix3.num_name());
        for i in 0..ix1.num_name() {
            assert_eq!(
                ix1.name(i as FileId).unwrap().to_string(),
                ix3.name(i as FileId).unwrap().to_string()
            );
        }
        for trig in ["wor", "now", "all", "pot", "hel"] {
            assert_eq!(
                ix1.posting_list(tri(trig)).unwrap(),
                ix3.posting_list(tri(trig)).unwrap(),
                "trigram {:?}",
                trig
            );
        }
        ix3.check().unwrap();
    }

    #[test]
    fn shadow_respects_path_boundaries() {
        // root "/b" must not shadow the sibling file "/b.txt"
        let dir = tempfile::tempdir().unwrap();
        let out1 = dir.path().join("idx1");
        let out2 = dir.path().join("idx2");
        let out3 = dir.path().join("idx3");
        build_index(
            &out1,
            Version::V2,
            &["/"],
            &[("/b.txt", "sibling data"), ("/b/f", "old data")],
        );
        build_index(&out2, Version::V2, &["/b"], &[("/b/g", "new data")]);
        merge(&out3, &out1, &out2, Version::V2).unwrap();

        let ix3 = Index::open_with(&out3, true).unwrap();
        check_files(&ix3, &["/b/g", "/b.txt"]);
        // old data under /b is gone, the sibling survives
        assert_eq!(ix3.posting_list(tri("old")).unwrap(), Vec::<FileId>::new());
        assert_eq!(ix3.posting_list(tri("sib")).unwrap(), vec![1]);
        assert_eq!(ix3.posting_list(tri("new")).unwrap(), vec![0]);
    }
}
