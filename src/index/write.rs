//! Index writing. See [`read`](crate::index::read) for the on-disk format.
//!
//! It would suffice to accumulate one large list of (trigram, file id)
//! pairs, sort it by trigram, and cut the posting lists from
//! subsequences of the sorted list. We do not assume the whole index
//! fits in memory, though: each time the in-memory list reaches its
//! cap, it is sorted and flushed as a run to a temporary spill file,
//! and the final posting lists are produced by merging the runs back
//! through a heap while streaming the result into the output file.

use std::fs::File;
use std::io::Read;
use std::path::Path as FsPath;

use log::{debug, info};
use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::index::buffer::{copy_file, Buffer};
use crate::index::delta::DeltaWriter;
use crate::index::path::{Path, PathWriter};
use crate::index::read::AllPostReader;
use crate::index::types::{
    make_post_entry, post_fileid, post_trigram, PostEntry, Trigram, INVALID_TRIGRAM,
};
use crate::index::{
    Version, MAGIC_V1, MAGIC_V2, NAME_GROUP_SIZE, POST_BLOCK_SIZE, TRAILER_MAGIC_V1,
    TRAILER_MAGIC_V2,
};
use crate::utils::sparse::SparseSet;

/// 64 MB worth of 8-byte post entries.
const NPOST: usize = (64 << 20) / 8;

/// Tuning constants for detecting text files. A file is not indexed if
/// it contains a NUL byte or an invalid UTF-8 sequence, if it is longer
/// than `MAX_FILE_LEN` bytes, if it contains a line longer than
/// `MAX_LINE_LEN` bytes, or if it contains more than
/// `MAX_TEXT_TRIGRAMS` distinct trigrams.
pub const MAX_FILE_LEN: u64 = 1 << 30;
pub const MAX_LINE_LEN: usize = 2000;
pub const MAX_TEXT_TRIGRAMS: usize = 20000;

/// Streams a set of files into an on-disk index.
pub struct IndexWriter {
    version: Version,

    trigram: SparseSet, // trigrams of the current file

    roots: Vec<Path>,

    names: PathWriter,
    name_data: Buffer,  // temp file holding the name list
    name_index: Buffer, // temp file holding the name group index
    num_name: usize,
    name_last: Path,
    total_bytes: u64,

    post: Vec<PostEntry>,
    post_file: Buffer, // flushed post runs
    post_ends: Vec<u64>,
    sort_tmp: Vec<PostEntry>,

    inbuf: Vec<u8>,
    main: Buffer,
}

impl IndexWriter {
    /// Create an index writer targeting `file`.
    pub fn create(file: impl AsRef<FsPath>, version: Version) -> Result<IndexWriter> {
        Ok(IndexWriter {
            version,
            trigram: SparseSet::new(1 << 24),
            roots: Vec::new(),
            names: PathWriter::new(version, NAME_GROUP_SIZE, 0),
            name_data: Buffer::temp(version)?,
            name_index: Buffer::temp(version)?,
            num_name: 0,
            name_last: Path::default(),
            total_bytes: 0,
            post: Vec::with_capacity(NPOST),
            post_file: Buffer::temp(version)?,
            post_ends: Vec::new(),
            sort_tmp: Vec::new(),
            inbuf: vec![0; 1 << 20],
            main: Buffer::create(file.as_ref(), version)?,
        })
    }

    /// Record the given roots in the index's root list. Roots must be
    /// supplied in ascending [`Path::compare`] order.
    pub fn add_roots<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Path>,
    {
        self.roots.extend(roots);
    }

    /// Open and index the file at `name`.
    pub fn add_file(&mut self, name: &str) -> Result<()> {
        let f = File::open(name)?;
        self.add(name, f)
    }

    /// Index the contents of `f` under the given name.
    ///
    /// Returns `Err` for malformed or out-of-order names and for output
    /// I/O failures. Content that fails the text heuristics is skipped
    /// with a `debug!` log and `Ok(())`, so one binary file does not
    /// abort a build.
    pub fn add<R: Read>(&mut self, name: &str, mut f: R) -> Result<()> {
        if !is_valid_name(name) {
            return Err(Error::MalformedName(name.to_string()));
        }

        self.trigram.reset();
        let mut tv: u32 = 0;
        let mut n: u64 = 0;
        let mut linelen: usize = 0;
        loop {
            let rn = f.read(&mut self.inbuf)?;
            if rn == 0 {
                break;
            }
            for i in 0..rn {
                let c = self.inbuf[i];
                tv = ((tv << 8) & 0x00ff_ffff) | c as u32;
                n += 1;
                if n >= 3 {
                    self.trigram.add(tv);
                }
                if c == 0 {
                    debug!("{}: contains NUL, ignoring", name);
                    return Ok(());
                }
                if !valid_utf8((tv >> 8) & 0xff, tv & 0xff) {
                    debug!("{}: invalid UTF-8, ignoring", name);
                    return Ok(());
                }
                if n > MAX_FILE_LEN {
                    debug!("{}: too long, ignoring", name);
                    return Ok(());
                }
                linelen += 1;
                if linelen > MAX_LINE_LEN {
                    debug!("{}: very long lines, ignoring", name);
                    return Ok(());
                }
                if c == b'\n' {
                    linelen = 0;
                }
            }
        }
        if self.trigram.len() > MAX_TEXT_TRIGRAMS {
            debug!("{}: too many trigrams, probably not text, ignoring", name);
            return Ok(());
        }
        self.total_bytes += n;

        debug!("{} {} {}", n, self.trigram.len(), name);

        let fileid = self.add_name(&Path::from(name))?;
        for i in 0..self.trigram.len() {
            if self.post.len() >= NPOST {
                self.flush_post()?;
            }
            let t = self.trigram.dense()[i];
            self.post.push(make_post_entry(t, fileid as u64));
        }
        Ok(())
    }

    /// Append the name, returning the assigned file ID.
    fn add_name(&mut self, name: &Path) -> Result<usize> {
        if self.version == Version::V2 {
            if name.is_empty() {
                return Err(Error::MalformedName(String::new()));
            }
            if name.compare(&self.name_last) != std::cmp::Ordering::Greater {
                return Err(Error::NamesOutOfOrder {
                    name: name.to_string(),
                    last: self.name_last.to_string(),
                });
            }
        }
        let id = self.num_name;
        self.num_name += 1;
        self.names
            .write(&mut self.name_data, Some(&mut self.name_index), name)?;
        self.name_last = name.clone();
        Ok(id)
    }

    /// Sort the in-memory post entries and append them to the spill
    /// file as one run.
    pub(crate) fn flush_post(&mut self) -> Result<()> {
        debug!("flush {} entries to spill", self.post.len());
        sort_post(&mut self.post, &mut self.sort_tmp);

        let mut w = PostDataWriter::new(self.post_file.offset(), self.version, false)?;
        let mut trigram = INVALID_TRIGRAM;
        for &p in &self.post {
            let t = post_trigram(p);
            if t != trigram {
                if trigram != INVALID_TRIGRAM {
                    w.end_trigram(&mut self.post_file)?;
                }
                w.trigram(&self.post_file, t);
                trigram = t;
            }
            w.fileid(&mut self.post_file, post_fileid(p))?;
        }
        if trigram != INVALID_TRIGRAM {
            w.end_trigram(&mut self.post_file)?;
        }
        self.post.clear();
        self.post_ends.push(self.post_file.offset());
        Ok(())
    }

    /// Merge the spills and residue into final posting lists and seal
    /// the index with its trailer.
    pub fn flush(mut self) -> Result<()> {
        if self.version == Version::V1 {
            // v1 terminates the name list with an empty entry
            self.names
                .write(&mut self.name_data, Some(&mut self.name_index), &Path::default())?;
        }
        sort_post(&mut self.post, &mut self.sort_tmp);

        let IndexWriter {
            version,
            roots,
            mut name_data,
            mut name_index,
            num_name,
            post,
            mut post_file,
            post_ends,
            total_bytes,
            mut main,
            ..
        } = self;

        let mut off = [0u64; 8];
        main.write_str(match version {
            Version::V1 => MAGIC_V1,
            Version::V2 => MAGIC_V2,
        })?;

        // Root list.
        off[0] = main.offset();
        let mut root_writer = PathWriter::new(version, 0, main.offset());
        for r in &roots {
            root_writer.write(&mut main, None, r)?;
        }
        if version == Version::V1 {
            root_writer.write(&mut main, None, &Path::default())?;
        }
        off[1] = roots.len() as u64;
        main.align(16)?;

        // Name list.
        off[2] = main.offset();
        copy_file(&mut main, &mut name_data)?;
        off[3] = num_name as u64;
        main.align(16)?;

        // Posting lists.
        off[4] = main.offset();
        let mut w = PostDataWriter::new(main.offset(), version, true)?;
        {
            let spill_map;
            let mut heap = PostHeap::new();
            if let Some(&last_end) = post_ends.last() {
                info!("merge {} MB in memory + {} MB on disk", (post.len() * 8) >> 20, last_end >> 20);
                spill_map = Some(unsafe { Mmap::map(post_file.file()?)? });
                let data = spill_map.as_deref().unwrap();
                let mut start = 0usize;
                for &end in &post_ends {
                    heap.add_file(AllPostReader::new(version, &data[start..end as usize]))?;
                    start = end as usize;
                }
            }
            heap.add_mem(&post)?;

            let mut e = heap.next()?;
            loop {
                let t = post_trigram(e);
                w.trigram(&main, t);
                while post_trigram(e) == t && t != INVALID_TRIGRAM {
                    w.fileid(&mut main, post_fileid(e))?;
                    e = heap.next()?;
                }
                w.end_trigram(&mut main)?;
                if t == INVALID_TRIGRAM {
                    break;
                }
            }
            w.finish(&mut main)?;
        }
        off[5] = w.num_trigram() as u64;
        main.align(16)?;

        // Name index.
        off[6] = main.offset();
        copy_file(&mut main, &mut name_index)?;
        main.align(16)?;

        // Posting index.
        off[7] = main.offset();
        let mut post_index = w.into_index().expect("posting index buffer");
        copy_file(&mut main, &mut post_index)?;

        match version {
            Version::V1 => {
                main.write_uint(off[0])?;
                main.write_uint(off[2])?;
                main.write_uint(off[4])?;
                main.write_uint(off[6])?;
                main.write_uint(off[7])?;
                main.write_str(TRAILER_MAGIC_V1)?;
            }
            Version::V2 => {
                for &v in &off {
                    main.write_uint(v)?;
                }
                main.write_str(TRAILER_MAGIC_V2)?;
            }
        }
        main.flush()?;

        info!("{} data bytes, {} index bytes", total_bytes, main.offset());
        Ok(())
    }
}

/// A name may use `\x01` only to separate an archive path from an
/// entry path; every component must be non-empty and free of control
/// bytes, which the name format uses for framing.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('\u{1}')
            .all(|part| !part.is_empty() && part.bytes().all(|c| c >= 0x20))
}

/// Report whether the byte pair can appear in a valid sequence of
/// UTF-8-encoded code points.
fn valid_utf8(c1: u32, c2: u32) -> bool {
    if c1 < 0x80 {
        // 1-byte, must be followed by 1-byte or first of multi-byte
        c2 < 0x80 || (0xc0..0xf8).contains(&c2)
    } else if c1 < 0xc0 {
        // continuation byte, can be followed by nearly anything
        c2 < 0xf8
    } else if c1 < 0xf8 {
        // first of multi-byte, must be followed by continuation byte
        (0x80..0xc0).contains(&c2)
    } else {
        false
    }
}

/// Sort the post entry list. The list is already ordered on the low
/// 40-bit file-id field by construction, so two rounds of 12-bit radix
/// sort on the trigram complete the order.
pub(crate) fn sort_post(post: &mut [PostEntry], tmp: &mut Vec<PostEntry>) {
    const K: u32 = 12;
    const MASK: u64 = (1 << K) - 1;
    if tmp.len() < post.len() {
        tmp.resize(post.len(), 0);
    }
    let tmp = &mut tmp[..post.len()];

    let mut counts = vec![0usize; 1 << K];
    for &p in post.iter() {
        counts[((p >> 40) & MASK) as usize] += 1;
    }
    let mut tot = 0;
    for c in counts.iter_mut() {
        let n = *c;
        *c = tot;
        tot += n;
    }
    for &p in post.iter() {
        let r = ((p >> 40) & MASK) as usize;
        tmp[counts[r]] = p;
        counts[r] += 1;
    }

    counts.iter_mut().for_each(|c| *c = 0);
    for &p in tmp.iter() {
        counts[((p >> (40 + K)) & MASK) as usize] += 1;
    }
    tot = 0;
    for c in counts.iter_mut() {
        let n = *c;
        *c = tot;
        tot += n;
    }
    for &p in tmp.iter() {
        let r = ((p >> (40 + K)) & MASK) as usize;
        post[counts[r]] = p;
        counts[r] += 1;
    }
}

/// Writes a stream of posting lists, and optionally the matching
/// posting index: block-packed varint entries in v2, fixed 11-byte
/// entries in v1.
pub(crate) struct PostDataWriter {
    version: Version,
    base: u64,
    offset: u64,
    count: usize,
    last: i64,
    t: Trigram,
    num_trigram: usize,
    delta: DeltaWriter,
    index: Option<IndexStream>,
}

struct IndexStream {
    buf: Buffer,
    block_len: usize,
    block_prev: u64, // previous entry's list offset within this block
}

impl PostDataWriter {
    pub(crate) fn new(base: u64, version: Version, with_index: bool) -> Result<PostDataWriter> {
        let index = if with_index {
            Some(IndexStream {
                buf: Buffer::temp(version)?,
                block_len: 0,
                block_prev: 0,
            })
        } else {
            None
        };
        Ok(PostDataWriter {
            version,
            base,
            offset: 0,
            count: 0,
            last: -1,
            t: 0,
            num_trigram: 0,
            delta: DeltaWriter::new(),
            index,
        })
    }

    pub(crate) fn trigram(&mut self, out: &Buffer, t: Trigram) {
        self.offset = out.offset();
        self.count = 0;
        self.t = t;
        self.last = -1;
    }

    pub(crate) fn fileid(&mut self, out: &mut Buffer, id: u64) -> Result<()> {
        if self.count == 0 {
            out.write_trigram(self.t)?;
        }
        self.delta.write(out, (id as i64 - self.last) as u64)?;
        self.last = id as i64;
        self.count += 1;
        Ok(())
    }

    pub(crate) fn end_trigram(&mut self, out: &mut Buffer) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.delta.write(out, 0)?;
        self.delta.flush(out)?;
        self.num_trigram += 1;
        self.write_index_entry(self.t, self.count)?;
        Ok(())
    }

    /// Write the terminating sentinel list (trigram 0xFFFFFF, one zero
    /// delta) and pad the index stream to a block multiple.
    pub(crate) fn finish(&mut self, out: &mut Buffer) -> Result<()> {
        let offset = out.offset();
        out.write_trigram(INVALID_TRIGRAM)?;
        self.delta.write(out, 0)?;
        self.delta.flush(out)?;
        self.offset = offset;
        self.num_trigram += 1;
        self.write_index_entry(INVALID_TRIGRAM, 0)?;
        if let Some(ix) = &mut self.index {
            if self.version == Version::V2 {
                while ix.block_len % POST_BLOCK_SIZE != 0 {
                    ix.buf.write_byte(0)?;
                    ix.block_len += 1;
                }
            }
        }
        Ok(())
    }

    fn write_index_entry(&mut self, t: Trigram, count: usize) -> Result<()> {
        let rel = self.offset - self.base;
        let Some(ix) = &mut self.index else {
            return Ok(());
        };
        match self.version {
            Version::V1 => {
                ix.buf.write_trigram(t)?;
                ix.buf.write_uint(count as u64)?;
                ix.buf.write_uint(rel)?;
            }
            Version::V2 => {
                use crate::utils::encoding::uvarint_len;
                let used = ix.block_len % POST_BLOCK_SIZE;
                let mut delta = rel - ix.block_prev;
                let len = 3 + uvarint_len(count as u64) + uvarint_len(delta);
                if used + len > POST_BLOCK_SIZE {
                    // pad to the next block boundary; offsets restart at 0
                    for _ in used..POST_BLOCK_SIZE {
                        ix.buf.write_byte(0)?;
                        ix.block_len += 1;
                    }
                    ix.block_prev = 0;
                    delta = rel;
                }
                ix.buf.write_trigram(t)?;
                ix.buf.write_uvarint(count as u64)?;
                ix.buf.write_uvarint(delta)?;
                ix.block_len += 3 + uvarint_len(count as u64) + uvarint_len(delta);
                ix.block_prev = rel;
            }
        }
        Ok(())
    }

    pub(crate) fn num_trigram(&self) -> usize {
        self.num_trigram
    }

    pub(crate) fn into_index(self) -> Option<Buffer> {
        self.index.map(|ix| ix.buf)
    }
}

/// Sources feeding the posting merge: sorted spill runs on disk and
/// the sorted in-memory residue.
enum ChunkSrc<'a> {
    Mem(&'a [PostEntry]),
    File(AllPostReader<'a>),
}

impl ChunkSrc<'_> {
    fn next(&mut self) -> Result<Option<PostEntry>> {
        match self {
            ChunkSrc::Mem(x) => match x.split_first() {
                Some((&e, rest)) => {
                    *x = rest;
                    Ok(Some(e))
                }
                None => Ok(None),
            },
            ChunkSrc::File(r) => r.next(),
        }
    }
}

struct PostChunk<'a> {
    e: PostEntry,
    src: ChunkSrc<'a>,
}

/// Min-heap of post chunks, keyed by the packed entry value.
pub(crate) struct PostHeap<'a> {
    ch: Vec<PostChunk<'a>>,
}

impl<'a> PostHeap<'a> {
    pub(crate) fn new() -> PostHeap<'a> {
        PostHeap { ch: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.ch.len()
    }

    fn add_file(&mut self, r: AllPostReader<'a>) -> Result<()> {
        self.add(ChunkSrc::File(r))
    }

    pub(crate) fn add_mem(&mut self, x: &'a [PostEntry]) -> Result<()> {
        self.add(ChunkSrc::Mem(x))
    }

    fn add(&mut self, mut src: ChunkSrc<'a>) -> Result<()> {
        if let Some(e) = src.next()? {
            self.push(PostChunk { e, src });
        }
        Ok(())
    }

    /// Pop the smallest entry; once drained, returns the sentinel
    /// entry (INVALID_TRIGRAM, 0) forever.
    pub(crate) fn next(&mut self) -> Result<PostEntry> {
        if self.ch.is_empty() {
            return Ok(make_post_entry(INVALID_TRIGRAM, 0));
        }
        let e = self.ch[0].e;
        match self.ch[0].src.next()? {
            Some(e1) => {
                self.ch[0].e = e1;
                self.sift_down(0);
            }
            None => {
                let n = self.ch.len() - 1;
                self.ch.swap(0, n);
                self.ch.truncate(n);
                if n > 1 {
                    self.sift_down(0);
                }
            }
        }
        Ok(e)
    }

    fn push(&mut self, ch: PostChunk<'a>) {
        let n = self.ch.len();
        self.ch.push(ch);
        if self.ch.len() >= 2 {
            self.sift_up(n);
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let ch = &mut self.ch;
        loop {
            let j1 = 2 * i + 1;
            if j1 >= ch.len() {
                break;
            }
            let mut j = j1;
            let j2 = j1 + 1;
            if j2 < ch.len() && ch[j1].e >= ch[j2].e {
                j = j2;
            }
            if ch[i].e < ch[j].e {
                break;
            }
            ch.swap(i, j);
            i = j;
        }
    }

    fn sift_up(&mut self, mut j: usize) {
        let ch = &mut self.ch;
        loop {
            if j == 0 {
                break;
            }
            let i = (j - 1) / 2;
            if ch[i].e < ch[j].e {
                break;
            }
            ch.swap(i, j);
            j = i;
        }
    }
}
