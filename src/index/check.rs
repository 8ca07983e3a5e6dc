//! Structural validation of an index file.

use crate::error::Result;
use crate::index::delta::DeltaReader;
use crate::index::path::Path;
use crate::index::read::Index;
use crate::index::{Version, POST_BLOCK_SIZE};
use crate::utils::encoding::read_uvarint;

impl Index {
    /// Walk the entire file, validating the invariants the reader
    /// depends on: the name list decodes to `num_name` strictly
    /// ascending names, every posting index entry points at a list
    /// with the same leading trigram, and every list carries exactly
    /// its counted number of nonzero deltas before the 0 terminator.
    ///
    /// Corruption is reported per the index's panic-on-corrupt mode.
    pub fn check(&self) -> Result<()> {
        if self.version == Version::V1 {
            return Ok(());
        }

        // Names: count and order.
        let mut names = self.names_at(0, self.num_name)?;
        let mut last: Option<Path> = None;
        let mut n = 0usize;
        while names.valid() {
            let p = names.path();
            if let Some(prev) = &last {
                if prev.compare(&p) != std::cmp::Ordering::Less {
                    return Err(self.corrupt("name list out of order"));
                }
            }
            last = Some(p);
            n += 1;
            names.next();
        }
        if n != self.num_name {
            return Err(self.corrupt("name list count mismatch"));
        }

        // Posting index blocks and the lists they point at.
        let mut pblocks = self.slice(self.post_index, (self.num_post_block * POST_BLOCK_SIZE) as i64)?;
        let pdata = self.slice(self.post_data, (self.name_index - self.post_data) as i64)?;
        while !pblocks.is_empty() {
            let mut b = &pblocks[..POST_BLOCK_SIZE];
            pblocks = &pblocks[POST_BLOCK_SIZE..];
            let mut offset = 0usize;
            while b.len() > 3 && (b[0] != 0 || b[1] != 0 || b[2] != 0) {
                let t = &b[..3];
                let Some((count, l1)) = read_uvarint(&b[3..]) else {
                    return Err(self.corrupt("posting index entry malformed"));
                };
                let Some((o, l2)) = read_uvarint(&b[3 + l1..]) else {
                    return Err(self.corrupt("posting index entry malformed"));
                };
                offset += o as usize;
                b = &b[3 + l1 + l2..];

                if offset + 3 > pdata.len() || &pdata[offset..offset + 3] != t {
                    return Err(self.corrupt("posting index entry points at wrong list"));
                }
                let mut dr = DeltaReader::new(self.version, &pdata[offset + 3..]);
                for _ in 0..count {
                    let d = dr.next().map_err(|e| self.corrupt(e))?;
                    if d == 0 {
                        return Err(self.corrupt("posting list shorter than its count"));
                    }
                }
                if dr.next().map_err(|e| self.corrupt(e))? != 0 {
                    return Err(self.corrupt("posting list not terminated"));
                }
            }
        }
        Ok(())
    }
}
