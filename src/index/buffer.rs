//! Buffered output file with offset tracking.
//!
//! The writer and merger stage several streams (names, name index,
//! posting runs, posting index) in temporary files before splicing them
//! into the final index. `Buffer` wraps a file with a 256 KB write
//! buffer, tracks the logical write offset, and knows how to emit the
//! fixed-width big-endian offsets whose size depends on the format
//! version. Temporary buffers use unnamed temp files, so the OS
//! reclaims them on every exit path.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path as FsPath;

use crate::error::{Error, Result};
use crate::index::types::Trigram;
use crate::index::Version;
use crate::utils::encoding::write_uvarint;

const BUF_CAP: usize = 256 << 10;

pub(crate) struct Buffer {
    pub(crate) name: String,
    file: File,
    file_off: u64,
    buf: Vec<u8>,
    version: Version,
}

impl Buffer {
    /// Create (truncating) the named output file.
    pub(crate) fn create(path: &FsPath, version: Version) -> Result<Buffer> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Buffer {
            name: path.display().to_string(),
            file,
            file_off: 0,
            buf: Vec::with_capacity(BUF_CAP),
            version,
        })
    }

    /// Create a buffer over an unnamed temporary file.
    pub(crate) fn temp(version: Version) -> Result<Buffer> {
        Ok(Buffer {
            name: "<temp>".to_string(),
            file: tempfile::tempfile()?,
            file_off: 0,
            buf: Vec::with_capacity(BUF_CAP),
            version,
        })
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    /// Current logical write offset.
    pub(crate) fn offset(&self) -> u64 {
        self.file_off + self.buf.len() as u64
    }

    pub(crate) fn write(&mut self, x: &[u8]) -> Result<()> {
        if x.len() > BUF_CAP - self.buf.len() {
            self.flush()?;
            if x.len() >= BUF_CAP {
                self.file.write_all(x)?;
                self.file_off += x.len() as u64;
                return Ok(());
            }
        }
        self.buf.extend_from_slice(x);
        Ok(())
    }

    pub(crate) fn write_byte(&mut self, x: u8) -> Result<()> {
        if self.buf.len() >= BUF_CAP {
            self.flush()?;
        }
        self.buf.push(x);
        Ok(())
    }

    pub(crate) fn write_str(&mut self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    pub(crate) fn write_trigram(&mut self, t: Trigram) -> Result<()> {
        if BUF_CAP - self.buf.len() < 3 {
            self.flush()?;
        }
        self.buf
            .extend_from_slice(&[(t >> 16) as u8, (t >> 8) as u8, t as u8]);
        Ok(())
    }

    pub(crate) fn write_uvarint(&mut self, x: u64) -> Result<()> {
        if BUF_CAP - self.buf.len() < 10 {
            self.flush()?;
        }
        write_uvarint(&mut self.buf, x);
        Ok(())
    }

    /// Write a fixed-width big-endian offset: 4 bytes in v1, 8 in v2.
    pub(crate) fn write_uint(&mut self, x: u64) -> Result<()> {
        match self.version {
            Version::V1 => {
                if x > u32::MAX as u64 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{}: index is larger than 4GB, use v2", self.name),
                    )));
                }
                self.write(&(x as u32).to_be_bytes())
            }
            Version::V2 => self.write(&x.to_be_bytes()),
        }
    }

    /// Zero-pad to an n-byte boundary. Not required by the reader, but
    /// nice for debugging hex dumps. No-op in v1.
    pub(crate) fn align(&mut self, n: u64) -> Result<()> {
        if self.version == Version::V1 {
            return Ok(());
        }
        while self.offset() % n != 0 {
            self.write_byte(0)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buf)?;
        self.file_off += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush and rewind, returning the underlying file ready for reading.
    pub(crate) fn finish(&mut self) -> Result<&mut File> {
        self.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(&mut self.file)
    }

    /// Flush and expose the file without rewinding (for memory mapping).
    pub(crate) fn file(&mut self) -> Result<&File> {
        self.flush()?;
        Ok(&self.file)
    }
}

/// Append the entire contents of `src` to `dst`.
pub(crate) fn copy_file(dst: &mut Buffer, src: &mut Buffer) -> Result<()> {
    dst.flush()?;
    let src_file = src.finish()?;
    let mut chunk = [0u8; 64 << 10];
    loop {
        let n = src_file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        dst.write(&chunk[..n])?;
    }
    dst.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_and_alignment() {
        let mut b = Buffer::temp(Version::V2).unwrap();
        b.write_str("csearch index 2\n").unwrap();
        assert_eq!(b.offset(), 16);
        b.write_byte(7).unwrap();
        b.align(16).unwrap();
        assert_eq!(b.offset(), 32);
        b.write_uint(0x1122334455).unwrap();
        assert_eq!(b.offset(), 40);
    }

    #[test]
    fn v1_uint_is_four_bytes() {
        let mut b = Buffer::temp(Version::V1).unwrap();
        b.write_uint(0x01020304).unwrap();
        assert_eq!(b.offset(), 4);
        // v1 align is a no-op
        b.align(16).unwrap();
        assert_eq!(b.offset(), 4);
    }

    #[test]
    fn copy_between_buffers() {
        let mut a = Buffer::temp(Version::V2).unwrap();
        a.write_str("hello world").unwrap();
        let mut b = Buffer::temp(Version::V2).unwrap();
        b.write_str("x").unwrap();
        copy_file(&mut b, &mut a).unwrap();
        assert_eq!(b.offset(), 12);
    }
}
