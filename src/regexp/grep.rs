//! Line-oriented scanning of a byte stream.
//!
//! The grep engine reads a file in 1 MB chunks and drives the DFA
//! matcher across them. Each chunk scan stops short of the trailing
//! line fragment (plus the post-context lines a match near the end
//! would need), and the held-back suffix slides to the front of the
//! buffer before the next read, so matches and their context never
//! straddle a refill. Line numbers are counted lazily, only when the
//! caller asks for them.

use std::fs::File;
use std::io::Read;

use log::warn;

use crate::error::Result;
use crate::regexp::matcher::Matcher;

const CHUNK: usize = 1 << 20;

/// One matched line, with optional surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepMatch {
    pub name: String,
    /// 1-based; only meaningful when the grep was configured with
    /// `need_lineno`.
    pub lineno: u64,
    /// The matched line, without its trailing newline.
    pub line: Vec<u8>,
    pub before: Vec<Vec<u8>>,
    pub after: Vec<Vec<u8>>,
}

/// Streams readers through a matcher, emitting match records.
pub struct Grep {
    /// Count line numbers for the emitted records.
    pub need_lineno: bool,
    /// Stop after this many matches in total; 0 means no limit.
    pub limit: usize,
    pub pre_context: usize,
    pub post_context: usize,

    /// Whether any match has been found so far.
    pub matched: bool,
    /// Total matches emitted.
    pub matches: usize,
    /// Whether a scan stopped early because of `limit`.
    pub limited: bool,

    buf: Vec<u8>,
    chunk: usize,
}

impl Default for Grep {
    fn default() -> Grep {
        Grep::new()
    }
}

impl Grep {
    pub fn new() -> Grep {
        Grep {
            need_lineno: false,
            limit: 0,
            pre_context: 0,
            post_context: 0,
            matched: false,
            matches: 0,
            limited: false,
            buf: Vec::new(),
            chunk: CHUNK,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_chunk_size(mut self, n: usize) -> Grep {
        self.chunk = n;
        self
    }

    /// Scan the file at `path`. A file that cannot be opened is logged
    /// and skipped; the overall search continues.
    pub fn file(
        &mut self,
        m: &mut Matcher,
        path: &str,
        emit: &mut dyn FnMut(GrepMatch),
    ) -> Result<()> {
        match File::open(path) {
            Ok(f) => self.reader(m, f, path, emit),
            Err(err) => {
                warn!("{}: {}", path, err);
                Ok(())
            }
        }
    }

    /// Scan one reader, emitting a record per matched line.
    pub fn reader<R: Read>(
        &mut self,
        m: &mut Matcher,
        mut r: R,
        name: &str,
        emit: &mut dyn FnMut(GrepMatch),
    ) -> Result<()> {
        self.buf.clear();
        let mut lineno: u64 = 1;
        let mut begin_text = true;
        let mut end_text = false;
        let mut chunk_start = 0usize;

        loop {
            let (eof, read_err) = fill(&mut r, &mut self.buf, self.chunk);
            let mut end = self.buf.len();
            if !eof {
                // Stop the scan before the trailing fragment of a
                // line, and before post_context whole lines, so the
                // context to print is always in the buffer.
                let d = line_suffix_len(&self.buf, self.post_context + 1);
                if d < self.buf.len() {
                    end = self.buf.len() - d;
                }
            } else {
                end_text = true;
            }

            while chunk_start < end {
                let found = m.matches(&self.buf[chunk_start..end], begin_text, end_text);
                begin_text = false;
                let Some(m1) = found.map(|e| e + chunk_start) else {
                    break;
                };
                self.matched = true;
                if self.limit > 0 && self.matches >= self.limit {
                    self.limited = true;
                    return Ok(());
                }
                self.matches += 1;

                let line_start = rfind_nl(&self.buf[chunk_start..m1])
                    .map(|j| chunk_start + j + 1)
                    .unwrap_or(chunk_start);
                let line_end = (m1 + 1).min(end);
                if self.need_lineno {
                    lineno += count_nl(&self.buf[chunk_start..line_start]);
                }
                let (before, after) = if self.pre_context + self.post_context > 0 {
                    line_context(
                        self.pre_context,
                        self.post_context,
                        &self.buf,
                        line_start,
                        line_end,
                    )
                } else {
                    (Vec::new(), Vec::new())
                };
                emit(GrepMatch {
                    name: name.to_string(),
                    lineno,
                    line: chomp_nl(&self.buf[line_start..line_end]),
                    before,
                    after,
                });
                if self.need_lineno {
                    lineno += 1;
                }
                chunk_start = line_end;
            }
            if self.need_lineno && !eof {
                lineno += count_nl(&self.buf[chunk_start..end]);
            }

            // Slide pre-context and unscanned bytes to the front.
            let mut d = line_suffix_len(&self.buf[..end], self.pre_context);
            if d == end {
                // not enough room; give up on context for this border
                d = 0;
            }
            self.buf.drain(..end - d);
            chunk_start = d;

            if end_text {
                if let Some(err) = read_err {
                    warn!("{}: {}", name, err);
                }
                break;
            }
        }
        Ok(())
    }
}

/// Fill `buf` up to `cap` bytes. Returns `(eof, read_error)`; a read
/// error ends the stream like EOF after the buffered bytes are
/// scanned.
fn fill<R: Read>(r: &mut R, buf: &mut Vec<u8>, cap: usize) -> (bool, Option<std::io::Error>) {
    let mut len = buf.len();
    buf.resize(cap, 0);
    let mut eof = false;
    let mut read_err = None;
    while len < cap {
        match r.read(&mut buf[len..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => len += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                read_err = Some(e);
                eof = true;
                break;
            }
        }
    }
    buf.truncate(len);
    (eof, read_err)
}

fn rfind_nl(buf: &[u8]) -> Option<usize> {
    buf.iter().rposition(|&b| b == b'\n')
}

fn count_nl(buf: &[u8]) -> u64 {
    buf.iter().filter(|&&b| b == b'\n').count() as u64
}

fn chomp_nl(line: &[u8]) -> Vec<u8> {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    line[..end].to_vec()
}

/// Length of the suffix of `buf` holding the last `n` complete lines
/// plus any trailing fragment.
fn line_suffix_len(buf: &[u8], n: usize) -> usize {
    let mut end = buf.len();
    for _ in 0..n {
        match rfind_nl(&buf[..end]) {
            Some(j) => end = j,
            None => break,
        }
    }
    match rfind_nl(&buf[..end]) {
        Some(j) => buf.len() - (j + 1),
        None => buf.len(),
    }
}

/// Length of the prefix of `buf` holding the first `lines` lines.
fn line_prefix_len(buf: &[u8], lines: usize) -> usize {
    let mut start = 0;
    for _ in 0..lines {
        match buf[start..].iter().position(|&b| b == b'\n') {
            Some(j) => start += j + 1,
            None => return buf.len(),
        }
    }
    start
}

fn line_context(
    num_before: usize,
    num_after: usize,
    buf: &[u8],
    line_start: usize,
    line_end: usize,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let before_chunk = &buf[line_start - line_suffix_len(&buf[..line_start], num_before)..line_start];
    let after_chunk = &buf[line_end..line_end + line_prefix_len(&buf[line_end..], num_after)];
    (split_lines(before_chunk), split_lines(after_chunk))
}

fn split_lines(chunk: &[u8]) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = chunk.split(|&b| b == b'\n').map(chomp_cr).collect();
    if out.last().is_some_and(|l| l.is_empty()) && chunk.last() == Some(&b'\n') {
        out.pop();
    }
    out
}

fn chomp_cr(line: &[u8]) -> Vec<u8> {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    line[..end].to_vec()
}
