//! Lazy-DFA matching over the byte NFA program.
//!
//! DFA states are materialized on demand by subset construction. Each
//! state is keyed by an encoding of its NFA state set and cached in a
//! map, so a given set is built once per matcher. States live in an
//! arena addressed by `u32` handles - transition tables store handles,
//! never references, which keeps the mutually-referencing state graph
//! free of lifetime knots. Handle 0 is reserved for the terminal
//! "seen a match, waiting for end of line" state.
//!
//! The cache grows without bound for the lifetime of the matcher; a
//! matcher is owned by one scan at a time and is not thread-safe.

use ahash::AHashMap;

use crate::error::Result;
use crate::regexp::prog::{
    Inst, Prog, EMPTY_BEGIN_LINE, EMPTY_BEGIN_TEXT, EMPTY_END_LINE, EMPTY_END_TEXT,
    EMPTY_NO_WORD_BOUNDARY, EMPTY_WORD_BOUNDARY,
};
use crate::utils::encoding::write_uvarint;
use crate::utils::sparse::SparseSet;

/// Position context carried between bytes.
const FLAG_BOL: u32 = 1 << 0; // beginning of line
const FLAG_BOT: u32 = 1 << 2; // beginning of text
const FLAG_WORD: u32 = 1 << 4; // last byte was a word byte

/// Pseudo-byte marking the end of the input.
const END_TEXT: i32 = -1;

/// Handle of the terminal match state.
const DMATCH: u32 = 0;

/// "Transition not computed yet."
const NO_STATE: u32 = u32::MAX;

/// An NFA state: the set of live program instructions plus position
/// flags. `partial` is reserved for a partially-decoded rune and is
/// always 0 in the byte programs we compile.
struct NState {
    q: SparseSet,
    partial: u32,
    flag: u32,
}

impl NState {
    fn new(n: usize) -> NState {
        NState {
            q: SparseSet::new(n.max(1)),
            partial: 0,
            flag: 0,
        }
    }

    /// Encode as the canonical cache key: varint partial, varint
    /// flags, then the sorted instruction IDs as varint deltas from
    /// u32::MAX (wrapping), which makes small first IDs cheap.
    fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.q.len());
        write_uvarint(&mut buf, self.partial as u64);
        write_uvarint(&mut buf, self.flag as u64);
        let mut ids: Vec<u32> = self.q.dense().to_vec();
        ids.sort_unstable();
        let mut last = u32::MAX;
        for id in ids {
            write_uvarint(&mut buf, id.wrapping_sub(last) as u64);
            last = id;
        }
        buf
    }

    /// Decode an encoding produced by `enc`.
    fn dec(&mut self, mut s: &[u8]) {
        let (partial, n) = read_uvarint_or_bug(s);
        s = &s[n..];
        self.partial = partial as u32;
        let (flag, n) = read_uvarint_or_bug(s);
        s = &s[n..];
        self.flag = flag as u32;
        self.q.reset();
        let mut last = u32::MAX;
        while !s.is_empty() {
            let (delta, n) = read_uvarint_or_bug(s);
            s = &s[n..];
            last = last.wrapping_add(delta as u32);
            self.q.add(last);
        }
    }
}

fn read_uvarint_or_bug(s: &[u8]) -> (u64, usize) {
    crate::utils::encoding::read_uvarint(s).expect("corrupt dfa state encoding")
}

/// A DFA state: its defining encoding, the lazily-filled transition
/// table, and whether a match completes on `\n` or at end of text.
struct DState {
    enc: Vec<u8>,
    next: [u32; 256],
    match_nl: bool,
    match_eot: bool,
}

impl DState {
    fn new(enc: Vec<u8>) -> DState {
        DState {
            enc,
            next: [NO_STATE; 256],
            match_nl: false,
            match_eot: false,
        }
    }
}

/// Holds the state for running a regular expression scan.
pub struct Matcher {
    prog: Prog,
    states: Vec<DState>,
    cache: AHashMap<Vec<u8>, u32>,
    start: u32,
    start_line: u32,
    z1: NState,
    z2: NState,
}

impl Matcher {
    /// Build a matcher for a parsed regular expression.
    pub fn new(hir: &regex_syntax::hir::Hir) -> Result<Matcher> {
        Matcher::from_prog(Prog::compile(hir)?)
    }

    /// Parse `pattern` and build a matcher for it.
    pub fn from_pattern(pattern: &str) -> Result<Matcher> {
        let hir = regex_syntax::parse(pattern)
            .map_err(|e| crate::error::Error::Regex(e.to_string()))?;
        Matcher::new(&hir)
    }

    fn from_prog(prog: Prog) -> Result<Matcher> {
        let n = prog.len();
        let mut m = Matcher {
            prog,
            states: Vec::new(),
            cache: AHashMap::new(),
            start: 0,
            start_line: 0,
            z1: NState::new(n),
            z2: NState::new(n),
        };

        // handle 0: the terminal match state, looping on every byte
        // except newline
        let mut dmatch = DState::new(NState::new(n).enc());
        for c in 0..256 {
            if c != b'\n' as usize {
                dmatch.next[c] = DMATCH;
            }
        }
        dmatch.match_nl = true;
        dmatch.match_eot = true;
        m.states.push(dmatch);

        let start_inst = m.prog.start;
        m.z1.q.reset();
        add_queue(
            &m.prog,
            &mut m.z1.q,
            start_inst,
            EMPTY_BEGIN_LINE | EMPTY_BEGIN_TEXT,
        );
        m.z1.flag = FLAG_BOL | FLAG_BOT;
        let enc = m.z1.enc();
        m.start = m.cached(enc);

        m.z1.q.reset();
        add_queue(&m.prog, &mut m.z1.q, start_inst, EMPTY_BEGIN_LINE);
        m.z1.flag = FLAG_BOL;
        let enc = m.z1.enc();
        m.start_line = m.cached(enc);

        Ok(m)
    }

    /// Number of materialized DFA states, for diagnostics.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Look up the state for `enc`, materializing it on a miss.
    fn cached(&mut self, enc: Vec<u8>) -> u32 {
        if let Some(&h) = self.cache.get(&enc) {
            return h;
        }
        let h = self.states.len() as u32;
        self.states.push(DState::new(enc.clone()));
        self.cache.insert(enc, h);
        let match_nl = self.compute_next(h, b'\n' as i32) == DMATCH;
        self.states[h as usize].match_nl = match_nl;
        let match_eot = self.compute_next(h, END_TEXT) == DMATCH;
        self.states[h as usize].match_eot = match_eot;
        h
    }

    /// Compute the DFA state reached from `d` on input `c` (a byte, or
    /// `END_TEXT`).
    fn compute_next(&mut self, d: u32, c: i32) -> u32 {
        let enc = self.states[d as usize].enc.clone();
        self.z1.dec(&enc);

        // flags in effect just before c
        let mut flag = 0u8;
        if self.z1.flag & FLAG_BOL != 0 {
            flag |= EMPTY_BEGIN_LINE;
        }
        if self.z1.flag & FLAG_BOT != 0 {
            flag |= EMPTY_BEGIN_TEXT;
        }
        if (self.z1.flag & FLAG_WORD != 0) != is_word_byte(c) {
            flag |= EMPTY_WORD_BOUNDARY;
        } else {
            flag |= EMPTY_NO_WORD_BOUNDARY;
        }
        if c == b'\n' as i32 {
            flag |= EMPTY_END_LINE;
        }
        if c == END_TEXT {
            flag |= EMPTY_END_LINE | EMPTY_END_TEXT;
        }

        // re-expand the queue under the new flags
        {
            let Matcher { prog, z1, z2, .. } = self;
            z2.q.reset();
            for &id in z1.q.dense() {
                add_queue(prog, &mut z2.q, id, flag);
            }
        }

        // flags in effect just after c
        let mut flag_after = 0u8;
        let mut nflag = 0u32;
        if c == b'\n' as i32 {
            flag_after |= EMPTY_BEGIN_LINE;
            nflag |= FLAG_BOL;
        }
        if is_word_byte(c) {
            nflag |= FLAG_WORD;
        }

        // step the byte, re-seeding the start instruction so the scan
        // is unanchored
        let matched = {
            let Matcher { prog, z1, z2, .. } = self;
            z1.q.reset();
            add_queue(prog, &mut z1.q, prog.start, flag_after);
            let mut matched = false;
            for &id in z2.q.dense() {
                match prog.insts[id as usize] {
                    Inst::Match => matched = true,
                    Inst::ByteRange { lo, hi, fold, out } => {
                        if c == END_TEXT {
                            continue;
                        }
                        let mut ch = c as u32 as u8;
                        if fold && ch.is_ascii_lowercase() {
                            ch = ch.to_ascii_uppercase();
                        }
                        if lo <= ch && ch <= hi {
                            add_queue(prog, &mut z1.q, out, flag_after);
                        }
                    }
                    _ => {}
                }
            }
            matched
        };
        if matched {
            return DMATCH;
        }
        self.z1.flag = nflag;
        self.z1.partial = 0;
        let enc = self.z1.enc();
        self.cached(enc)
    }

    /// Scan `b` for a match.
    ///
    /// Returns the end position of the first match: the index of the
    /// newline ending the matched line, or `b.len()` when the match
    /// runs to the end of the buffer (only reported when `match_nl`,
    /// or `end_text` and the match completes at end of text). Returns
    /// `None` when nothing in `b` matches.
    pub fn matches(&mut self, b: &[u8], begin_text: bool, end_text: bool) -> Option<usize> {
        let mut d = if begin_text { self.start } else { self.start_line };
        for (i, &c) in b.iter().enumerate() {
            let mut d1 = self.states[d as usize].next[c as usize];
            if d1 == NO_STATE {
                if c == b'\n' {
                    if self.states[d as usize].match_nl {
                        return Some(i);
                    }
                    d1 = self.start_line;
                } else {
                    d1 = self.compute_next(d, c as i32);
                }
                self.states[d as usize].next[c as usize] = d1;
            }
            d = d1;
        }
        let ds = &self.states[d as usize];
        if ds.match_nl || (end_text && ds.match_eot) {
            return Some(b.len());
        }
        None
    }
}

/// Add `id` to the queue, expanding through zero-width instructions
/// under the given flags.
fn add_queue(prog: &Prog, q: &mut SparseSet, id: u32, flag: u8) {
    if q.has(id) {
        return;
    }
    q.add(id);
    match prog.insts[id as usize] {
        Inst::Capture { out } | Inst::Nop { out } => add_queue(prog, q, out, flag),
        Inst::Alt { out, arg } => {
            add_queue(prog, q, out, flag);
            add_queue(prog, q, arg, flag);
        }
        Inst::EmptyWidth { op, out } => {
            if op & !flag == 0 {
                add_queue(prog, q, out, flag);
            }
        }
        _ => {}
    }
}

/// ASCII-only word byte, the approximation used for \b and \B; the
/// DFA has one byte of lookahead, and this matches what PCRE does.
fn is_word_byte(c: i32) -> bool {
    if !(0..=255).contains(&c) {
        return false;
    }
    let c = c as u8;
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(pattern: &str) -> Matcher {
        Matcher::from_pattern(pattern).unwrap()
    }

    #[test]
    fn literal_match_end_positions() {
        let mut m = matcher("world");
        // end is the newline terminating the matched line
        assert_eq!(m.matches(b"hello world\n", true, true), Some(11));
        assert_eq!(m.matches(b"hello\nworld\n", true, true), Some(11));
        // no trailing newline: match reported at end of buffer
        assert_eq!(m.matches(b"hello world", true, true), Some(11));
        assert_eq!(m.matches(b"nothing here\n", true, true), None);
    }

    #[test]
    fn match_must_be_within_one_line() {
        let mut m = matcher("ab");
        assert_eq!(m.matches(b"a\nb\n", true, true), None);
        assert_eq!(m.matches(b"xxab\n", true, true), Some(4));
    }

    #[test]
    fn text_anchors() {
        let mut m = matcher("^foo");
        assert_eq!(m.matches(b"foo bar\n", true, true), Some(7));
        // begin_text=false means the buffer starts mid-text
        assert_eq!(m.matches(b"foo bar\n", false, true), None);
        assert_eq!(m.matches(b"bar\nfoo\n", true, true), None);

        let mut m = matcher("bar$");
        assert_eq!(m.matches(b"foo bar", true, true), Some(7));
        assert_eq!(m.matches(b"foo bar", true, false), None);
        assert_eq!(m.matches(b"foo bar\nmore\n", true, true), None);
    }

    #[test]
    fn line_anchors() {
        let mut m = matcher("(?m)^foo");
        assert_eq!(m.matches(b"foo bar\n", true, true), Some(7));
        assert_eq!(m.matches(b"bar\nfoo\n", true, true), Some(7));
        assert_eq!(m.matches(b"xfoo\n", true, true), None);

        let mut m = matcher("(?m)bar$");
        assert_eq!(m.matches(b"foo bar\nmore\n", true, true), Some(7));
        assert_eq!(m.matches(b"bar none\n", true, true), None);
    }

    #[test]
    fn word_boundaries_ascii() {
        let mut m = matcher(r"\bcat\b");
        assert_eq!(m.matches(b"the cat sat\n", true, true), Some(11));
        assert_eq!(m.matches(b"concatenate\n", true, true), None);
        assert_eq!(m.matches(b"cat\n", true, true), Some(3));
    }

    #[test]
    fn alternation_and_classes() {
        let mut m = matcher("colou?r");
        assert_eq!(m.matches(b"color\n", true, true), Some(5));
        assert_eq!(m.matches(b"colour\n", true, true), Some(6));

        let mut m = matcher("[0-9]+px");
        assert_eq!(m.matches(b"width: 42px;\n", true, true), Some(12));
        assert_eq!(m.matches(b"width: px;\n", true, true), None);
    }

    #[test]
    fn case_insensitive() {
        let mut m = matcher("(?i)needle");
        assert_eq!(m.matches(b"say NeEdLe here\n", true, true), Some(15));
        assert_eq!(m.matches(b"nothing\n", true, true), None);
    }

    #[test]
    fn unicode_input() {
        let mut m = matcher("héllo");
        assert_eq!(m.matches("say héllo\n".as_bytes(), true, true), Some(10));
        let mut m = matcher("[α-ω]+");
        assert_eq!(m.matches("abc αβγ xyz\n".as_bytes(), true, true), Some(14));
    }

    #[test]
    fn terminal_state_is_sticky_until_newline() {
        let mut m = matcher("a");
        // match early in a long line still reports that line's end
        assert_eq!(m.matches(b"a and more text\nnext\n", true, true), Some(15));
    }

    #[test]
    fn agrees_with_regex_crate_on_lines() {
        let patterns = [
            "foo", "fo+", "f.o", "foo|bar", r"\bfoo\b", "(?i)foo", "[a-f]{3}", "a.*z",
        ];
        let corpus: &[&str] = &[
            "foo",
            "barfoo",
            "fo",
            "fooo",
            "xfox",
            "FOO",
            "abc def",
            "a to z",
            "bar",
            "   foo   ",
            "fdo",
            "abcdef",
        ];
        for pattern in patterns {
            let mut m = matcher(pattern);
            let re = regex::Regex::new(pattern).unwrap();
            for line in corpus {
                let buf = format!("{}\n", line);
                let want = re.is_match(line);
                let got = m.matches(buf.as_bytes(), true, true).is_some();
                assert_eq!(got, want, "pattern {:?} line {:?}", pattern, line);
            }
        }
    }
}
