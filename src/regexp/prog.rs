//! Byte-level NFA program.
//!
//! The matcher runs over a classic Thompson construction: a flat
//! instruction array where every consuming instruction is a byte
//! range. Unicode character classes are lowered to alternations of
//! UTF-8 byte-range sequences, so the DFA built on top never needs to
//! decode runes. Zero-width assertions become [`Inst::EmptyWidth`]
//! instructions whose condition is a set of [empty-op flags](EmptyOp)
//! checked against the scan position.

use regex_syntax::hir::{Class, Hir, HirKind, Look};
use regex_syntax::utf8::Utf8Sequences;

use crate::error::{Error, Result};

/// Empty-width conditions, as a bit set.
pub(crate) type EmptyOp = u8;

pub(crate) const EMPTY_BEGIN_LINE: EmptyOp = 1 << 0;
pub(crate) const EMPTY_END_LINE: EmptyOp = 1 << 1;
pub(crate) const EMPTY_BEGIN_TEXT: EmptyOp = 1 << 2;
pub(crate) const EMPTY_END_TEXT: EmptyOp = 1 << 3;
pub(crate) const EMPTY_WORD_BOUNDARY: EmptyOp = 1 << 4;
pub(crate) const EMPTY_NO_WORD_BOUNDARY: EmptyOp = 1 << 5;

/// Placeholder target while a fragment's exits are unpatched.
const NONE: u32 = u32::MAX;

/// Cap on compiled program size; counted repetitions expand.
const MAX_INSTS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inst {
    /// The whole expression matched.
    Match,
    /// Dead end (empty character class).
    Fail,
    /// Consume one byte in `[lo, hi]`. With `fold` set, lowercase
    /// input is folded to uppercase before the range test (ASCII).
    ByteRange { lo: u8, hi: u8, fold: bool, out: u32 },
    /// Proceed only when every condition in `op` holds here.
    EmptyWidth { op: EmptyOp, out: u32 },
    /// Split: try `out`, also try `arg`.
    Alt { out: u32, arg: u32 },
    /// No-op hop.
    Nop { out: u32 },
    /// Capture-group marker; transparent to the DFA.
    Capture { out: u32 },
}

/// A compiled NFA program.
pub struct Prog {
    pub(crate) insts: Vec<Inst>,
    pub(crate) start: u32,
}

impl Prog {
    /// Compile a parsed regular expression into a byte program.
    pub fn compile(hir: &Hir) -> Result<Prog> {
        let mut c = Compiler { insts: Vec::new() };
        let f = c.compile(hir)?;
        let m = c.push(Inst::Match)?;
        c.patch(&f.out, m);
        Ok(Prog {
            insts: c.insts,
            start: f.start,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.insts.len()
    }
}

/// Exit slots of a fragment awaiting their target.
#[derive(Debug, Clone, Copy)]
enum Hole {
    Out(u32),
    Arg(u32),
}

/// A compiled fragment: its entry instruction and dangling exits.
struct Frag {
    start: u32,
    out: Vec<Hole>,
}

struct Compiler {
    insts: Vec<Inst>,
}

impl Compiler {
    fn push(&mut self, inst: Inst) -> Result<u32> {
        if self.insts.len() >= MAX_INSTS {
            return Err(Error::Regex("compiled program too large".to_string()));
        }
        self.insts.push(inst);
        Ok((self.insts.len() - 1) as u32)
    }

    fn patch(&mut self, holes: &[Hole], target: u32) {
        for &h in holes {
            match h {
                Hole::Out(i) => match &mut self.insts[i as usize] {
                    Inst::ByteRange { out, .. }
                    | Inst::EmptyWidth { out, .. }
                    | Inst::Alt { out, .. }
                    | Inst::Nop { out }
                    | Inst::Capture { out } => *out = target,
                    _ => unreachable!("patching non-jump instruction"),
                },
                Hole::Arg(i) => match &mut self.insts[i as usize] {
                    Inst::Alt { arg, .. } => *arg = target,
                    _ => unreachable!("patching non-alt instruction"),
                },
            }
        }
    }

    fn nop(&mut self) -> Result<Frag> {
        let i = self.push(Inst::Nop { out: NONE })?;
        Ok(Frag {
            start: i,
            out: vec![Hole::Out(i)],
        })
    }

    fn byte_range(&mut self, lo: u8, hi: u8) -> Result<Frag> {
        let i = self.push(Inst::ByteRange {
            lo,
            hi,
            fold: false,
            out: NONE,
        })?;
        Ok(Frag {
            start: i,
            out: vec![Hole::Out(i)],
        })
    }

    fn cat(&mut self, f1: Frag, f2: Frag) -> Frag {
        self.patch(&f1.out, f2.start);
        Frag {
            start: f1.start,
            out: f2.out,
        }
    }

    fn alt(&mut self, f1: Frag, f2: Frag) -> Result<Frag> {
        let a = self.push(Inst::Alt {
            out: f1.start,
            arg: f2.start,
        })?;
        let mut out = f1.out;
        out.extend(f2.out);
        Ok(Frag { start: a, out })
    }

    fn compile(&mut self, hir: &Hir) -> Result<Frag> {
        match hir.kind() {
            HirKind::Empty => self.nop(),

            HirKind::Literal(lit) => {
                let mut frag: Option<Frag> = None;
                for &b in lit.0.iter() {
                    let f = self.byte_range(b, b)?;
                    frag = Some(match frag {
                        None => f,
                        Some(prev) => self.cat(prev, f),
                    });
                }
                match frag {
                    Some(f) => Ok(f),
                    None => self.nop(),
                }
            }

            HirKind::Class(Class::Bytes(cls)) => {
                let mut frag: Option<Frag> = None;
                for r in cls.ranges() {
                    let f = self.byte_range(r.start(), r.end())?;
                    frag = Some(match frag {
                        None => f,
                        Some(prev) => self.alt(prev, f)?,
                    });
                }
                match frag {
                    Some(f) => Ok(f),
                    None => self.fail(),
                }
            }

            HirKind::Class(Class::Unicode(cls)) => {
                let mut frag: Option<Frag> = None;
                for r in cls.ranges() {
                    for seq in Utf8Sequences::new(r.start(), r.end()) {
                        let mut sf: Option<Frag> = None;
                        for byte_range in seq.as_slice() {
                            let f = self.byte_range(byte_range.start, byte_range.end)?;
                            sf = Some(match sf {
                                None => f,
                                Some(prev) => self.cat(prev, f),
                            });
                        }
                        let sf = sf.expect("empty UTF-8 sequence");
                        frag = Some(match frag {
                            None => sf,
                            Some(prev) => self.alt(prev, sf)?,
                        });
                    }
                }
                match frag {
                    Some(f) => Ok(f),
                    None => self.fail(),
                }
            }

            HirKind::Look(look) => {
                let op = look_op(*look);
                let i = self.push(Inst::EmptyWidth { op, out: NONE })?;
                Ok(Frag {
                    start: i,
                    out: vec![Hole::Out(i)],
                })
            }

            HirKind::Capture(cap) => {
                let i = self.push(Inst::Capture { out: NONE })?;
                let f = self.compile(&cap.sub)?;
                self.patch(&[Hole::Out(i)], f.start);
                Ok(Frag {
                    start: i,
                    out: f.out,
                })
            }

            HirKind::Concat(subs) => {
                let mut frag: Option<Frag> = None;
                for sub in subs {
                    let f = self.compile(sub)?;
                    frag = Some(match frag {
                        None => f,
                        Some(prev) => self.cat(prev, f),
                    });
                }
                match frag {
                    Some(f) => Ok(f),
                    None => self.nop(),
                }
            }

            HirKind::Alternation(subs) => {
                let mut frag: Option<Frag> = None;
                for sub in subs {
                    let f = self.compile(sub)?;
                    frag = Some(match frag {
                        None => f,
                        Some(prev) => self.alt(prev, f)?,
                    });
                }
                match frag {
                    Some(f) => Ok(f),
                    None => self.fail(),
                }
            }

            HirKind::Repetition(rep) => {
                let min = rep.min as usize;
                match rep.max {
                    None => {
                        if min == 0 {
                            self.star(&rep.sub)
                        } else {
                            // x{n,} = n-1 copies, then x+
                            let mut frag: Option<Frag> = None;
                            for _ in 0..min - 1 {
                                let f = self.compile(&rep.sub)?;
                                frag = Some(match frag {
                                    None => f,
                                    Some(prev) => self.cat(prev, f),
                                });
                            }
                            let plus = self.plus(&rep.sub)?;
                            Ok(match frag {
                                None => plus,
                                Some(prev) => self.cat(prev, plus),
                            })
                        }
                    }
                    Some(max) => {
                        let max = max as usize;
                        if max == 0 {
                            return self.nop();
                        }
                        // x{m,n} = m copies, then n-m nested optionals
                        let mut frag: Option<Frag> = None;
                        for _ in 0..min {
                            let f = self.compile(&rep.sub)?;
                            frag = Some(match frag {
                                None => f,
                                Some(prev) => self.cat(prev, f),
                            });
                        }
                        if max > min {
                            let opt = self.counted_quest(&rep.sub, max - min)?;
                            frag = Some(match frag {
                                None => opt,
                                Some(prev) => self.cat(prev, opt),
                            });
                        }
                        match frag {
                            Some(f) => Ok(f),
                            None => self.nop(),
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self) -> Result<Frag> {
        let i = self.push(Inst::Fail)?;
        Ok(Frag {
            start: i,
            out: Vec::new(),
        })
    }

    fn star(&mut self, sub: &Hir) -> Result<Frag> {
        let a = self.push(Inst::Alt {
            out: NONE,
            arg: NONE,
        })?;
        let f = self.compile(sub)?;
        self.patch(&[Hole::Out(a)], f.start);
        self.patch(&f.out, a);
        Ok(Frag {
            start: a,
            out: vec![Hole::Arg(a)],
        })
    }

    fn plus(&mut self, sub: &Hir) -> Result<Frag> {
        let f = self.compile(sub)?;
        let a = self.push(Inst::Alt {
            out: f.start,
            arg: NONE,
        })?;
        self.patch(&f.out, a);
        Ok(Frag {
            start: f.start,
            out: vec![Hole::Arg(a)],
        })
    }

    /// `(x (x ...)?)?` nested `n` deep.
    fn counted_quest(&mut self, sub: &Hir, n: usize) -> Result<Frag> {
        let mut holes = Vec::new();
        let mut first: Option<u32> = None;
        let mut prev_out: Vec<Hole> = Vec::new();
        for _ in 0..n {
            let a = self.push(Inst::Alt {
                out: NONE,
                arg: NONE,
            })?;
            let f = self.compile(sub)?;
            self.patch(&[Hole::Out(a)], f.start);
            if first.is_none() {
                first = Some(a);
            } else {
                self.patch(&prev_out, a);
            }
            holes.push(Hole::Arg(a));
            prev_out = f.out;
        }
        holes.extend(prev_out);
        Ok(Frag {
            start: first.expect("counted_quest of zero"),
            out: holes,
        })
    }
}

fn look_op(look: Look) -> EmptyOp {
    match look {
        Look::Start => EMPTY_BEGIN_TEXT,
        Look::End => EMPTY_END_TEXT,
        Look::StartLF | Look::StartCRLF => EMPTY_BEGIN_LINE,
        Look::EndLF | Look::EndCRLF => EMPTY_END_LINE,
        // Word boundaries are ASCII-only in the matcher; Unicode
        // variants get the same approximation, and the word-start and
        // word-end refinements widen to a plain boundary.
        Look::WordAsciiNegate | Look::WordUnicodeNegate => EMPTY_NO_WORD_BOUNDARY,
        _ => EMPTY_WORD_BOUNDARY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(pattern: &str) -> Prog {
        Prog::compile(&regex_syntax::parse(pattern).unwrap()).unwrap()
    }

    #[test]
    fn literal_chain() {
        let p = compile("abc");
        // three byte ranges and a match
        let ranges = p
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::ByteRange { .. }))
            .count();
        assert_eq!(ranges, 3);
        assert!(p.insts.contains(&Inst::Match));
    }

    #[test]
    fn no_dangling_targets() {
        for pattern in [
            "a", "abc", "a|b", "a*", "a+", "a?", "a{2,5}", "a{3}", "a{2,}", "[a-m]",
            "(ab)+c", "^a$", r"\bword\b", "[^a]", "日本語", ".", "(?s).",
        ] {
            let p = compile(pattern);
            for (idx, inst) in p.insts.iter().enumerate() {
                let targets: Vec<u32> = match *inst {
                    Inst::ByteRange { out, .. }
                    | Inst::EmptyWidth { out, .. }
                    | Inst::Nop { out }
                    | Inst::Capture { out } => vec![out],
                    Inst::Alt { out, arg } => vec![out, arg],
                    Inst::Match | Inst::Fail => vec![],
                };
                for t in targets {
                    assert!(
                        (t as usize) < p.insts.len(),
                        "{}: inst {} has dangling target {}",
                        pattern,
                        idx,
                        t
                    );
                }
            }
            assert!((p.start as usize) < p.insts.len());
        }
    }

    #[test]
    fn counted_repetition_expands() {
        let p3 = compile("a{3}");
        let ranges = |p: &Prog| {
            p.insts
                .iter()
                .filter(|i| matches!(i, Inst::ByteRange { .. }))
                .count()
        };
        assert_eq!(ranges(&p3), 3);
        let p25 = compile("a{2,5}");
        assert_eq!(ranges(&p25), 5);
    }

    #[test]
    fn unicode_class_lowers_to_bytes() {
        // every consuming instruction must be a byte range even for
        // multi-byte scripts
        let p = compile("[α-ω]");
        assert!(p
            .insts
            .iter()
            .any(|i| matches!(i, Inst::ByteRange { lo, .. } if *lo >= 0x80)));
    }
}
