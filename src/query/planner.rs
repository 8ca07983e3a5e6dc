//! Lowering a parsed regular expression to a trigram query.
//!
//! For every subexpression the analysis tracks a small summary: the
//! exact set of strings it can match (while that stays small), the
//! sets of possible match prefixes and suffixes once it cannot, and a
//! trigram query that any containing file must satisfy. The summaries
//! compose across concatenation and alternation; repetition and large
//! character classes collapse them toward "anything". Whenever a set
//! is about to be trimmed, its trigrams are first harvested into the
//! match query, so information is moved, not lost.
//!
//! The algorithm follows Cox, "Regular Expression Matching with a
//! Trigram Index". The resulting query errs only toward matching too
//! many files; the DFA scan of each candidate removes the false
//! positives.

use regex_syntax::hir::{Class, Hir, HirKind};

use crate::query::{min_len, Query};

/// Exact sets bigger than this are rewritten into prefix/suffix form.
const MAX_EXACT: usize = 7;

/// Prefix and suffix sets bigger than this are trimmed. 20 is enough
/// to keep the 2^3 = 8 strings of a short case-folded literal intact.
const MAX_SET: usize = 20;

/// Large character classes are not enumerated.
const MAX_CLASS: usize = 100;

/// A sorted set of byte strings. Suffix sets order by reversed bytes
/// so that redundancy pruning can compare neighbors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StringSet(Vec<Vec<u8>>);

impl StringSet {
    fn one(s: Vec<u8>) -> StringSet {
        StringSet(vec![s])
    }

    fn empty_string() -> StringSet {
        StringSet(vec![Vec::new()])
    }

    fn add(&mut self, s: Vec<u8>) {
        self.0.push(s);
    }

    fn size(&self) -> usize {
        self.0.len()
    }

    fn min_len(&self) -> usize {
        min_len(&self.0)
    }

    fn contains_empty(&self) -> bool {
        self.0.iter().any(|s| s.is_empty())
    }

    pub(crate) fn strings(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Sort and deduplicate. Suffix sets sort by reversed bytes.
    fn clean(&mut self, is_suffix: bool) {
        if is_suffix {
            self.0.sort_by(|a, b| a.iter().rev().cmp(b.iter().rev()));
        } else {
            self.0.sort();
        }
        self.0.dedup();
    }

    fn union(mut self, other: StringSet, is_suffix: bool) -> StringSet {
        self.0.extend(other.0);
        self.clean(is_suffix);
        self
    }

    /// All concatenations of one string from self and one from `t`.
    /// In suffix position the argument strings come first.
    fn cross(&self, t: &StringSet, is_suffix: bool) -> StringSet {
        let mut p = StringSet::default();
        for ss in &self.0 {
            for tt in &t.0 {
                let mut s = Vec::with_capacity(ss.len() + tt.len());
                if !is_suffix {
                    s.extend_from_slice(ss);
                    s.extend_from_slice(tt);
                } else {
                    s.extend_from_slice(tt);
                    s.extend_from_slice(ss);
                }
                p.add(s);
            }
        }
        p.clean(is_suffix);
        p
    }
}

/// Match-set summary of one subexpression.
#[derive(Debug, Clone)]
pub struct RegexpInfo {
    /// Whether the subexpression matches the empty string.
    can_empty: bool,
    /// The exact set of matching strings, while it stays small.
    exact: Option<StringSet>,
    /// When `exact` is gone: possible match prefixes and suffixes.
    prefix: StringSet,
    suffix: StringSet,
    /// Query that must be satisfied by any file containing a match.
    match_q: Query,
}

/// Matches any string.
fn any_match() -> RegexpInfo {
    RegexpInfo {
        can_empty: true,
        exact: None,
        prefix: StringSet::empty_string(),
        suffix: StringSet::empty_string(),
        match_q: Query::all(),
    }
}

/// Matches any single character.
fn any_char() -> RegexpInfo {
    RegexpInfo {
        can_empty: false,
        exact: None,
        prefix: StringSet::empty_string(),
        suffix: StringSet::empty_string(),
        match_q: Query::all(),
    }
}

/// Matches no strings at all.
fn no_match() -> RegexpInfo {
    RegexpInfo {
        can_empty: false,
        exact: None,
        prefix: StringSet::default(),
        suffix: StringSet::default(),
        match_q: Query::none(),
    }
}

/// Matches only the empty string.
fn empty_string() -> RegexpInfo {
    RegexpInfo {
        can_empty: true,
        exact: Some(StringSet::empty_string()),
        prefix: StringSet::default(),
        suffix: StringSet::default(),
        match_q: Query::all(),
    }
}

impl RegexpInfo {
    fn can_match_empty(&self) -> bool {
        match &self.exact {
            Some(e) => e.contains_empty(),
            None => self.can_empty,
        }
    }

    /// AND the trigrams of the exact set into the match query.
    fn add_exact(&mut self) {
        if let Some(exact) = &self.exact {
            let q = std::mem::replace(&mut self.match_q, Query::all());
            self.match_q = q.and_trigrams(exact.strings());
        }
    }

    /// Rewrite an oversized (or force-retired) exact set into prefix
    /// and suffix form, harvesting its trigrams first.
    fn simplify(&mut self, force: bool) {
        let convert = match &mut self.exact {
            Some(exact) => {
                exact.clean(false);
                exact.size() > MAX_EXACT
                    || (exact.min_len() >= 3 && force)
                    || exact.min_len() >= 4
            }
            None => false,
        };
        if convert {
            self.can_empty = self.exact.as_ref().unwrap().contains_empty();
            self.add_exact();
            let exact = self.exact.take().unwrap();
            for s in exact.0 {
                let n = s.len();
                if n < 3 {
                    self.prefix.add(s.clone());
                    self.suffix.add(s);
                } else {
                    self.prefix.add(s[..2].to_vec());
                    self.suffix.add(s[n - 2..].to_vec());
                }
            }
        }

        if self.exact.is_none() {
            simplify_set(&mut self.match_q, &mut self.prefix, false);
            simplify_set(&mut self.match_q, &mut self.suffix, true);
        }
    }
}

/// Trim a prefix or suffix set to at most `MAX_SET` strings of at most
/// 2 bytes, moving the trigram information it carries into the match
/// query first.
fn simplify_set(match_q: &mut Query, s: &mut StringSet, is_suffix: bool) {
    s.clean(is_suffix);

    let q = std::mem::replace(match_q, Query::all());
    *match_q = q.and_trigrams(s.strings());

    let mut n = 3usize;
    while n == 3 || s.size() > MAX_SET {
        // replace the set by the prefixes (or suffixes) of length n-1
        for str in &mut s.0 {
            if str.len() >= n {
                if !is_suffix {
                    str.truncate(n - 1);
                } else {
                    *str = str[str.len() - (n - 1)..].to_vec();
                }
            }
        }
        s.clean(is_suffix);
        if n == 1 {
            break;
        }
        n -= 1;
    }

    // Drop entries made redundant by a shorter neighbor: knowing "ab"
    // is a possible prefix makes "abc" useless.
    let mut out: Vec<Vec<u8>> = Vec::with_capacity(s.0.len());
    for str in s.0.drain(..) {
        let redundant = match out.last() {
            Some(prev) if !is_suffix => str.starts_with(prev.as_slice()),
            Some(prev) => str.ends_with(prev.as_slice()),
            None => false,
        };
        if !redundant {
            out.push(str);
        }
    }
    s.0 = out;
}

/// Compute the summary for the concatenation `xy`.
fn concat(x: RegexpInfo, y: RegexpInfo) -> RegexpInfo {
    let mut xy = no_match();
    xy.can_empty = x.can_match_empty() && y.can_match_empty();
    xy.match_q = x.match_q.clone().and(y.match_q.clone());

    match (&x.exact, &y.exact) {
        (Some(xe), Some(ye)) => {
            xy.exact = Some(xe.cross(ye, false));
        }
        _ => {
            if let Some(xe) = &x.exact {
                xy.prefix = xe.cross(&y.prefix, false);
            } else {
                xy.prefix = x.prefix.clone();
                if x.can_match_empty() {
                    xy.prefix = xy.prefix.union(y.prefix.clone(), false);
                }
            }
            if let Some(ye) = &y.exact {
                xy.suffix = ye.cross(&x.suffix, true);
            } else {
                xy.suffix = y.suffix.clone();
                if y.can_match_empty() {
                    xy.suffix = xy.suffix.union(x.suffix.clone(), true);
                }
            }
        }
    }

    // If the strings spanning the boundary are all long enough, one of
    // their trigrams must be present; neither xy.prefix nor xy.suffix
    // accounts for it.
    if x.exact.is_none()
        && y.exact.is_none()
        && x.suffix.size() <= MAX_SET
        && y.prefix.size() <= MAX_SET
        && x.suffix.min_len() + y.prefix.min_len() >= 3
    {
        let q = std::mem::replace(&mut xy.match_q, Query::all());
        xy.match_q = q.and_trigrams(x.suffix.cross(&y.prefix, false).strings());
    }

    xy.simplify(false);
    xy
}

/// Compute the summary for the alternation `x|y`.
fn alternate(mut x: RegexpInfo, mut y: RegexpInfo) -> RegexpInfo {
    let mut xy = no_match();
    xy.can_empty = x.can_match_empty() || y.can_match_empty();

    match (x.exact.clone(), y.exact.clone()) {
        (Some(xe), Some(ye)) => {
            xy.exact = Some(xe.union(ye, false));
        }
        (Some(xe), None) => {
            xy.prefix = xe.clone().union(y.prefix.clone(), false);
            xy.suffix = xe.union(y.suffix.clone(), true);
            x.add_exact();
        }
        (None, Some(ye)) => {
            xy.prefix = x.prefix.clone().union(ye.clone(), false);
            xy.suffix = x.suffix.clone().union(ye, true);
            y.add_exact();
        }
        (None, None) => {
            xy.prefix = x.prefix.clone().union(y.prefix.clone(), false);
            xy.suffix = x.suffix.clone().union(y.suffix.clone(), true);
        }
    }
    xy.match_q = x.match_q.or(y.match_q);

    xy.simplify(false);
    xy
}

/// Analyze one subexpression.
fn analyze(hir: &Hir) -> RegexpInfo {
    match hir.kind() {
        HirKind::Empty => empty_string(),

        HirKind::Look(_) => {
            // Anchors and word boundaries are zero-width: they
            // constrain positions, not content.
            empty_string()
        }

        HirKind::Literal(lit) => {
            if lit.0.is_empty() {
                return empty_string();
            }
            let mut info = no_match();
            info.exact = Some(StringSet::one(lit.0.to_vec()));
            info.match_q = Query::all();
            info.simplify(false);
            info
        }

        HirKind::Class(class) => analyze_class(class),

        HirKind::Capture(cap) => analyze(&cap.sub),

        HirKind::Concat(subs) => fold(concat, subs, empty_string),

        HirKind::Alternation(subs) => fold(alternate, subs, no_match),

        HirKind::Repetition(rep) => {
            if rep.min == 0 && rep.max == Some(1) {
                // x? - union with the empty string
                return alternate(analyze(&rep.sub), empty_string());
            }
            if rep.min == 0 {
                // x* and x{0,n} - assume the worst
                return any_match();
            }
            // x+ and x{n,}: there is at least one x, so prefixes and
            // suffixes survive, but exactness does not.
            let mut info = analyze(&rep.sub);
            if let Some(exact) = info.exact.take() {
                info.can_empty = exact.contains_empty();
                info.prefix = exact.clone();
                info.suffix = exact;
            }
            info.simplify(false);
            info
        }
    }
}

fn analyze_class(class: &Class) -> RegexpInfo {
    let mut count = 0usize;
    match class {
        Class::Unicode(cls) => {
            for r in cls.ranges() {
                count += (r.end() as usize) - (r.start() as usize) + 1;
                if count > MAX_CLASS {
                    return any_char();
                }
            }
            if count == 0 {
                return no_match();
            }
            let mut exact = StringSet::default();
            for r in cls.ranges() {
                let mut c = r.start() as u32;
                while c <= r.end() as u32 {
                    if let Some(ch) = char::from_u32(c) {
                        let mut buf = [0u8; 4];
                        exact.add(ch.encode_utf8(&mut buf).as_bytes().to_vec());
                    }
                    c += 1;
                }
            }
            let mut info = no_match();
            info.exact = Some(exact);
            info.match_q = Query::all();
            info.simplify(false);
            info
        }
        Class::Bytes(cls) => {
            for r in cls.ranges() {
                count += (r.end() as usize) - (r.start() as usize) + 1;
                if count > MAX_CLASS {
                    return any_char();
                }
            }
            if count == 0 {
                return no_match();
            }
            let mut exact = StringSet::default();
            for r in cls.ranges() {
                for b in r.start()..=r.end() {
                    exact.add(vec![b]);
                }
            }
            let mut info = no_match();
            info.exact = Some(exact);
            info.match_q = Query::all();
            info.simplify(false);
            info
        }
    }
}

fn fold(
    f: fn(RegexpInfo, RegexpInfo) -> RegexpInfo,
    subs: &[Hir],
    zero: fn() -> RegexpInfo,
) -> RegexpInfo {
    match subs.len() {
        0 => zero(),
        1 => analyze(&subs[0]),
        _ => {
            let mut info = f(analyze(&subs[0]), analyze(&subs[1]));
            for sub in &subs[2..] {
                info = f(info, analyze(sub));
            }
            info
        }
    }
}

/// Lower a parsed regular expression to the trigram query that every
/// file containing a match must satisfy.
///
/// The query is a conservative over-approximation: files it selects
/// still need to be scanned by the matcher, but files it rejects
/// cannot contain a match (up to the documented ASCII word-boundary
/// approximation).
pub fn regexp_query(hir: &Hir) -> Query {
    let mut info = analyze(hir);
    info.simplify(true);
    info.add_exact();
    info.match_q.simplify()
}
