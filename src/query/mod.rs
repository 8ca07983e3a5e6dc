//! Boolean trigram queries.
//!
//! A [`Query`] conservatively over-approximates a regex: it is a
//! formula over literal 3-grams that must be satisfied by any file
//! containing a match. The smart constructors [`Query::and`] and
//! [`Query::or`] keep the formula small: trivial operands collapse,
//! single-trigram atoms merge into their parent's trigram set,
//! implication prunes redundant operands, and an AND of ORs (or OR of
//! ANDs) factors out common trigrams.

pub mod planner;

pub use planner::{regexp_query, RegexpInfo};

use std::fmt;

use crate::index::types::Trigram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    All,  // everything matches
    None, // nothing matches
    And,  // all of the trigrams and subqueries must match
    Or,   // at least one of the trigrams or subqueries must match
}

/// A boolean formula over literal trigrams.
///
/// `trigram` is kept sorted and deduplicated; both it and `sub` are
/// interpreted under `op`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub op: QueryOp,
    pub trigram: Vec<Vec<u8>>,
    pub sub: Vec<Query>,
}

impl Query {
    pub fn all() -> Query {
        Query {
            op: QueryOp::All,
            trigram: Vec::new(),
            sub: Vec::new(),
        }
    }

    pub fn none() -> Query {
        Query {
            op: QueryOp::None,
            trigram: Vec::new(),
            sub: Vec::new(),
        }
    }

    pub(crate) fn trigrams(op: QueryOp, trigram: Vec<Vec<u8>>) -> Query {
        Query {
            op,
            trigram,
            sub: Vec::new(),
        }
    }

    /// The query matching exactly when both operands match.
    pub fn and(self, r: Query) -> Query {
        self.and_or(r, QueryOp::And)
    }

    /// The query matching exactly when either operand matches.
    pub fn or(self, r: Query) -> Query {
        self.and_or(r, QueryOp::Or)
    }

    fn and_or(mut self, mut r: Query, op: QueryOp) -> Query {
        if self.trigram.is_empty() && self.sub.len() == 1 {
            self = self.sub.pop().unwrap();
        }
        if r.trigram.is_empty() && r.sub.len() == 1 {
            r = r.sub.pop().unwrap();
        }

        // Boolean simplification: if q implies r, then q AND r == q
        // and q OR r == r.
        if self.implies(&r) {
            return if op == QueryOp::And { self } else { r };
        }
        if r.implies(&self) {
            return if op == QueryOp::And { r } else { self };
        }

        // Both sides are And/Or nodes now. If they match the target op
        // (or are single-trigram atoms), merge them.
        let q_atom = self.trigram.len() == 1 && self.sub.is_empty();
        let r_atom = r.trigram.len() == 1 && r.sub.is_empty();
        if self.op == op && (r.op == op || r_atom) {
            self.trigram = union_sets(std::mem::take(&mut self.trigram), r.trigram);
            self.sub.append(&mut r.sub);
            return self;
        }
        if r.op == op && q_atom {
            r.trigram = union_sets(std::mem::take(&mut r.trigram), self.trigram);
            return r;
        }
        if q_atom && r_atom {
            self.op = op;
            self.trigram = union_sets(std::mem::take(&mut self.trigram), r.trigram);
            return self;
        }

        // If one side already has the target op, absorb the other.
        if self.op == op {
            self.sub.push(r);
            return self;
        }
        if r.op == op {
            r.sub.push(self);
            return r;
        }

        // We are building an AND of ORs or an OR of ANDs. Factor out
        // the common trigrams:
        //   (abc|def|ghi) AND (abc|def|jkl) == (abc|def) OR (ghi AND jkl)
        //   (abc&def&ghi) OR  (abc&def&jkl) == (abc&def) AND (ghi OR jkl)
        let mut common = Vec::new();
        let mut qt = Vec::new();
        let mut rt = Vec::new();
        {
            let mut qi = self.trigram.drain(..).peekable();
            let mut ri = r.trigram.drain(..).peekable();
            loop {
                match (qi.peek(), ri.peek()) {
                    (Some(a), Some(b)) => {
                        if a < b {
                            qt.push(qi.next().unwrap());
                        } else if a > b {
                            rt.push(ri.next().unwrap());
                        } else {
                            common.push(qi.next().unwrap());
                            ri.next();
                        }
                    }
                    (Some(_), None) => qt.push(qi.next().unwrap()),
                    (None, Some(_)) => rt.push(ri.next().unwrap()),
                    (None, None) => break,
                }
            }
        }
        self.trigram = qt;
        r.trigram = rt;
        if !common.is_empty() {
            let s = self.and_or(r, op);
            let other = if op == QueryOp::And {
                QueryOp::Or
            } else {
                QueryOp::And
            };
            let t = Query::trigrams(other, common);
            return t.and_or(s, other);
        }

        Query {
            op,
            trigram: Vec::new(),
            sub: vec![self, r],
        }
    }

    /// Report whether self implies r. False negatives are fine; false
    /// positives are not.
    fn implies(&self, r: &Query) -> bool {
        if self.op == QueryOp::None || r.op == QueryOp::All {
            // False implies everything; everything implies True.
            return true;
        }
        if self.op == QueryOp::All || r.op == QueryOp::None {
            // True implies nothing; nothing implies False.
            return false;
        }

        if self.op == QueryOp::And
            || (self.op == QueryOp::Or && self.trigram.len() == 1 && self.sub.is_empty())
        {
            return trigrams_imply(&self.trigram, r);
        }

        self.op == QueryOp::Or
            && r.op == QueryOp::Or
            && !self.trigram.is_empty()
            && self.sub.is_empty()
            && is_subset(&self.trigram, &r.trigram)
    }

    /// AND this query with the requirement that one of the strings in
    /// `t` is present, expressed through each string's trigrams. If
    /// any string is too short to own a trigram, no requirement can be
    /// made and the query is unchanged.
    pub(crate) fn and_trigrams(self, t: &[Vec<u8>]) -> Query {
        if min_len(t) < 3 {
            return self;
        }
        let mut or = Query::none();
        for tt in t {
            let mut trig: Vec<Vec<u8>> = tt.windows(3).map(|w| w.to_vec()).collect();
            trig.sort();
            trig.dedup();
            or = or.or(Query::trigrams(QueryOp::And, trig));
        }
        self.and(or)
    }

    /// Final cleanup: empty AND is ALL, empty OR is NONE, and a
    /// single-child wrapper is replaced by its child.
    pub fn simplify(mut self) -> Query {
        if self.op == QueryOp::And || self.op == QueryOp::Or {
            self.sub = self.sub.into_iter().map(Query::simplify).collect();
            if self.sub.is_empty() && self.trigram.is_empty() {
                self.op = if self.op == QueryOp::And {
                    QueryOp::All
                } else {
                    QueryOp::None
                };
            } else if self.sub.len() == 1 && self.trigram.is_empty() {
                return self.sub.pop().unwrap();
            }
        }
        self
    }

    /// The trigram set as packed 24-bit values.
    pub fn trigram_values(&self) -> impl Iterator<Item = Trigram> + '_ {
        self.trigram
            .iter()
            .map(|t| (t[0] as u32) << 16 | (t[1] as u32) << 8 | t[2] as u32)
    }
}

fn trigrams_imply(t: &[Vec<u8>], q: &Query) -> bool {
    match q.op {
        QueryOp::Or => {
            if q.sub.iter().any(|qq| trigrams_imply(t, qq)) {
                return true;
            }
            t.iter().any(|tt| q.trigram.binary_search(tt).is_ok())
        }
        QueryOp::And => {
            if !q.sub.iter().all(|qq| trigrams_imply(t, qq)) {
                return false;
            }
            is_subset(&q.trigram, t)
        }
        _ => false,
    }
}

/// Merge two sorted sets, deduplicating.
pub(crate) fn union_sets(mut a: Vec<Vec<u8>>, b: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    a.extend(b);
    a.sort();
    a.dedup();
    a
}

/// Whether sorted set `a` is a subset of sorted set `b`.
fn is_subset(a: &[Vec<u8>], b: &[Vec<u8>]) -> bool {
    let mut i = 0;
    for x in a {
        while i < b.len() && b[i] < *x {
            i += 1;
        }
        if i >= b.len() || b[i] != *x {
            return false;
        }
        i += 1;
    }
    true
}

pub(crate) fn min_len(t: &[Vec<u8>]) -> usize {
    t.iter().map(|s| s.len()).min().unwrap_or(0)
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            QueryOp::None => return write!(f, "-"),
            QueryOp::All => return write!(f, "+"),
            _ => {}
        }
        if self.sub.is_empty() && self.trigram.len() == 1 {
            return write!(f, "\"{}\"", self.trigram[0].escape_ascii());
        }
        let (open, sjoin, tjoin, close) = match self.op {
            QueryOp::And => ("", " ", " ", ""),
            _ => ("(", ")|(", "|", ")"),
        };
        write!(f, "{}", open)?;
        for (i, t) in self.trigram.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", tjoin)?;
            }
            write!(f, "\"{}\"", t.escape_ascii())?;
        }
        if !self.sub.is_empty() {
            if !self.trigram.is_empty() {
                write!(f, "{}", sjoin)?;
            }
            for (i, s) in self.sub.iter().enumerate() {
                if i > 0 {
                    write!(f, "{}", sjoin)?;
                }
                write!(f, "{}", s)?;
            }
        }
        write!(f, "{}", close)
    }
}
