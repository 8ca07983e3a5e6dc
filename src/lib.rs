//! # TGX - Trigram-Indexed Regexp Search
//!
//! TGX answers regular-expression queries over large source trees
//! without rescanning every file: an on-disk inverted index maps each
//! 3-byte substring ("trigram") to the files containing it, a planner
//! reduces the regex to a boolean query over trigrams that
//! conservatively over-approximates the matching files, and a lazy
//! DFA scans only the surviving candidates.
//!
//! ## Architecture
//!
//! - [`index`] - the memory-mappable index file: writer, reader,
//!   merger, and structural checker
//! - [`query`] - trigram queries and the regex-to-trigram planner
//! - [`regexp`] - the byte NFA program, the lazy DFA matcher, and the
//!   grep driver
//! - [`utils`] - sparse sets and varint encoding shared by the layers
//!
//! ## Quick start
//!
//! ```no_run
//! use tgx::{Grep, Index, IndexWriter, Matcher, Version};
//!
//! # fn main() -> tgx::Result<()> {
//! // Build an index.
//! let mut w = IndexWriter::create("code.idx", Version::V2)?;
//! w.add_file("src/lib.rs")?;
//! w.flush()?;
//!
//! // Plan a regex down to candidate files.
//! let hir = regex_syntax::parse(r"fn\s+main").unwrap();
//! let ix = Index::open("code.idx")?;
//! let candidates = ix.posting_query(&tgx::regexp_query(&hir))?;
//!
//! // Scan the candidates.
//! let mut m = Matcher::new(&hir)?;
//! let mut g = Grep::new();
//! for fileid in candidates {
//!     let name = ix.name(fileid)?.to_string();
//!     g.file(&mut m, &name, &mut |rec| println!("{}: {:?}", rec.name, rec.line))?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Updating an index
//!
//! Index files are written once and never modified. To pick up
//! changes, build a small index for the changed roots and
//! [`merge`](index::merge) it with the previous index into a fresh
//! file, then replace the old file atomically by rename: files under
//! the newer index's roots shadow the older index's entries.

pub mod error;
pub mod index;
pub mod query;
pub mod regexp;
pub mod utils;

pub use error::{Error, Result};
pub use index::{default_index_file, merge, Index, IndexWriter, Path, Version};
pub use query::{regexp_query, Query, QueryOp};
pub use regexp::{Grep, GrepMatch, Matcher};
