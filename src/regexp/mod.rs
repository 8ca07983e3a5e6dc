//! Regular expression matching over candidate files.
//!
//! - [`prog`] - the byte-level NFA program compiled from a parsed regex
//! - [`matcher`] - the lazy DFA that scans file contents
//! - [`grep`] - the chunked line-oriented scan driver

pub mod grep;
pub mod matcher;
pub mod prog;

pub use grep::{Grep, GrepMatch};
pub use matcher::Matcher;
pub use prog::Prog;
