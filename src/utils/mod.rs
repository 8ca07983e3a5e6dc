pub mod encoding;
pub mod sparse;

pub use encoding::*;
pub use sparse::SparseSet;
