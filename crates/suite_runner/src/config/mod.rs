//! Suite file parsing and substitution

mod substitution;
mod suite_file;

pub use substitution::*;
pub use suite_file::*;
