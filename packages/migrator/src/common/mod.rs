pub mod fs;
pub mod hash;
pub mod keys;

pub use hash::{hash_row_string, index_hash};
pub use keys::*;
