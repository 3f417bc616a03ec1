mod common;
mod hash_page;

pub use common::CommonCodec;
pub use hash_page::{HashTableBucketPageCodec, HashTableDirectoryPageCodec};

/// A decoded value together with the number of bytes consumed.
pub type DecodedData<T> = (T, usize);
