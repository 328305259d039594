pub mod key_encoding;
pub use key_encoding::{decode_key, encode_key};

pub mod btree;
pub use btree::BTree;
