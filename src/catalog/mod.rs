pub mod schema;
pub use schema::{Column, Schema};

pub mod catalog;
pub use catalog::{Catalog, IndexEntry};
